//! Named release actions and ordered teardown.

use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

type Release = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A name plus the action that releases it. Releasing twice is a no-op.
pub struct Resource {
    name: String,
    release: Mutex<Option<Release>>,
}

impl Resource {
    pub fn new<F, Fut>(name: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            release: Mutex::new(Some(Box::new(move || Box::pin(release())))),
        }
    }

    pub fn noop(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            release: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn close(&self) -> Result<()> {
        let release = self.release.lock().await.take();
        match release {
            Some(release) => release().await,
            None => Ok(()),
        }
    }

    pub async fn is_released(&self) -> bool {
        self.release.lock().await.is_none()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("name", &self.name).finish()
    }
}

/// Release every resource in order. A failure is logged and collected, never short-circuits.
pub async fn close_all(resources: &[Resource]) -> Result<()> {
    let mut failures = Vec::new();
    for resource in resources {
        if let Err(e) = resource.close().await {
            tracing::warn!(resource = %resource.name, "Failed to close resource: {}", e);
            failures.push(format!("{}: {}", resource.name, e));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Close(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    fn recording(name: &str, log: Arc<StdMutex<Vec<String>>>, fail: bool) -> Resource {
        let owned = name.to_string();
        Resource::new(name, move || async move {
            log.lock().unwrap().push(owned.clone());
            if fail {
                Err(Error::Unavailable(owned))
            } else {
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_close_all_runs_in_order_and_aggregates() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let resources = vec![
            recording("a", log.clone(), false),
            recording("b", log.clone(), true),
            recording("c", log.clone(), false),
            recording("d", log.clone(), true),
        ];

        let err = close_all(&resources).await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c", "d"]);
        match err {
            Error::Close(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("b:"));
                assert!(failures[1].starts_with("d:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_close_all_twice_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let resources: Vec<Resource> = (0..3)
            .map(|i| {
                let count = count.clone();
                Resource::new(format!("r{i}"), move || async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        tokio_test::assert_ok!(close_all(&resources).await);
        tokio_test::assert_ok!(close_all(&resources).await);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        for resource in &resources {
            assert!(resource.is_released().await);
        }
    }

    #[tokio::test]
    async fn test_failed_release_is_not_retried() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let resources = vec![recording("flaky", log.clone(), true)];

        assert!(close_all(&resources).await.is_err());
        assert!(close_all(&resources).await.is_ok());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_noop_resource() {
        let resource = Resource::noop("nothing");
        assert_eq!(resource.name(), "nothing");
        assert!(resource.is_released().await);
        assert!(resource.close().await.is_ok());
    }
}
