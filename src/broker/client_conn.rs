use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Broker, BrokerId, Invoke, ResourceBroker, ServiceConn};
use crate::error::Result;
use crate::resource::{close_all, Resource};

type DialFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(BrokerId, Vec<Resource>)>> + Send + Sync>;

struct Dialed {
    conn: ServiceConn,
    deps: Vec<Resource>,
}

/// A connection that resolves its target lazily through the broker's current session.
///
/// The target is established on first use and re-established whenever the cached handle
/// belongs to a closed session or a call fails with a transport-class error. Each
/// re-resolution releases the dependencies of the previous one first.
///
/// A failed call is sent again only when the target was never reached (unknown service id
/// or no session). A call cut off mid-flight may already have run, so its error is returned
/// and only the next call re-resolves.
pub struct ClientConn {
    name: String,
    broker: Arc<Broker>,
    dial_fn: DialFn,
    current: Mutex<Option<Dialed>>,
}

impl ClientConn {
    pub(crate) fn new<F, Fut>(name: impl Into<String>, broker: Arc<Broker>, dial_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(BrokerId, Vec<Resource>)>> + Send + 'static,
    {
        Self {
            name: name.into(),
            broker,
            dial_fn: Arc::new(move || Box::pin(dial_fn())),
            current: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release whatever the last resolution produced. The next call resolves again.
    pub async fn close(&self) -> Result<()> {
        match self.current.lock().await.take() {
            Some(dialed) => close_all(&dialed.deps).await,
            None => Ok(()),
        }
    }

    async fn connection(&self) -> Result<ServiceConn> {
        let mut current = self.current.lock().await;
        if let Some(dialed) = current.as_ref() {
            if !dialed.conn.is_closed() {
                return Ok(dialed.conn.clone());
            }
        }

        if let Some(stale) = current.take() {
            if let Err(e) = close_all(&stale.deps).await {
                tracing::warn!(conn = %self.name, "Failed to release stale dependencies: {}", e);
            }
        }

        let (id, deps) = (self.dial_fn)().await?;
        match self.broker.dial(&self.name, id).await {
            Ok(conn) => {
                tracing::debug!(conn = %self.name, id, "Resolved client connection");
                *current = Some(Dialed {
                    conn: conn.clone(),
                    deps,
                });
                Ok(conn)
            }
            Err(e) => {
                let _ = close_all(&deps).await;
                Err(e)
            }
        }
    }

    async fn invalidate(&self, failed: &ServiceConn) {
        let mut current = self.current.lock().await;
        let is_failed = matches!(current.as_ref(), Some(dialed) if dialed.conn.same_as(failed));
        if is_failed {
            if let Some(stale) = current.take() {
                let _ = close_all(&stale.deps).await;
            }
        }
    }
}

#[async_trait]
impl Invoke for ClientConn {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        let conn = self.connection().await?;
        match conn.invoke(method, params.clone()).await {
            Err(e) if e.is_undelivered() => {
                tracing::debug!(conn = %self.name, "Re-resolving after undelivered call: {}", e);
                self.invalidate(&conn).await;
                let conn = self.connection().await?;
                conn.invoke(method, params).await
            }
            Err(e) if e.is_transport() => {
                self.invalidate(&conn).await;
                Err(e)
            }
            other => other,
        }
    }
}
