//! The lifecycle every plugin-facing object exposes, and its brokered form.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::broker::{call, reply, Invoke, RpcService};
use crate::error::{Error, Result};

/// Component name to error message; `None` means healthy.
///
/// Errors cannot cross the process boundary, so reports carry strings on both sides.
pub type HealthReport = BTreeMap<String, Option<String>>;

pub mod methods {
    pub const NAME: &str = "name";
    pub const START: &str = "start";
    pub const CLOSE: &str = "close";
    pub const READY: &str = "ready";
    pub const HEALTH_REPORT: &str = "health_report";
}

#[async_trait]
pub trait Service: Send + Sync {
    async fn name(&self) -> String;
    async fn start(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
    async fn ready(&self) -> Result<()>;
    async fn health_report(&self) -> HealthReport;
}

/// Serves the [`Service`] methods of a local object.
pub struct ServiceServer {
    service: Arc<dyn Service>,
}

impl ServiceServer {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self { service }
    }

    /// Handle `method` if it is a lifecycle method, `None` otherwise.
    pub async fn handle(&self, method: &str) -> Option<Result<Value>> {
        let result = match method {
            methods::NAME => reply(self.service.name().await),
            methods::START => self.service.start().await.map(|_| json!({})),
            methods::CLOSE => self.service.close().await.map(|_| json!({})),
            methods::READY => self.service.ready().await.map(|_| json!({})),
            methods::HEALTH_REPORT => reply(self.service.health_report().await),
            _ => return None,
        };
        Some(result)
    }
}

#[async_trait]
impl RpcService for ServiceServer {
    async fn call(&self, method: &str, _params: Value) -> Result<Value> {
        match self.handle(method).await {
            Some(result) => result,
            None => Err(Error::method_not_found(method)),
        }
    }
}

/// A remote [`Service`] reached through any [`Invoke`].
pub struct ServiceClient {
    label: String,
    conn: Arc<dyn Invoke>,
}

impl ServiceClient {
    /// `label` keys the health report when the remote side cannot be reached.
    pub fn new(label: impl Into<String>, conn: Arc<dyn Invoke>) -> Self {
        Self {
            label: label.into(),
            conn,
        }
    }

    pub fn conn(&self) -> &Arc<dyn Invoke> {
        &self.conn
    }
}

#[async_trait]
impl Service for ServiceClient {
    async fn name(&self) -> String {
        match call::<_, _, String>(self.conn.as_ref(), methods::NAME, &json!({})).await {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(service = %self.label, "Failed to fetch remote name: {}", e);
                self.label.clone()
            }
        }
    }

    async fn start(&self) -> Result<()> {
        self.conn.invoke(methods::START, json!({})).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.conn.invoke(methods::CLOSE, json!({})).await?;
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        self.conn.invoke(methods::READY, json!({})).await?;
        Ok(())
    }

    async fn health_report(&self) -> HealthReport {
        match call(self.conn.as_ref(), methods::HEALTH_REPORT, &json!({})).await {
            Ok(report) => report,
            Err(e) => HealthReport::from([(self.label.clone(), Some(e.to_string()))]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, ResourceBroker, Session};
    use crate::transport::memory;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Fake {
        started: AtomicBool,
    }

    #[async_trait]
    impl Service for Fake {
        async fn name(&self) -> String {
            "fake".to_string()
        }
        async fn start(&self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn ready(&self) -> Result<()> {
            if self.started.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::Unavailable("not started".into()))
            }
        }
        async fn health_report(&self) -> HealthReport {
            HealthReport::from([
                ("fake".to_string(), None),
                ("fake.db".to_string(), Some("connection refused".to_string())),
            ])
        }
    }

    #[tokio::test]
    async fn test_service_round_trip() {
        let (a, b) = memory::pair();
        let host = Broker::new("host");
        let plugin = Broker::new("plugin");
        host.install(Session::new(a));
        plugin.install(Session::new(b));

        let (id, _resource) = plugin
            .serve("Fake", Arc::new(ServiceServer::new(Arc::new(Fake::default()))))
            .await
            .unwrap();
        let conn = host.dial("Fake", id).await.unwrap();
        let client = ServiceClient::new("fake-client", Arc::new(conn));

        assert_eq!(client.name().await, "fake");
        assert!(matches!(client.ready().await, Err(Error::Unavailable(_))));
        client.start().await.unwrap();
        client.ready().await.unwrap();

        let report = client.health_report().await;
        assert_eq!(report.get("fake"), Some(&None));
        assert_eq!(
            report.get("fake.db"),
            Some(&Some("connection refused".to_string()))
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_under_label() {
        let (a, _b) = memory::pair();
        let session = Session::new(a);
        session.close().await.unwrap();
        let client = ServiceClient::new(
            "gone",
            Arc::new(crate::broker::ServiceConn::new("gone", 1, session)),
        );

        assert_eq!(client.name().await, "gone");
        let report = client.health_report().await;
        assert!(report.get("gone").unwrap().is_some());
    }
}
