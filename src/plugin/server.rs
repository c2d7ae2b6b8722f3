use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::broker::{params, reply, Broker, BrokerId, ResourceBroker, RpcService, Session};
use crate::error::{ConfigError, Error, Result};
use crate::protocol::{control, DispenseParams, DispenseResult};
use crate::resource::Resource;
use crate::transport::{stdio, Connection};

type CapabilityFactory =
    Arc<dyn Fn(Arc<Broker>) -> BoxFuture<'static, Result<Arc<dyn RpcService>>> + Send + Sync>;

/// The single capability a plugin process serves, and how to build it.
#[derive(Clone)]
pub struct PluginServer {
    capability: String,
    factory: CapabilityFactory,
}

impl PluginServer {
    /// `factory` receives the plugin-side broker, through which the capability can dial
    /// host services and serve further instances.
    pub fn new<F, Fut>(capability: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Arc<Broker>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn RpcService>>> + Send + 'static,
    {
        Self {
            capability: capability.into(),
            factory: Arc::new(move |broker| Box::pin(factory(broker))),
        }
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }
}

/// Control extension answering `dispense`.
struct Dispenser {
    server: PluginServer,
    broker: Arc<Broker>,
    served: Mutex<Option<(BrokerId, Resource)>>,
}

impl Dispenser {
    async fn dispense(&self, name: &str) -> Result<BrokerId> {
        if name != self.server.capability {
            return Err(ConfigError::UnknownCapability {
                requested: name.to_string(),
                served: self.server.capability.clone(),
            }
            .into());
        }

        let mut served = self.served.lock().await;
        if let Some((id, _)) = served.as_ref() {
            return Ok(*id);
        }

        let service = (self.server.factory)(self.broker.clone()).await?;
        let (id, resource) = self.broker.serve(&self.server.capability, service).await?;
        tracing::info!(capability = %name, id, "Dispensed capability");
        *served = Some((id, resource));
        Ok(id)
    }

    async fn release(&self) {
        if let Some((_, resource)) = self.served.lock().await.take() {
            if let Err(e) = resource.close().await {
                tracing::warn!("Failed to release capability: {}", e);
            }
        }
    }
}

#[async_trait]
impl RpcService for Dispenser {
    async fn call(&self, method: &str, params_value: Value) -> Result<Value> {
        match method {
            control::DISPENSE => {
                let request: DispenseParams = params(params_value)?;
                reply(DispenseResult {
                    id: self.dispense(&request.name).await?,
                })
            }
            other => Err(Error::method_not_found(other)),
        }
    }
}

/// Serve `server` over `conn` until the host goes away.
pub async fn serve(conn: Arc<dyn Connection>, server: PluginServer) -> Result<()> {
    let session = Session::new(conn);
    let broker = Arc::new(Broker::new(server.capability.clone()));
    broker.install(session.clone());

    let dispenser = Arc::new(Dispenser {
        server,
        broker,
        served: Mutex::new(None),
    });
    session.set_control(dispenser.clone())?;
    tracing::debug!(capability = %dispenser.server.capability, "Plugin serving");

    session.closed().await;
    dispenser.release().await;
    tracing::debug!(capability = %dispenser.server.capability, "Host disconnected");
    Ok(())
}

/// Serve `server` to the parent process over this process's stdin/stdout.
pub async fn serve_stdio(server: PluginServer) -> Result<()> {
    serve(stdio::parent(), server).await
}
