use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::methods::{NEW_REPORTING_PLUGIN_FACTORY, RELEASE_INSTANCE};
use super::{
    Dependencies, DependencyIds, NewFactoryReply, NewFactoryRequest, ReleaseInstance,
    ReportingPluginService, CAPABILITY, FACTORY_NAME,
};
use crate::broker::{params, reply, Broker, BrokerId, ResourceBroker, RpcService};
use crate::collaborators::{
    capregistry, errorlog, keyvalue, pipeline, telemetry, CapabilitiesRegistryClient,
    ErrorLogClient, KeyValueStoreClient, PipelineRunnerClient, TelemetryClient,
};
use crate::error::{Error, Result};
use crate::plugin::PluginServer;
use crate::relayerset::{self, RelayerSetClient, PROVIDER_NAME};
use crate::resource::Resource;
use crate::services::{ServiceClient, ServiceServer};

struct Instance {
    factory_id: BrokerId,
    resource: Resource,
}

/// Plugin side of the `reporting-plugin` capability.
pub struct ReportingPluginServiceServer {
    service: Arc<dyn ReportingPluginService>,
    lifecycle: ServiceServer,
    broker: Arc<Broker>,
    instances: DashMap<Uuid, Instance>,
    // Serializes bootstraps so a repeated request cannot create a second instance.
    creating: Mutex<()>,
}

impl ReportingPluginServiceServer {
    pub fn new<T: ReportingPluginService + 'static>(service: Arc<T>, broker: Arc<Broker>) -> Self {
        Self {
            lifecycle: ServiceServer::new(service.clone()),
            service,
            broker,
            instances: DashMap::new(),
            creating: Mutex::new(()),
        }
    }

    async fn dependencies(&self, ids: &DependencyIds) -> Result<Dependencies> {
        let broker = &self.broker;
        let pipeline_runner = broker.dial(pipeline::NAME, ids.pipeline_runner_id).await?;
        let telemetry = broker.dial(telemetry::NAME, ids.telemetry_id).await?;
        let error_log = broker.dial(errorlog::NAME, ids.error_log_id).await?;
        let key_value_store = broker.dial(keyvalue::NAME, ids.key_value_store_id).await?;
        let relayer_set = broker.dial(relayerset::NAME, ids.relayer_set_id).await?;
        let capabilities_registry = match ids.cap_registry_id {
            Some(id) => Some(broker.dial(capregistry::NAME, id).await?),
            None => None,
        };

        Ok(Dependencies {
            pipeline_runner: Arc::new(PipelineRunnerClient::new(Arc::new(pipeline_runner))),
            telemetry: Arc::new(TelemetryClient::new(Arc::new(telemetry))),
            error_log: Arc::new(ErrorLogClient::new(Arc::new(error_log))),
            key_value_store: Arc::new(KeyValueStoreClient::new(Arc::new(key_value_store))),
            relayer_set: Arc::new(RelayerSetClient::new(
                broker.clone(),
                Arc::new(relayer_set),
            )),
            capabilities_registry: capabilities_registry.map(|conn| {
                Arc::new(CapabilitiesRegistryClient::new(Arc::new(conn)))
                    as Arc<dyn crate::collaborators::CapabilitiesRegistry>
            }),
        })
    }

    async fn new_factory(&self, request: NewFactoryRequest) -> Result<BrokerId> {
        let _creating = self.creating.lock().await;
        if let Some(existing) = self.instances.get(&request.bootstrap_id) {
            return Ok(existing.factory_id);
        }

        let deps = self.dependencies(&request.deps).await?;
        let provider = self.broker.dial(PROVIDER_NAME, request.provider_id).await?;
        let provider = Arc::new(ServiceClient::new(PROVIDER_NAME, Arc::new(provider)));

        let factory = self
            .service
            .new_reporting_plugin_factory(request.config, provider, deps)
            .await?;
        let (factory_id, resource) = self
            .broker
            .serve(FACTORY_NAME, Arc::new(ServiceServer::new(factory)))
            .await?;

        tracing::debug!(bootstrap_id = %request.bootstrap_id, factory_id, "Created factory");
        self.instances.insert(
            request.bootstrap_id,
            Instance {
                factory_id,
                resource,
            },
        );
        Ok(factory_id)
    }

    async fn release(&self, bootstrap_id: Uuid) -> Result<()> {
        match self.instances.remove(&bootstrap_id) {
            Some((_, instance)) => {
                tracing::debug!(%bootstrap_id, "Releasing factory {}", instance.factory_id);
                instance.resource.close().await
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RpcService for ReportingPluginServiceServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            NEW_REPORTING_PLUGIN_FACTORY => {
                let request: NewFactoryRequest = params(value)?;
                reply(NewFactoryReply {
                    factory_id: self.new_factory(request).await?,
                })
            }
            RELEASE_INSTANCE => {
                let ReleaseInstance { bootstrap_id } = params(value)?;
                self.release(bootstrap_id).await?;
                Ok(json!({}))
            }
            other => match self.lifecycle.handle(other).await {
                Some(result) => result,
                None => Err(Error::method_not_found(other)),
            },
        }
    }
}

/// The [`PluginServer`] a reporting plugin binary hands to `serve_stdio`.
pub fn plugin_server<T: ReportingPluginService + 'static>(service: Arc<T>) -> PluginServer {
    PluginServer::new(CAPABILITY, move |broker| {
        let service = service.clone();
        async move {
            Ok(Arc::new(ReportingPluginServiceServer::new(service, broker)) as Arc<dyn RpcService>)
        }
    })
}
