use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use super::methods::{NEW_REPORTING_PLUGIN_FACTORY, RELEASE_INSTANCE};
use super::{
    Dependencies, DependencyIds, FactoryConfig, NewFactoryReply, NewFactoryRequest,
    ReleaseInstance, FACTORY_NAME,
};
use crate::broker::{call, BrokerId, Invoke, ResourceBroker, RpcService};
use crate::collaborators::{
    capregistry, errorlog, keyvalue, pipeline, telemetry, CapabilitiesRegistryServer,
    ErrorLogServer, KeyValueStoreServer, PipelineRunnerServer, TelemetryServer,
};
use crate::error::{BrokerError, Error, Result};
use crate::metrics::Metrics;
use crate::relayerset::{self, RelayerSetServer};
use crate::resource::{close_all, Resource};
use crate::services::{HealthReport, Service, ServiceClient};
use crate::supervisor::RemoteInstance;

const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Collects served collaborators; on failure releases what was served so far.
struct Bundle {
    broker: Arc<dyn ResourceBroker>,
    served: Vec<Resource>,
}

impl Bundle {
    async fn serve(
        &mut self,
        name: &str,
        service: Arc<dyn RpcService>,
        deps: Vec<Resource>,
    ) -> Result<BrokerId> {
        match self.broker.serve_new(name, service, deps).await {
            Ok((id, resource)) => {
                self.served.push(resource);
                Ok(id)
            }
            Err(e) => {
                if let Err(close_err) = close_all(&self.served).await {
                    tracing::warn!("Failed to release partial dependency bundle: {}", close_err);
                }
                match e {
                    Error::Broker(BrokerError::Serve { .. }) => Err(e),
                    other => Err(BrokerError::Serve {
                        name: name.to_string(),
                        id: 0,
                        reason: other.to_string(),
                    }
                    .into()),
                }
            }
        }
    }
}

/// Serve `deps` in their fixed order.
///
/// If serving collaborator *k* fails, collaborators `1..k-1` are released and the error
/// names collaborator *k*. On success the caller owns the returned resources.
pub async fn serve_dependencies(
    broker: Arc<dyn ResourceBroker>,
    deps: &Dependencies,
) -> Result<(DependencyIds, Vec<Resource>)> {
    let mut bundle = Bundle {
        broker: broker.clone(),
        served: Vec::new(),
    };

    let pipeline_runner_id = bundle
        .serve(
            pipeline::NAME,
            Arc::new(PipelineRunnerServer::new(deps.pipeline_runner.clone())),
            Vec::new(),
        )
        .await?;
    let telemetry_id = bundle
        .serve(
            telemetry::NAME,
            Arc::new(TelemetryServer::new(deps.telemetry.clone())),
            Vec::new(),
        )
        .await?;
    let error_log_id = bundle
        .serve(
            errorlog::NAME,
            Arc::new(ErrorLogServer::new(deps.error_log.clone())),
            Vec::new(),
        )
        .await?;
    let key_value_store_id = bundle
        .serve(
            keyvalue::NAME,
            Arc::new(KeyValueStoreServer::new(deps.key_value_store.clone())),
            Vec::new(),
        )
        .await?;

    let relayer_set = RelayerSetServer::new(deps.relayer_set.clone(), broker);
    let providers = relayer_set.providers_resource();
    let relayer_set_id = bundle
        .serve(relayerset::NAME, Arc::new(relayer_set), vec![providers])
        .await?;

    let cap_registry_id = match &deps.capabilities_registry {
        Some(registry) => Some(
            bundle
                .serve(
                    capregistry::NAME,
                    Arc::new(CapabilitiesRegistryServer::new(registry.clone())),
                    Vec::new(),
                )
                .await?,
        ),
        None => None,
    };

    let ids = DependencyIds {
        pipeline_runner_id,
        telemetry_id,
        error_log_id,
        key_value_store_id,
        relayer_set_id,
        cap_registry_id,
    };
    Ok((ids, bundle.served))
}

async fn release_instance(conn: &dyn Invoke, bootstrap_id: Uuid, limit: Duration) -> Result<()> {
    let request = json!(ReleaseInstance { bootstrap_id });
    match timeout(limit, conn.invoke(RELEASE_INSTANCE, request)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => Err(Error::Timeout),
    }
}

/// Host-side facade of a reporting plugin.
pub struct ReportingPluginServiceClient {
    service: ServiceClient,
    conn: Arc<dyn Invoke>,
    broker: Arc<dyn ResourceBroker>,
    metrics: Arc<Metrics>,
    release_timeout: Duration,
}

impl ReportingPluginServiceClient {
    pub fn new(name: impl Into<String>, broker: Arc<dyn ResourceBroker>, conn: Arc<dyn Invoke>) -> Self {
        Self {
            service: ServiceClient::new(name, conn.clone()),
            conn,
            broker,
            metrics: Arc::new(Metrics::new()),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    /// Build the facade for a supervised plugin; calls follow every relaunch.
    pub fn from_instance(instance: &RemoteInstance) -> Self {
        let conn: Arc<dyn Invoke> = Arc::new(instance.client_conn());
        Self {
            service: ServiceClient::new(instance.name.clone(), conn.clone()),
            conn,
            broker: instance.broker.clone(),
            metrics: instance.broker.metrics().clone(),
            release_timeout: instance.broker.dial_timeout(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_release_timeout(mut self, release_timeout: Duration) -> Self {
        self.release_timeout = release_timeout;
        self
    }

    /// Serve `deps`, ask the plugin for a new factory, and connect to it.
    ///
    /// On failure no collaborator stays served and the plugin has been asked to drop
    /// whatever it created for this attempt.
    pub async fn new_reporting_plugin_factory(
        &self,
        config: FactoryConfig,
        provider_id: BrokerId,
        deps: &Dependencies,
    ) -> Result<ReportingPluginFactoryClient> {
        let (ids, resources) = match serve_dependencies(self.broker.clone(), deps).await {
            Ok(served) => served,
            Err(e) => {
                self.metrics.bootstrap_failures.inc();
                return Err(e);
            }
        };

        let bootstrap_id = Uuid::new_v4();
        let request = NewFactoryRequest {
            bootstrap_id,
            config,
            provider_id,
            deps: ids,
        };

        let result = async {
            let reply: NewFactoryReply =
                call(self.conn.as_ref(), NEW_REPORTING_PLUGIN_FACTORY, &request).await?;
            let conn = self.broker.dial(FACTORY_NAME, reply.factory_id).await?;
            Ok::<_, Error>((reply.factory_id, conn))
        }
        .await;

        match result {
            Ok((factory_id, conn)) => {
                tracing::info!(%bootstrap_id, factory_id, "Created reporting plugin factory");
                Ok(ReportingPluginFactoryClient {
                    bootstrap_id,
                    service: ServiceClient::new(FACTORY_NAME, Arc::new(conn)),
                    control: self.conn.clone(),
                    release_timeout: self.release_timeout,
                    deps: resources,
                    closed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                self.metrics.bootstrap_failures.inc();
                tracing::warn!(%bootstrap_id, "Bootstrap failed, releasing dependencies: {}", e);
                if let Err(release_err) =
                    release_instance(self.conn.as_ref(), bootstrap_id, self.release_timeout).await
                {
                    tracing::debug!(%bootstrap_id, "Remote release failed: {}", release_err);
                }
                if let Err(close_err) = close_all(&resources).await {
                    tracing::warn!(%bootstrap_id, "Failed to release dependencies: {}", close_err);
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Service for ReportingPluginServiceClient {
    async fn name(&self) -> String {
        self.service.name().await
    }

    async fn start(&self) -> Result<()> {
        self.service.start().await
    }

    async fn close(&self) -> Result<()> {
        self.service.close().await
    }

    async fn ready(&self) -> Result<()> {
        self.service.ready().await
    }

    async fn health_report(&self) -> HealthReport {
        self.service.health_report().await
    }
}

/// A factory the plugin created, plus the collaborators lent to it.
pub struct ReportingPluginFactoryClient {
    bootstrap_id: Uuid,
    service: ServiceClient,
    control: Arc<dyn Invoke>,
    release_timeout: Duration,
    deps: Vec<Resource>,
    closed: AtomicBool,
}

impl ReportingPluginFactoryClient {
    pub fn bootstrap_id(&self) -> Uuid {
        self.bootstrap_id
    }
}

#[async_trait]
impl Service for ReportingPluginFactoryClient {
    async fn name(&self) -> String {
        self.service.name().await
    }

    async fn start(&self) -> Result<()> {
        self.service.start().await
    }

    /// Close the remote factory, release the instance, then the collaborators.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let remote = match self.service.close().await {
            Err(e) if e.is_cancellation() || e.is_transport() => {
                tracing::debug!(bootstrap_id = %self.bootstrap_id, "Factory already gone: {}", e);
                Ok(())
            }
            other => other,
        };
        if let Err(e) =
            release_instance(self.control.as_ref(), self.bootstrap_id, self.release_timeout).await
        {
            tracing::debug!(bootstrap_id = %self.bootstrap_id, "Remote release failed: {}", e);
        }
        let local = close_all(&self.deps).await;

        remote.and(local)
    }

    async fn ready(&self) -> Result<()> {
        self.service.ready().await
    }

    async fn health_report(&self) -> HealthReport {
        self.service.health_report().await
    }
}
