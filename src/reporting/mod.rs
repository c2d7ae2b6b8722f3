//! The `reporting-plugin` capability
//!
//! Creating a reporting plugin factory is a bootstrap: the host serves a fixed bundle of
//! collaborators, sends their broker ids to the plugin in one request, and gets back the
//! id of the factory the plugin created. From the host's point of view the attempt is
//! all-or-nothing.
//!
//! Every request carries a `bootstrapId`. The plugin records what it created under that
//! id, and `release_instance` tears it down again. The host sends it when the bootstrap
//! fails after the bundle was served, and when a factory client is closed. Releasing an
//! unknown id succeeds, so the call is safe to repeat.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::broker::BrokerId;
use crate::collaborators::{
    CapabilitiesRegistry, ErrorLog, KeyValueStore, PipelineRunner, Telemetry,
};
use crate::error::Result;
use crate::relayerset::RelayerSet;
use crate::services::Service;

pub mod host;
pub mod plugin;

pub use host::{serve_dependencies, ReportingPluginFactoryClient, ReportingPluginServiceClient};
pub use plugin::{plugin_server, ReportingPluginServiceServer};

pub const CAPABILITY: &str = "reporting-plugin";

/// Broker name of the factories plugins serve back.
pub const FACTORY_NAME: &str = "ReportingPluginFactory";

pub(crate) mod methods {
    pub const NEW_REPORTING_PLUGIN_FACTORY: &str = "new_reporting_plugin_factory";
    pub const RELEASE_INSTANCE: &str = "release_instance";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactoryConfig {
    pub provider_type: String,
    pub plugin_name: String,
    pub telemetry_type: String,
    #[serde(default)]
    pub plugin_config: Value,
}

/// Collaborators lent to one plugin instance.
///
/// They are served in field order; the capabilities registry only for capability
/// kinds that need it.
#[derive(Clone)]
pub struct Dependencies {
    pub pipeline_runner: Arc<dyn PipelineRunner>,
    pub telemetry: Arc<dyn Telemetry>,
    pub error_log: Arc<dyn ErrorLog>,
    pub key_value_store: Arc<dyn KeyValueStore>,
    pub relayer_set: Arc<dyn RelayerSet>,
    pub capabilities_registry: Option<Arc<dyn CapabilitiesRegistry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyIds {
    pub pipeline_runner_id: BrokerId,
    pub telemetry_id: BrokerId,
    pub error_log_id: BrokerId,
    pub key_value_store_id: BrokerId,
    pub relayer_set_id: BrokerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap_registry_id: Option<BrokerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewFactoryRequest {
    pub bootstrap_id: Uuid,
    pub config: FactoryConfig,
    pub provider_id: BrokerId,
    #[serde(flatten)]
    pub deps: DependencyIds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewFactoryReply {
    pub factory_id: BrokerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReleaseInstance {
    pub bootstrap_id: Uuid,
}

/// What a reporting plugin implements.
#[async_trait]
pub trait ReportingPluginService: Service {
    /// `provider` and every dependency are remote handles back into the host.
    async fn new_reporting_plugin_factory(
        &self,
        config: FactoryConfig,
        provider: Arc<dyn Service>,
        deps: Dependencies,
    ) -> Result<Arc<dyn Service>>;
}
