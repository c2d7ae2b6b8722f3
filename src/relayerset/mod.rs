//! Relayer access for plugins
//!
//! The host owns the relayers. A plugin reaches them through [`RelayerSetClient`], whose
//! every operation is one call carrying the relayer's [`RelayId`]; the host-side
//! [`RelayerSetServer`] resolves the id against its live relayer set and forwards.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::services::Service;

pub mod client;
pub mod server;

pub use client::{RelayerClient, RelayerSetClient};
pub use server::RelayerSetServer;

pub const NAME: &str = "RelayerSet";

/// Broker name under which plugin providers are served.
pub const PROVIDER_NAME: &str = "PluginProvider";

pub(crate) mod methods {
    pub const GET: &str = "get";
    pub const LIST: &str = "list";
    pub const START_RELAYER: &str = "start_relayer";
    pub const CLOSE_RELAYER: &str = "close_relayer";
    pub const RELAYER_READY: &str = "relayer_ready";
    pub const RELAYER_HEALTH_REPORT: &str = "relayer_health_report";
    pub const RELAYER_NAME: &str = "relayer_name";
    pub const NEW_PLUGIN_PROVIDER: &str = "new_plugin_provider";
    pub const RELEASE_PLUGIN_PROVIDER: &str = "release_plugin_provider";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayId {
    pub network: String,
    pub chain_id: String,
}

impl RelayId {
    pub fn new(network: impl Into<String>, chain_id: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            chain_id: chain_id.into(),
        }
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.chain_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayArgs {
    pub external_job_id: String,
    pub job_id: i64,
    pub contract_id: String,
    pub provider_type: String,
    #[serde(default)]
    pub relay_config: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginArgs {
    pub transmitter_id: String,
    pub plugin_name: String,
    #[serde(default)]
    pub plugin_config: Value,
}

#[async_trait]
pub trait Relayer: Service {
    async fn new_plugin_provider(
        &self,
        relay_args: RelayArgs,
        plugin_args: PluginArgs,
    ) -> Result<Arc<dyn Service>>;
}

#[async_trait]
pub trait RelayerSet: Send + Sync {
    /// Fails with [`Error::NotFound`](crate::error::Error::NotFound) for an unknown id.
    async fn get(&self, id: &RelayId) -> Result<Arc<dyn Relayer>>;

    /// Relayers for `ids`, or all of them when `ids` is empty.
    async fn list(&self, ids: &[RelayId]) -> Result<BTreeMap<RelayId, Arc<dyn Relayer>>>;
}
