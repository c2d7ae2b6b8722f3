use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::methods::*;
use super::{PluginArgs, RelayArgs, RelayId, Relayer, RelayerSet, PROVIDER_NAME};
use crate::broker::{params, reply, BrokerId, ResourceBroker, RpcService};
use crate::error::{Error, Result};
use crate::resource::{close_all, Resource};
use crate::services::ServiceServer;

#[derive(Serialize, Deserialize)]
pub(super) struct IdParams {
    pub id: RelayId,
}

#[derive(Serialize, Deserialize)]
pub(super) struct ListParams {
    pub ids: Vec<RelayId>,
}

#[derive(Serialize, Deserialize)]
pub(super) struct ListReply {
    pub ids: Vec<RelayId>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NewPluginProviderParams {
    pub id: RelayId,
    pub relay_args: RelayArgs,
    pub plugin_args: PluginArgs,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct NewPluginProviderReply {
    pub provider_id: BrokerId,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ReleaseProviderParams {
    pub provider_id: BrokerId,
}

/// Host side of the relayer-set proxy.
///
/// Providers created through `new_plugin_provider` are served on the same broker until the
/// plugin releases them one by one, or until [`providers_resource`](Self::providers_resource)
/// releases whatever is left.
pub struct RelayerSetServer {
    set: Arc<dyn RelayerSet>,
    broker: Arc<dyn ResourceBroker>,
    providers: Arc<Mutex<BTreeMap<BrokerId, Resource>>>,
}

impl RelayerSetServer {
    pub fn new(set: Arc<dyn RelayerSet>, broker: Arc<dyn ResourceBroker>) -> Self {
        Self {
            set,
            broker,
            providers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Releases every provider this server has served so far.
    pub fn providers_resource(&self) -> Resource {
        let providers = self.providers.clone();
        Resource::new("RelayerSetProviders", move || async move {
            let served = std::mem::take(&mut *providers.lock().await);
            close_all(&served.into_values().collect::<Vec<_>>()).await
        })
    }

    async fn relayer(&self, value: Value) -> Result<(RelayId, Arc<dyn Relayer>)> {
        let IdParams { id } = params(value)?;
        let relayer = self.set.get(&id).await?;
        Ok((id, relayer))
    }

    async fn new_plugin_provider(&self, value: Value) -> Result<Value> {
        let req: NewPluginProviderParams = params(value)?;
        let relayer = self.set.get(&req.id).await?;
        let provider = relayer
            .new_plugin_provider(req.relay_args, req.plugin_args)
            .await?;

        let (provider_id, resource) = self
            .broker
            .serve(PROVIDER_NAME, Arc::new(ServiceServer::new(provider)))
            .await?;
        self.providers.lock().await.insert(provider_id, resource);
        tracing::debug!(relayer = %req.id, id = provider_id, "Served plugin provider");

        reply(NewPluginProviderReply { provider_id })
    }

    /// Unknown ids are ignored so a repeated release is harmless.
    async fn release_plugin_provider(&self, value: Value) -> Result<Value> {
        let ReleaseProviderParams { provider_id } = params(value)?;
        let resource = self.providers.lock().await.remove(&provider_id);
        if let Some(resource) = resource {
            resource.close().await?;
            tracing::debug!(id = provider_id, "Released plugin provider");
        }
        Ok(json!({}))
    }
}

#[async_trait]
impl RpcService for RelayerSetServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            GET => {
                self.relayer(value).await?;
                Ok(json!({}))
            }
            LIST => {
                let ListParams { ids } = params(value)?;
                let relayers = self.set.list(&ids).await?;
                reply(ListReply {
                    ids: relayers.into_keys().collect(),
                })
            }
            START_RELAYER => {
                self.relayer(value).await?.1.start().await?;
                Ok(json!({}))
            }
            CLOSE_RELAYER => {
                self.relayer(value).await?.1.close().await?;
                Ok(json!({}))
            }
            RELAYER_READY => {
                self.relayer(value).await?.1.ready().await?;
                Ok(json!({}))
            }
            RELAYER_HEALTH_REPORT => reply(self.relayer(value).await?.1.health_report().await),
            RELAYER_NAME => reply(self.relayer(value).await?.1.name().await),
            NEW_PLUGIN_PROVIDER => self.new_plugin_provider(value).await,
            RELEASE_PLUGIN_PROVIDER => self.release_plugin_provider(value).await,
            other => Err(Error::method_not_found(other)),
        }
    }
}
