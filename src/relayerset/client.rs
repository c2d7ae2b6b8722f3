use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::methods::*;
use super::server::{
    IdParams, ListParams, ListReply, NewPluginProviderParams, NewPluginProviderReply,
    ReleaseProviderParams,
};
use super::{PluginArgs, RelayArgs, RelayId, Relayer, RelayerSet, PROVIDER_NAME};
use crate::broker::{call, BrokerId, Invoke, ResourceBroker};
use crate::error::Result;
use crate::services::{HealthReport, Service, ServiceClient};

/// Plugin side of the relayer-set proxy.
pub struct RelayerSetClient {
    broker: Arc<dyn ResourceBroker>,
    conn: Arc<dyn Invoke>,
}

impl RelayerSetClient {
    /// `broker` is used to dial the providers the host serves back.
    pub fn new(broker: Arc<dyn ResourceBroker>, conn: Arc<dyn Invoke>) -> Self {
        Self { broker, conn }
    }

    fn relayer(&self, id: RelayId) -> Arc<dyn Relayer> {
        Arc::new(RelayerClient {
            id,
            broker: self.broker.clone(),
            conn: self.conn.clone(),
        })
    }
}

#[async_trait]
impl RelayerSet for RelayerSetClient {
    async fn get(&self, id: &RelayId) -> Result<Arc<dyn Relayer>> {
        self.conn
            .invoke(GET, json!(IdParams { id: id.clone() }))
            .await?;
        Ok(self.relayer(id.clone()))
    }

    async fn list(&self, ids: &[RelayId]) -> Result<BTreeMap<RelayId, Arc<dyn Relayer>>> {
        let reply: ListReply = call(
            self.conn.as_ref(),
            LIST,
            &ListParams { ids: ids.to_vec() },
        )
        .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| (id.clone(), self.relayer(id)))
            .collect())
    }
}

/// One relayer on the host, addressed by its id.
pub struct RelayerClient {
    id: RelayId,
    broker: Arc<dyn ResourceBroker>,
    conn: Arc<dyn Invoke>,
}

impl RelayerClient {
    pub fn id(&self) -> &RelayId {
        &self.id
    }

    async fn send(&self, method: &str) -> Result<()> {
        self.conn
            .invoke(method, json!(IdParams { id: self.id.clone() }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Service for RelayerClient {
    async fn name(&self) -> String {
        let params = IdParams { id: self.id.clone() };
        match call::<_, _, String>(self.conn.as_ref(), RELAYER_NAME, &params).await {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(relayer = %self.id, "Failed to fetch relayer name: {}", e);
                self.id.to_string()
            }
        }
    }

    async fn start(&self) -> Result<()> {
        self.send(START_RELAYER).await
    }

    async fn close(&self) -> Result<()> {
        self.send(CLOSE_RELAYER).await
    }

    async fn ready(&self) -> Result<()> {
        self.send(RELAYER_READY).await
    }

    async fn health_report(&self) -> HealthReport {
        let params = IdParams { id: self.id.clone() };
        match call(self.conn.as_ref(), RELAYER_HEALTH_REPORT, &params).await {
            Ok(report) => report,
            Err(e) => HealthReport::from([(self.id.to_string(), Some(e.to_string()))]),
        }
    }
}

#[async_trait]
impl Relayer for RelayerClient {
    async fn new_plugin_provider(
        &self,
        relay_args: RelayArgs,
        plugin_args: PluginArgs,
    ) -> Result<Arc<dyn Service>> {
        let reply: NewPluginProviderReply = call(
            self.conn.as_ref(),
            NEW_PLUGIN_PROVIDER,
            &NewPluginProviderParams {
                id: self.id.clone(),
                relay_args,
                plugin_args,
            },
        )
        .await?;

        let conn = self.broker.dial(PROVIDER_NAME, reply.provider_id).await?;
        Ok(Arc::new(ProviderClient {
            service: ServiceClient::new(format!("{}({})", PROVIDER_NAME, self.id), Arc::new(conn)),
            provider_id: reply.provider_id,
            set: self.conn.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

/// A provider the host served for this plugin. Closing it also asks the host to stop serving it.
struct ProviderClient {
    service: ServiceClient,
    provider_id: BrokerId,
    set: Arc<dyn Invoke>,
    released: AtomicBool,
}

#[async_trait]
impl Service for ProviderClient {
    async fn name(&self) -> String {
        self.service.name().await
    }

    async fn start(&self) -> Result<()> {
        self.service.start().await
    }

    async fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let closed = self.service.close().await;
        let released = self
            .set
            .invoke(
                RELEASE_PLUGIN_PROVIDER,
                json!(ReleaseProviderParams {
                    provider_id: self.provider_id
                }),
            )
            .await
            .map(|_| ());
        closed.and(released)
    }

    async fn ready(&self) -> Result<()> {
        self.service.ready().await
    }

    async fn health_report(&self) -> HealthReport {
        self.service.health_report().await
    }
}
