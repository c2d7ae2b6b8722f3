use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broker::{call, params, reply, Invoke, RpcService};
use crate::error::{Error, Result};

pub const NAME: &str = "CapabilitiesRegistry";

const GET: &str = "get";
const ADD: &str = "add";
const LIST: &str = "list";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInfo {
    pub id: String,
    pub capability_type: String,
    #[serde(default)]
    pub description: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilitiesRegistry: Send + Sync {
    async fn get(&self, id: String) -> Result<CapabilityInfo>;
    async fn add(&self, info: CapabilityInfo) -> Result<()>;
    async fn list(&self) -> Result<Vec<CapabilityInfo>>;
}

#[derive(Serialize, Deserialize)]
struct Get {
    id: String,
}

pub struct CapabilitiesRegistryServer {
    registry: Arc<dyn CapabilitiesRegistry>,
}

impl CapabilitiesRegistryServer {
    pub fn new(registry: Arc<dyn CapabilitiesRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RpcService for CapabilitiesRegistryServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            GET => {
                let req: Get = params(value)?;
                reply(self.registry.get(req.id).await?)
            }
            ADD => {
                let info: CapabilityInfo = params(value)?;
                self.registry.add(info).await?;
                Ok(json!({}))
            }
            LIST => reply(self.registry.list().await?),
            other => Err(Error::method_not_found(other)),
        }
    }
}

pub struct CapabilitiesRegistryClient {
    conn: Arc<dyn Invoke>,
}

impl CapabilitiesRegistryClient {
    pub fn new(conn: Arc<dyn Invoke>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CapabilitiesRegistry for CapabilitiesRegistryClient {
    async fn get(&self, id: String) -> Result<CapabilityInfo> {
        call(self.conn.as_ref(), GET, &Get { id }).await
    }

    async fn add(&self, info: CapabilityInfo) -> Result<()> {
        self.conn.invoke(ADD, serde_json::to_value(info)?).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CapabilityInfo>> {
        call(self.conn.as_ref(), LIST, &json!({})).await
    }
}
