use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broker::{call, params, reply, Invoke, RpcService};
use crate::error::{Error, Result};

pub const NAME: &str = "KeyValueStore";

const STORE: &str = "store";
const GET: &str = "get";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn store(&self, key: String, value: Vec<u8>) -> Result<()>;

    /// Fails with [`Error::NotFound`] for a missing key.
    async fn get(&self, key: String) -> Result<Vec<u8>>;
}

/// Process-local store, mostly for tests and the standalone host.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, Vec<u8>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn store(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.values.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: String) -> Result<Vec<u8>> {
        self.values
            .get(&key)
            .map(|v| v.value().clone())
            .ok_or_else(|| Error::NotFound(format!("key {}", key)))
    }
}

#[derive(Serialize, Deserialize)]
struct Store {
    key: String,
    value: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct Get {
    key: String,
}

pub struct KeyValueStoreServer {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueStoreServer {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RpcService for KeyValueStoreServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            STORE => {
                let req: Store = params(value)?;
                self.store.store(req.key, req.value).await?;
                Ok(json!({}))
            }
            GET => {
                let req: Get = params(value)?;
                reply(self.store.get(req.key).await?)
            }
            other => Err(Error::method_not_found(other)),
        }
    }
}

pub struct KeyValueStoreClient {
    conn: Arc<dyn Invoke>,
}

impl KeyValueStoreClient {
    pub fn new(conn: Arc<dyn Invoke>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KeyValueStore for KeyValueStoreClient {
    async fn store(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.conn.invoke(STORE, json!(Store { key, value })).await?;
        Ok(())
    }

    async fn get(&self, key: String) -> Result<Vec<u8>> {
        call(self.conn.as_ref(), GET, &Get { key }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, ResourceBroker, Session};
    use crate::transport::memory;

    #[tokio::test]
    async fn test_store_and_get_across_boundary() {
        let (a, b) = memory::pair();
        let host = Broker::new("host");
        let plugin = Broker::new("plugin");
        host.install(Session::new(a));
        plugin.install(Session::new(b));

        let (id, _res) = host
            .serve(NAME, Arc::new(KeyValueStoreServer::new(Arc::new(MemoryStore::default()))))
            .await
            .unwrap();
        let client = KeyValueStoreClient::new(Arc::new(plugin.dial(NAME, id).await.unwrap()));

        client.store("round".into(), vec![1, 2, 3]).await.unwrap();
        assert_eq!(client.get("round".into()).await.unwrap(), vec![1, 2, 3]);

        let err = client.get("missing".into()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
