use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broker::{params, Invoke, RpcService};
use crate::error::{Error, Result};

pub const NAME: &str = "Telemetry";

const SEND: &str = "send";

/// Where a telemetry payload belongs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub network: String,
    pub chain_id: String,
    pub contract_id: String,
    pub telemetry_type: String,
}

impl Endpoint {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("network", &self.network),
            ("chainId", &self.chain_id),
            ("contractId", &self.contract_id),
            ("telemetryType", &self.telemetry_type),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidParams(format!("telemetry endpoint has empty {}", field)));
            }
        }
        Ok(())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn send(&self, endpoint: Endpoint, payload: Vec<u8>) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct SendPayload {
    endpoint: Endpoint,
    payload: Vec<u8>,
}

pub struct TelemetryServer {
    telemetry: Arc<dyn Telemetry>,
}

impl TelemetryServer {
    pub fn new(telemetry: Arc<dyn Telemetry>) -> Self {
        Self { telemetry }
    }
}

#[async_trait]
impl RpcService for TelemetryServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            SEND => {
                let req: SendPayload = params(value)?;
                req.endpoint.validate()?;
                self.telemetry.send(req.endpoint, req.payload).await?;
                Ok(json!({}))
            }
            other => Err(Error::method_not_found(other)),
        }
    }
}

pub struct TelemetryClient {
    conn: Arc<dyn Invoke>,
}

impl TelemetryClient {
    pub fn new(conn: Arc<dyn Invoke>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Telemetry for TelemetryClient {
    async fn send(&self, endpoint: Endpoint, payload: Vec<u8>) -> Result<()> {
        endpoint.validate()?;
        self.conn
            .invoke(SEND, serde_json::to_value(SendPayload { endpoint, payload })?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint {
            network: "evm".into(),
            chain_id: "1".into(),
            contract_id: "0xabc".into(),
            telemetry_type: "ocr".into(),
        }
    }

    #[tokio::test]
    async fn test_server_rejects_incomplete_endpoint() {
        let mut telemetry = MockTelemetry::new();
        telemetry.expect_send().never();
        let server = TelemetryServer::new(Arc::new(telemetry));

        let mut incomplete = endpoint();
        incomplete.contract_id.clear();
        let err = server
            .call(SEND, json!({"endpoint": incomplete, "payload": [1, 2]}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(ref msg) if msg.contains("contractId")));
    }

    #[tokio::test]
    async fn test_server_forwards_payload() {
        let mut telemetry = MockTelemetry::new();
        telemetry
            .expect_send()
            .withf(|ep, payload| ep.chain_id == "1" && payload == &vec![7u8, 8])
            .times(1)
            .returning(|_, _| Ok(()));
        let server = TelemetryServer::new(Arc::new(telemetry));

        server
            .call(SEND, json!({"endpoint": endpoint(), "payload": [7, 8]}))
            .await
            .unwrap();
    }
}
