use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::broker::{params, Invoke, RpcService};
use crate::error::{Error, Result};

pub const NAME: &str = "ErrorLog";

const SAVE_ERROR: &str = "save_error";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ErrorLog: Send + Sync {
    async fn save_error(&self, msg: String) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct SaveError {
    msg: String,
}

pub struct ErrorLogServer {
    log: Arc<dyn ErrorLog>,
}

impl ErrorLogServer {
    pub fn new(log: Arc<dyn ErrorLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl RpcService for ErrorLogServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            SAVE_ERROR => {
                let req: SaveError = params(value)?;
                self.log.save_error(req.msg).await?;
                Ok(json!({}))
            }
            other => Err(Error::method_not_found(other)),
        }
    }
}

pub struct ErrorLogClient {
    conn: Arc<dyn Invoke>,
}

impl ErrorLogClient {
    pub fn new(conn: Arc<dyn Invoke>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ErrorLog for ErrorLogClient {
    async fn save_error(&self, msg: String) -> Result<()> {
        self.conn.invoke(SAVE_ERROR, json!(SaveError { msg })).await?;
        Ok(())
    }
}
