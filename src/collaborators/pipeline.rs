use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::broker::{call, params, reply, Invoke, RpcService};
use crate::error::{Error, Result};

pub const NAME: &str = "PipelineRunner";

const EXECUTE_RUN: &str = "execute_run";

pub type Vars = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(default)]
    pub max_task_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub id: String,
    pub task_type: String,
    pub index: u32,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub is_terminal: bool,
}

pub type TaskResults = Vec<TaskResult>;

impl TaskResult {
    /// Value of the first terminal task that succeeded.
    pub fn final_value(results: &[TaskResult]) -> Option<&Value> {
        results
            .iter()
            .find(|r| r.is_terminal && r.error.is_none())
            .and_then(|r| r.value.as_ref())
    }
}

/// Executes pipeline specs on behalf of plugins.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn execute_run(&self, spec: String, vars: Vars, options: Options) -> Result<TaskResults>;
}

#[derive(Serialize, Deserialize)]
struct ExecuteRun {
    spec: String,
    #[serde(default)]
    vars: Vars,
    #[serde(default)]
    options: Options,
}

pub struct PipelineRunnerServer {
    runner: Arc<dyn PipelineRunner>,
}

impl PipelineRunnerServer {
    pub fn new(runner: Arc<dyn PipelineRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RpcService for PipelineRunnerServer {
    async fn call(&self, method: &str, value: Value) -> Result<Value> {
        match method {
            EXECUTE_RUN => {
                let req: ExecuteRun = params(value)?;
                reply(self.runner.execute_run(req.spec, req.vars, req.options).await?)
            }
            other => Err(Error::method_not_found(other)),
        }
    }
}

pub struct PipelineRunnerClient {
    conn: Arc<dyn Invoke>,
}

impl PipelineRunnerClient {
    pub fn new(conn: Arc<dyn Invoke>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PipelineRunner for PipelineRunnerClient {
    async fn execute_run(&self, spec: String, vars: Vars, options: Options) -> Result<TaskResults> {
        call(
            self.conn.as_ref(),
            EXECUTE_RUN,
            &ExecuteRun {
                spec,
                vars,
                options,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, ResourceBroker, Session};
    use crate::transport::memory;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_run_through_broker() {
        let mut runner = MockPipelineRunner::new();
        runner
            .expect_execute_run()
            .withf(|spec, vars, _| spec == "ds1 [type=bridge];" && vars.contains_key("jobRun"))
            .times(1)
            .returning(|_, _, _| {
                Ok(vec![TaskResult {
                    id: "ds1".into(),
                    task_type: "bridge".into(),
                    index: 0,
                    value: Some(json!("42")),
                    error: None,
                    is_terminal: true,
                }])
            });

        let (a, b) = memory::pair();
        let host = Broker::new("host");
        let plugin = Broker::new("plugin");
        host.install(Session::new(a));
        plugin.install(Session::new(b));

        let (id, _res) = host
            .serve(NAME, Arc::new(PipelineRunnerServer::new(Arc::new(runner))))
            .await
            .unwrap();
        let client = PipelineRunnerClient::new(Arc::new(plugin.dial(NAME, id).await.unwrap()));

        let vars = Vars::from([("jobRun".to_string(), json!({"meta": {}}))]);
        let results = client
            .execute_run("ds1 [type=bridge];".into(), vars, Options::default())
            .await
            .unwrap();
        assert_eq!(TaskResult::final_value(&results), Some(&json!("42")));
    }
}
