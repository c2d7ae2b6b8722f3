//! Bootstraps a reporting plugin through a supervised in-process plugin.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use plugin_host::broker::ResourceBroker;
use plugin_host::collaborators::keyvalue::MemoryStore;
use plugin_host::collaborators::pipeline::{Options, TaskResults, Vars};
use plugin_host::collaborators::telemetry::Endpoint;
use plugin_host::collaborators::{ErrorLog, KeyValueStore, PipelineRunner, Telemetry};
use plugin_host::config::SupervisorConfig;
use plugin_host::error::{Error, Result};
use plugin_host::metrics::Metrics;
use plugin_host::relayerset::{RelayId, Relayer, RelayerSet, PROVIDER_NAME};
use plugin_host::reporting::{
    plugin_server, Dependencies, FactoryConfig, ReportingPluginService,
    ReportingPluginServiceClient, CAPABILITY,
};
use plugin_host::services::{HealthReport, Service, ServiceServer};
use plugin_host::supervisor::{
    InProcess, PluginService, ProcessDescriptor, SupervisorOptions, SupervisorState,
};

struct Named(&'static str);

#[async_trait]
impl Service for Named {
    async fn name(&self) -> String {
        self.0.to_string()
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    async fn ready(&self) -> Result<()> {
        Ok(())
    }
    async fn health_report(&self) -> HealthReport {
        HealthReport::from([(self.0.to_string(), None)])
    }
}

/// Plugin side: records the provider it was handed and reports through the error log.
struct MedianPlugin;

#[async_trait]
impl Service for MedianPlugin {
    async fn name(&self) -> String {
        "median-plugin".to_string()
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    async fn ready(&self) -> Result<()> {
        Ok(())
    }
    async fn health_report(&self) -> HealthReport {
        HealthReport::from([("median-plugin".to_string(), None)])
    }
}

#[async_trait]
impl ReportingPluginService for MedianPlugin {
    async fn new_reporting_plugin_factory(
        &self,
        config: FactoryConfig,
        provider: Arc<dyn Service>,
        deps: Dependencies,
    ) -> Result<Arc<dyn Service>> {
        deps.key_value_store
            .store(config.plugin_name.clone(), provider.name().await.into_bytes())
            .await?;
        deps.error_log
            .save_error(format!("factory for {} created", config.plugin_name))
            .await?;
        Ok(Arc::new(Named("median-factory")))
    }
}

#[derive(Default)]
struct RecordingLog(Mutex<Vec<String>>);

#[async_trait]
impl ErrorLog for RecordingLog {
    async fn save_error(&self, msg: String) -> Result<()> {
        self.0.lock().unwrap().push(msg);
        Ok(())
    }
}

struct Unused;

#[async_trait]
impl PipelineRunner for Unused {
    async fn execute_run(&self, _spec: String, _vars: Vars, _options: Options) -> Result<TaskResults> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl Telemetry for Unused {
    async fn send(&self, _endpoint: Endpoint, _payload: Vec<u8>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RelayerSet for Unused {
    async fn get(&self, id: &RelayId) -> Result<Arc<dyn Relayer>> {
        Err(Error::NotFound(format!("relayer {}", id)))
    }
    async fn list(&self, _ids: &[RelayId]) -> Result<BTreeMap<RelayId, Arc<dyn Relayer>>> {
        Ok(BTreeMap::new())
    }
}

struct Host {
    service: PluginService<ReportingPluginServiceClient>,
    crashes: Arc<Mutex<Vec<CancellationToken>>>,
    store: Arc<MemoryStore>,
    log: Arc<RecordingLog>,
}

fn host() -> Host {
    let crashes: Arc<Mutex<Vec<CancellationToken>>> = Arc::default();
    let tokens = crashes.clone();
    let options = SupervisorOptions {
        config: SupervisorConfig {
            tick_interval_ms: 50,
            start_timeout_ms: 2000,
            health_check_timeout_ms: 200,
            dial_timeout_ms: 500,
        },
        metrics: Arc::new(Metrics::new()),
    };

    let service = PluginService::with_options(
        "median",
        CAPABILITY,
        options,
        move || {
            let crash = CancellationToken::new();
            tokens.lock().unwrap().push(crash.clone());
            Ok(Box::new(InProcess::new(plugin_server(Arc::new(MedianPlugin))).with_crash_token(crash))
                as Box<dyn ProcessDescriptor>)
        },
        |instance| async move { Ok(Arc::new(ReportingPluginServiceClient::from_instance(&instance))) },
    );

    Host {
        service,
        crashes,
        store: Arc::new(MemoryStore::default()),
        log: Arc::default(),
    }
}

impl Host {
    fn dependencies(&self) -> Dependencies {
        Dependencies {
            pipeline_runner: Arc::new(Unused),
            telemetry: Arc::new(Unused),
            error_log: self.log.clone(),
            key_value_store: self.store.clone(),
            relayer_set: Arc::new(Unused),
            capabilities_registry: None,
        }
    }

    fn served(&self) -> i64 {
        self.service.metrics().served_resources.get()
    }
}

fn config(plugin_name: &str) -> FactoryConfig {
    FactoryConfig {
        provider_type: "median".into(),
        plugin_name: plugin_name.into(),
        telemetry_type: "ocr".into(),
        plugin_config: json!({ "juelsPerFeeCoin": "0" }),
    }
}

#[tokio::test]
async fn test_bootstrap_through_supervised_plugin() {
    let host = host();
    host.service.start().await.unwrap();
    let facade = timeout(Duration::from_secs(3), host.service.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(facade.name().await, "median-plugin");

    let (provider_id, provider) = host
        .service
        .broker()
        .serve(PROVIDER_NAME, Arc::new(ServiceServer::new(Arc::new(Named("median-provider")))))
        .await
        .unwrap();

    let factory = facade
        .new_reporting_plugin_factory(config("feed-1"), provider_id, &host.dependencies())
        .await
        .unwrap();
    assert_eq!(factory.name().await, "median-factory");
    assert_eq!(host.store.get("feed-1".into()).await.unwrap(), b"median-provider".to_vec());
    assert_eq!(host.log.0.lock().unwrap().as_slice(), ["factory for feed-1 created"]);

    factory.close().await.unwrap();
    provider.close().await.unwrap();
    assert_eq!(host.served(), 0);

    host.service.close().await.unwrap();
    assert_eq!(host.service.state(), SupervisorState::Closed);
}

#[tokio::test]
async fn test_facade_bootstraps_again_after_crash() {
    let host = host();
    host.service.start().await.unwrap();
    let facade = host.service.wait().await.unwrap();

    if let Some(token) = host.crashes.lock().unwrap().last() {
        token.cancel();
    }

    let mut states = host.service.subscribe_state();
    timeout(Duration::from_secs(3), async {
        loop {
            let relaunched = host.crashes.lock().unwrap().len() >= 2;
            let healthy = *states.borrow_and_update() == SupervisorState::Healthy;
            if relaunched && healthy {
                break;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let same = host.service.service().unwrap();
    assert!(Arc::ptr_eq(&facade, &same));

    let (provider_id, _provider) = host
        .service
        .broker()
        .serve(PROVIDER_NAME, Arc::new(ServiceServer::new(Arc::new(Named("median-provider")))))
        .await
        .unwrap();
    let factory = facade
        .new_reporting_plugin_factory(config("feed-2"), provider_id, &host.dependencies())
        .await
        .unwrap();
    assert_eq!(factory.name().await, "median-factory");
    assert!(host.service.metrics().relaunches_total.get() >= 1);

    factory.close().await.unwrap();
    host.service.close().await.unwrap();
}
