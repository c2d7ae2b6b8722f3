use super::*;
use crate::broker::RpcService;
use crate::plugin::PluginServer;
use crate::services::{ServiceClient, ServiceServer};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::time::timeout;

struct Echo;

#[async_trait]
impl Service for Echo {
    async fn name(&self) -> String {
        "echo".to_string()
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
        HealthReport::from([("echo".to_string(), None)])
    }
}

fn echo_server() -> PluginServer {
    PluginServer::new("echo", |_| async {
        Ok(Arc::new(ServiceServer::new(Arc::new(Echo))) as Arc<dyn RpcService>)
    })
}

fn fast_options() -> SupervisorOptions {
    SupervisorOptions {
        config: SupervisorConfig {
            tick_interval_ms: 50,
            start_timeout_ms: 1000,
            health_check_timeout_ms: 200,
            dial_timeout_ms: 500,
        },
        metrics: Arc::new(Metrics::new()),
    }
}

async fn facade(instance: RemoteInstance) -> Result<Arc<ServiceClient>> {
    Ok(Arc::new(ServiceClient::new(
        instance.name.clone(),
        Arc::new(instance.client_conn()),
    )))
}

/// Spawns are counted; each spawned plugin can be crashed through its token.
#[derive(Default)]
struct Launches {
    spawned: AtomicUsize,
    crashes: std::sync::Mutex<Vec<CancellationToken>>,
}

impl Launches {
    fn count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn crash_latest(&self) {
        if let Some(token) = self.crashes.lock().unwrap().last() {
            token.cancel();
        }
    }
}

fn supervised(launches: Arc<Launches>) -> PluginService<ServiceClient> {
    supervised_with(launches, fast_options())
}

fn supervised_with(launches: Arc<Launches>, options: SupervisorOptions) -> PluginService<ServiceClient> {
    PluginService::with_options(
        "echo-plugin",
        "echo",
        options,
        move || {
            launches.spawned.fetch_add(1, Ordering::SeqCst);
            let crash = CancellationToken::new();
            launches.crashes.lock().unwrap().push(crash.clone());
            Ok(Box::new(InProcess::new(echo_server()).with_crash_token(crash))
                as Box<dyn ProcessDescriptor>)
        },
        facade,
    )
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_not_ready_before_start() {
    let service = supervised(Arc::new(Launches::default()));

    assert_eq!(service.state(), SupervisorState::Idle);
    assert!(matches!(service.ready().await, Err(Error::Unavailable(_))));

    let report = service.health_report().await;
    assert_eq!(report.len(), 1);
    assert!(report["echo-plugin"].is_some());
    assert!(service.service().is_none());
}

#[tokio::test]
async fn test_start_launches_and_becomes_ready() {
    let launches = Arc::new(Launches::default());
    let service = supervised(launches.clone());
    service.start().await.unwrap();
    service.start().await.unwrap();

    let facade = timeout(Duration::from_secs(3), service.wait())
        .await
        .unwrap()
        .unwrap();
    service.ready().await.unwrap();
    assert_eq!(facade.name().await, "echo");
    assert_eq!(launches.count(), 1);

    let report = service.health_report().await;
    assert_eq!(report.get("echo-plugin"), Some(&None));
    assert_eq!(report.get("echo"), Some(&None));

    service.close().await.unwrap();
    assert_eq!(service.state(), SupervisorState::Closed);
}

#[tokio::test]
async fn test_facade_survives_relaunch() {
    let launches = Arc::new(Launches::default());
    let service = supervised(launches.clone());
    service.start().await.unwrap();
    let before = service.wait().await.unwrap();

    launches.crash_latest();
    eventually(|| service.metrics().relaunches_total.get() >= 1).await;
    eventually(|| service.state() == SupervisorState::Healthy).await;

    let after = service.service().unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    before.ready().await.unwrap();
    assert_eq!(launches.count(), 2);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_each_failed_health_check_relaunches_once() {
    let launches = Arc::new(Launches::default());
    let service = supervised(launches.clone());
    service.start().await.unwrap();
    service.wait().await.unwrap();

    let mut previous = service.inner.client.load_full().unwrap();
    for round in 1..=2 {
        launches.crash_latest();
        eventually(|| launches.count() == round + 1 && service.state() == SupervisorState::Healthy)
            .await;

        let current = service.inner.client.load_full().unwrap();
        assert!(!Arc::ptr_eq(&previous, &current));
        assert!(previous.exited());
        assert!(previous.session().is_closed());
        assert!(!current.exited());
        previous = current;
    }

    assert_eq!(service.metrics().relaunches_total.get(), 2);
    assert_eq!(launches.count(), 3);
    service.close().await.unwrap();
}

#[tokio::test]
async fn test_close_after_unnoticed_crash_is_clean() {
    let launches = Arc::new(Launches::default());
    let mut options = fast_options();
    options.config.tick_interval_ms = 60_000;
    options.config.start_timeout_ms = 60_000;
    let service = supervised_with(launches.clone(), options);
    service.start().await.unwrap();
    timeout(Duration::from_secs(3), service.wait())
        .await
        .unwrap()
        .unwrap();

    let client = service.inner.client.load_full().unwrap();
    launches.crash_latest();
    eventually(|| client.exited()).await;

    timeout(Duration::from_secs(2), service.close())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(service.state(), SupervisorState::Closed);
    assert_eq!(launches.count(), 1);
}

#[tokio::test]
async fn test_facade_failure_leaves_latch_unset_and_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let service: PluginService<ServiceClient> = PluginService::with_options(
        "picky",
        "echo",
        fast_options(),
        || Ok(Box::new(InProcess::new(echo_server())) as Box<dyn ProcessDescriptor>),
        move |instance| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= 2 {
                    return Err(Error::Unavailable(format!("facade attempt {} refused", attempt)));
                }
                facade(instance).await
            }
        },
    );

    service.start().await.unwrap();
    eventually(|| service.metrics().launch_failures_total.get() >= 1).await;
    assert!(matches!(service.ready().await, Err(Error::Unavailable(_))));

    let built = timeout(Duration::from_secs(3), service.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(service.metrics().launch_failures_total.get(), 2);
    assert!(Arc::ptr_eq(&built, &service.service().unwrap()));
    service.ready().await.unwrap();

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_kill_triggers_relaunch() {
    let launches = Arc::new(Launches::default());
    let service = supervised(launches.clone());
    service.start().await.unwrap();
    service.wait().await.unwrap();

    service.kill().await.unwrap();
    eventually(|| launches.count() == 2).await;
    eventually(|| service.state() == SupervisorState::Healthy).await;
    service.ready().await.unwrap();

    let status = service.last_health_check().await;
    assert!(status.is_some());

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_reset_launches_fresh_process() {
    let launches = Arc::new(Launches::default());
    let service = supervised(launches.clone());
    service.start().await.unwrap();
    service.wait().await.unwrap();

    service.reset().await.unwrap();
    eventually(|| launches.count() == 2).await;
    eventually(|| service.state() == SupervisorState::Healthy).await;
    service.ready().await.unwrap();

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_launch_failures_do_not_stop_supervision() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let service: PluginService<ServiceClient> = PluginService::with_options(
        "flaky",
        "echo",
        fast_options(),
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                return Err(SupervisorError::LaunchFailed {
                    name: "flaky".into(),
                    reason: "not yet".into(),
                }
                .into());
            }
            Ok(Box::new(InProcess::new(echo_server())) as Box<dyn ProcessDescriptor>)
        },
        facade,
    );

    service.start().await.unwrap();
    timeout(Duration::from_secs(3), service.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(service.metrics().launch_failures_total.get(), 3);

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_capability_keeps_retrying() {
    let service: PluginService<ServiceClient> = PluginService::with_options(
        "mismatch",
        "reporting-plugin",
        fast_options(),
        || Ok(Box::new(InProcess::new(echo_server())) as Box<dyn ProcessDescriptor>),
        facade,
    );
    service.start().await.unwrap();

    eventually(|| service.metrics().launch_failures_total.get() >= 2).await;
    assert!(service.service().is_none());

    service.close().await.unwrap();
}

#[tokio::test]
async fn test_close_before_start() {
    let service = supervised(Arc::new(Launches::default()));
    service.close().await.unwrap();
    service.close().await.unwrap();

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, Error::Supervisor(SupervisorError::Closed(_))));
    assert!(matches!(service.wait().await, Err(Error::Stopped)));
    assert!(matches!(service.kill().await, Err(Error::Stopped)));
}

#[tokio::test]
async fn test_wait_ctx_cancelled() {
    let service: PluginService<ServiceClient> = PluginService::with_options(
        "never",
        "echo",
        fast_options(),
        || {
            Err(SupervisorError::LaunchFailed {
                name: "never".into(),
                reason: "no binary".into(),
            }
            .into())
        },
        facade,
    );
    service.start().await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.wait_ctx(&cancel).await })
    };
    cancel.cancel();
    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move { service.wait().await })
    };
    service.close().await.unwrap();
    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Stopped)));
}

#[tokio::test]
async fn test_close_abandons_inflight_launch() {
    let hanging = PluginServer::new("echo", |_| async {
        std::future::pending::<()>().await;
        Ok(Arc::new(ServiceServer::new(Arc::new(Echo))) as Arc<dyn RpcService>)
    });
    let mut options = fast_options();
    options.config.start_timeout_ms = 60_000;
    let service: PluginService<ServiceClient> = PluginService::with_options(
        "hanging",
        "echo",
        options,
        move || Ok(Box::new(InProcess::new(hanging.clone())) as Box<dyn ProcessDescriptor>),
        facade,
    );

    service.start().await.unwrap();
    eventually(|| service.state() == SupervisorState::Starting).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(Duration::from_secs(1), service.close())
        .await
        .expect("close must not wait for the launch")
        .unwrap();
    assert!(service.service().is_none());
    assert_eq!(service.state(), SupervisorState::Closed);
}

#[tokio::test]
async fn test_concurrent_waiters_share_one_facade() {
    let service = supervised(Arc::new(Launches::default()));
    service.start().await.unwrap();

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.wait().await })
        })
        .collect();

    let mut facades = Vec::new();
    for waiter in waiters {
        facades.push(waiter.await.unwrap().unwrap());
    }
    assert!(facades.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

    service.close().await.unwrap();
}
