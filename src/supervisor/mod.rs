//! Plugin supervision
//!
//! [`PluginService`] keeps exactly one plugin process alive. A single keep-alive task
//! probes it on every tick and relaunches it when the probe fails, while the rest of the
//! program talks to a facade built once, on the first successful launch, whose
//! connections follow every relaunch through the shared [`Broker`].
//!
//! # Modules
//!
//! - `process`: spawning OS and in-process plugins
//! - `client`: one launched process plus its session
//! - `keepalive`: the probe/relaunch loop

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::SupervisorConfig;
use crate::error::{Error, Result, SupervisorError};
use crate::metrics::Metrics;
use crate::services::{HealthReport, Service};

pub mod client;
mod keepalive;
pub mod process;

pub use client::{PluginClient, RemoteInstance};
pub use process::{
    ChildProcess, CommandSpec, InProcess, PluginProcess, ProcessDescriptor, Spawned,
};

type NewProcess = Arc<dyn Fn() -> Result<Box<dyn ProcessDescriptor>> + Send + Sync>;
type NewService<S> = Arc<dyn Fn(RemoteInstance) -> BoxFuture<'static, Result<Arc<S>>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Healthy,
    Unhealthy,
    Relaunching,
    Closed,
}

#[derive(Debug, Clone)]
pub struct HealthCheckStatus {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

enum Control {
    Kill(oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SupervisorOptions {
    pub config: SupervisorConfig,
    pub metrics: Arc<Metrics>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            config: SupervisorConfig::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

struct Inner<S: Service + 'static> {
    name: String,
    capability: String,
    config: SupervisorConfig,
    metrics: Arc<Metrics>,
    new_process: NewProcess,
    new_service: NewService<S>,
    broker: Arc<Broker>,
    client: arc_swap::ArcSwapOption<PluginClient>,
    service: watch::Sender<Option<Arc<S>>>,
    state: watch::Sender<SupervisorState>,
    last_check: RwLock<Option<HealthCheckStatus>>,
    stop: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    control: mpsc::UnboundedSender<Control>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A [`Service`] backed by a supervised plugin process.
///
/// The facade of type `S` is built exactly once and then stays the same object for the
/// life of the supervisor, no matter how many times the process is relaunched.
pub struct PluginService<S: Service + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: Service + 'static> Clone for PluginService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Service + 'static> PluginService<S> {
    /// `new_process` is asked for a fresh descriptor before every launch attempt;
    /// `new_service` builds the facade after the first successful launch.
    pub fn new<P, F, Fut>(
        name: impl Into<String>,
        capability: impl Into<String>,
        new_process: P,
        new_service: F,
    ) -> Self
    where
        P: Fn() -> Result<Box<dyn ProcessDescriptor>> + Send + Sync + 'static,
        F: Fn(RemoteInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<S>>> + Send + 'static,
    {
        Self::with_options(
            name,
            capability,
            SupervisorOptions::default(),
            new_process,
            new_service,
        )
    }

    pub fn with_options<P, F, Fut>(
        name: impl Into<String>,
        capability: impl Into<String>,
        options: SupervisorOptions,
        new_process: P,
        new_service: F,
    ) -> Self
    where
        P: Fn() -> Result<Box<dyn ProcessDescriptor>> + Send + Sync + 'static,
        F: Fn(RemoteInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<S>>> + Send + 'static,
    {
        let name = name.into();
        let broker = Broker::new(name.clone())
            .with_metrics(options.metrics.clone())
            .with_dial_timeout(options.config.dial_timeout());
        let (control, control_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                name,
                capability: capability.into(),
                config: options.config,
                metrics: options.metrics,
                new_process: Arc::new(new_process),
                new_service: Arc::new(move |instance| Box::pin(new_service(instance))),
                broker: Arc::new(broker),
                client: arc_swap::ArcSwapOption::empty(),
                service: watch::channel(None).0,
                state: watch::channel(SupervisorState::Idle).0,
                last_check: RwLock::new(None),
                stop: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                control,
                control_rx: Mutex::new(Some(control_rx)),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The broker whose session follows the live plugin process.
    pub fn broker(&self) -> &Arc<Broker> {
        &self.inner.broker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Begin supervising. The first launch happens in the background.
    pub async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SupervisorError::Closed(self.inner.name.clone()).into());
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(control_rx) = self.inner.control_rx.lock().await.take() else {
            return Ok(());
        };

        tracing::info!(plugin = %self.inner.name, "Starting plugin supervisor");
        self.inner.state.send_replace(SupervisorState::Starting);
        let handle = tokio::spawn(self.inner.clone().keep_alive(control_rx));
        *self.inner.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop supervising, close the facade, then stop the plugin. Runs once.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(plugin = %self.inner.name, "Closing plugin supervisor");
        self.inner.stop.cancel();

        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(plugin = %self.inner.name, "Keep-alive task failed: {}", e);
            }
        }

        let mut result = Ok(());
        if let Some(service) = self.service() {
            match service.close().await {
                Ok(()) => {}
                Err(e) if e.is_cancellation() || e.is_transport() => {
                    tracing::debug!(plugin = %self.inner.name, "Facade close cancelled: {}", e);
                }
                Err(e) => result = Err(e),
            }
        }

        if let Some(client) = self.inner.client.swap(None) {
            client.close().await;
        }
        self.inner.state.send_replace(SupervisorState::Closed);
        tracing::info!(plugin = %self.inner.name, "Plugin supervisor closed");
        result
    }

    /// The facade, once the first launch has succeeded.
    pub fn service(&self) -> Option<Arc<S>> {
        self.inner.service.borrow().clone()
    }

    pub async fn ready(&self) -> Result<()> {
        match self.service() {
            Some(service) => service.ready().await,
            None => Err(Error::Unavailable(format!(
                "plugin {} has not started yet",
                self.inner.name
            ))),
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        let Some(service) = self.service() else {
            return HealthReport::from([(
                self.inner.name.clone(),
                Some("plugin unavailable".to_string()),
            )]);
        };

        let mut report = HealthReport::new();
        report.insert(self.inner.name.clone(), self.own_health().await);
        report.extend(service.health_report().await);
        report
    }

    async fn own_health(&self) -> Option<String> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Some("closed".to_string());
        }
        match self.inner.client.load_full() {
            Some(client) if !client.exited() => match &*self.inner.last_check.read().await {
                Some(status) if !status.success => status.error.clone(),
                _ => None,
            },
            _ => Some("plugin process not running".to_string()),
        }
    }

    /// Wait for the facade. Fails with [`Error::Stopped`] if the supervisor is closed first.
    pub async fn wait(&self) -> Result<Arc<S>> {
        self.wait_ctx(&CancellationToken::new()).await
    }

    /// Like [`wait`](Self::wait), also failing with [`Error::Cancelled`] when `cancel` fires.
    pub async fn wait_ctx(&self, cancel: &CancellationToken) -> Result<Arc<S>> {
        let mut rx = self.inner.service.subscribe();
        tokio::select! {
            biased;
            ready = rx.wait_for(Option::is_some) => {
                let service = ready.map_err(|_| Error::Stopped)?.clone();
                service.ok_or(Error::Stopped)
            }
            _ = self.inner.stop.cancelled() => Err(Error::Stopped),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub async fn last_health_check(&self) -> Option<HealthCheckStatus> {
        self.inner.last_check.read().await.clone()
    }

    /// Kill the current process. The next tick notices and relaunches.
    pub async fn kill(&self) -> Result<()> {
        self.send_control(Control::Kill).await
    }

    /// Close and forget the current process. The next tick launches a new one.
    pub async fn reset(&self) -> Result<()> {
        self.send_control(Control::Reset).await
    }

    async fn send_control(&self, control: fn(oneshot::Sender<()>) -> Control) -> Result<()> {
        if !self.inner.started.load(Ordering::SeqCst) || self.inner.stop.is_cancelled() {
            return Err(Error::Stopped);
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .control
            .send(control(tx))
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)
    }
}

#[async_trait]
impl<S: Service + 'static> Service for PluginService<S> {
    async fn name(&self) -> String {
        self.inner.name.clone()
    }

    async fn start(&self) -> Result<()> {
        PluginService::start(self).await
    }

    async fn close(&self) -> Result<()> {
        PluginService::close(self).await
    }

    async fn ready(&self) -> Result<()> {
        PluginService::ready(self).await
    }

    async fn health_report(&self) -> HealthReport {
        PluginService::health_report(self).await
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod supervisor_tests;
