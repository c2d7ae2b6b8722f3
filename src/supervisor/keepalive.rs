use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::client::bounded;
use super::{Control, HealthCheckStatus, Inner, PluginClient, RemoteInstance, SupervisorState};
use crate::error::{Error, Result};
use crate::services::Service;

impl<S: Service + 'static> Inner<S> {
    /// The only writer of `client`. Probes on every tick, immediately on the first.
    pub(super) async fn keep_alive(self: Arc<Self>, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(control) = control.recv() => self.handle_control(control).await,
                _ = ticker.tick() => self.check().await,
            }
        }

        tracing::debug!(plugin = %self.name, "Keep-alive loop exited");
    }

    async fn handle_control(&self, control: Control) {
        match control {
            Control::Kill(done) => {
                if let Some(client) = self.client.load_full() {
                    tracing::info!(plugin = %self.name, "Killing plugin process");
                    client.close().await;
                }
                let _ = done.send(());
            }
            Control::Reset(done) => {
                if let Some(client) = self.client.swap(None) {
                    tracing::info!(plugin = %self.name, "Resetting plugin process");
                    client.close().await;
                }
                self.state.send_replace(SupervisorState::Unhealthy);
                let _ = done.send(());
            }
        }
    }

    async fn check(&self) {
        let current = self.client.load_full();

        if let Some(client) = &current {
            let started = Instant::now();
            let outcome = if client.exited() {
                Err("plugin process exited".to_string())
            } else {
                let deadline = started + self.config.health_check_timeout();
                match bounded(client.ping(), &self.stop, deadline).await {
                    Ok(()) => Ok(()),
                    Err(Error::Cancelled) => return,
                    Err(Error::Timeout) => Err("Health check timed out".to_string()),
                    Err(e) => Err(format!("Health check failed: {}", e)),
                }
            };
            let healthy = outcome.is_ok();

            *self.last_check.write().await = Some(HealthCheckStatus {
                timestamp: Utc::now(),
                success: healthy,
                response_time_ms: healthy.then(|| started.elapsed().as_millis() as u64),
                error: outcome.as_ref().err().cloned(),
            });
            self.metrics.record_health_check(healthy);

            match outcome {
                Ok(()) => {
                    tracing::trace!(plugin = %self.name, "Health check passed");
                    self.state.send_if_modified(|state| {
                        let changed = *state != SupervisorState::Healthy;
                        *state = SupervisorState::Healthy;
                        changed
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(plugin = %self.name, "{}", e);
                    self.state.send_replace(SupervisorState::Unhealthy);
                }
            }
        }

        self.try_launch(current).await;
    }

    /// Replace `observed` with a fresh process, unless someone already replaced it.
    async fn try_launch(&self, observed: Option<Arc<PluginClient>>) {
        let current = self.client.load_full();
        let unchanged = match (&current, &observed) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !unchanged {
            tracing::debug!(plugin = %self.name, "Handle already replaced, skipping launch");
            return;
        }

        if let Some(old) = self.client.swap(None) {
            tracing::info!(plugin = %self.name, "Relaunching plugin");
            old.close().await;
            self.metrics.relaunches_total.inc();
            self.state.send_replace(SupervisorState::Relaunching);
        } else {
            self.state.send_replace(SupervisorState::Starting);
        }

        let started = Instant::now();
        match self.launch(started + self.config.start_timeout()).await {
            Ok(client) => {
                self.metrics.record_launch(started.elapsed(), true);
                tracing::info!(
                    plugin = %self.name,
                    pid = ?client.pid(),
                    "Plugin launched in {:?}",
                    started.elapsed()
                );
                self.client.store(Some(client));
                self.state.send_replace(SupervisorState::Healthy);
            }
            Err(Error::Cancelled) => {
                tracing::debug!(plugin = %self.name, "Launch abandoned on shutdown");
            }
            Err(Error::Timeout) => {
                self.metrics.record_launch(started.elapsed(), false);
                tracing::error!(
                    plugin = %self.name,
                    "Timed out launching plugin after {:?}",
                    self.config.start_timeout()
                );
                self.state.send_replace(SupervisorState::Unhealthy);
            }
            Err(e) => {
                self.metrics.record_launch(started.elapsed(), false);
                tracing::error!(plugin = %self.name, "Failed to launch plugin: {}", e);
                self.state.send_replace(SupervisorState::Unhealthy);
            }
        }
    }

    async fn launch(&self, deadline: Instant) -> Result<Arc<PluginClient>> {
        let descriptor = (self.new_process)()?;
        let client = PluginClient::launch(&self.name, &self.capability, descriptor, &self.stop, deadline)
            .await?;
        let client = Arc::new(client);
        self.broker.install(client.session().clone());

        if self.service.borrow().is_none() {
            let instance = RemoteInstance {
                name: self.name.clone(),
                capability: self.capability.clone(),
                id: client.instance(),
                broker: self.broker.clone(),
            };
            match bounded((self.new_service)(instance), &self.stop, deadline).await {
                Ok(service) => {
                    self.service.send_replace(Some(service));
                    tracing::info!(plugin = %self.name, "Plugin service ready");
                }
                Err(e) => {
                    client.close().await;
                    return Err(e);
                }
            }
        }

        Ok(client)
    }
}
