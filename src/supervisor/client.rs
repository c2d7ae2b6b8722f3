use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::process::{PluginProcess, ProcessDescriptor, Spawned};
use crate::broker::{Broker, BrokerId, ClientConn, Session};
use crate::error::{Error, Result};

/// Run `fut` unless `stop` fires or `deadline` passes first.
pub(crate) async fn bounded<T>(
    fut: impl Future<Output = Result<T>>,
    stop: &CancellationToken,
    deadline: Instant,
) -> Result<T> {
    tokio::select! {
        result = fut => result,
        _ = stop.cancelled() => Err(Error::Cancelled),
        _ = sleep_until(deadline) => Err(Error::Timeout),
    }
}

/// One launched plugin process and the session to it.
pub struct PluginClient {
    name: String,
    process: Box<dyn PluginProcess>,
    session: Arc<Session>,
    instance: BrokerId,
    closed: AtomicBool,
}

impl PluginClient {
    /// Spawn, handshake with a ping, and dispense `capability`.
    ///
    /// Whatever was started is torn down again if any step fails, `stop` fires, or
    /// `deadline` passes.
    pub async fn launch(
        name: &str,
        capability: &str,
        descriptor: Box<dyn ProcessDescriptor>,
        stop: &CancellationToken,
        deadline: Instant,
    ) -> Result<Self> {
        let Spawned { process, conn } = bounded(descriptor.spawn(name), stop, deadline).await?;
        let session = Session::new(conn);

        let handshake = async {
            session.ping().await?;
            session.dispense(capability).await
        };
        match bounded(handshake, stop, deadline).await {
            Ok(instance) => Ok(Self {
                name: name.to_string(),
                process,
                session,
                instance,
                closed: AtomicBool::new(false),
            }),
            Err(e) => {
                let _ = session.close().await;
                let _ = process.kill().await;
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Broker id of the dispensed capability on this client's session.
    pub fn instance(&self) -> BrokerId {
        self.instance
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn exited(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.session.is_closed() || self.process.exited()
    }

    pub async fn ping(&self) -> Result<()> {
        self.session.ping().await
    }

    /// Close the session, then stop the process. Runs once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.session.close().await {
            tracing::debug!(plugin = %self.name, "Error closing session: {}", e);
        }
        if let Err(e) = self.process.kill().await {
            tracing::warn!(plugin = %self.name, "Failed to stop plugin process: {}", e);
        }
    }
}

/// What a service factory gets to build its facade from.
#[derive(Clone)]
pub struct RemoteInstance {
    pub name: String,
    pub capability: String,
    /// Broker id of the capability on the session current at first launch.
    pub id: BrokerId,
    pub broker: Arc<Broker>,
}

impl RemoteInstance {
    /// A connection to the capability that re-dispenses it on whichever session is
    /// current, so it keeps working across relaunches.
    pub fn client_conn(&self) -> ClientConn {
        let broker = self.broker.clone();
        let capability = self.capability.clone();
        self.broker.new_client_conn(self.capability.clone(), move || {
            let broker = broker.clone();
            let capability = capability.clone();
            async move {
                let id = broker.current()?.dispense(&capability).await?;
                Ok((id, Vec::new()))
            }
        })
    }
}
