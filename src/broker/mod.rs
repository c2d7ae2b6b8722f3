//! Resource broker: serve local services and dial remote ones over a multiplexed session.
//!
//! # Rule for callers
//!
//! When a sequence of `serve`/`dial` steps fails at step *k*, the resources of steps
//! `1..k-1` must be released with [`close_all`](crate::resource::close_all) before the
//! error is returned. Nothing here enforces it; every call site in this crate follows it.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{BrokerError, Error, Result};
use crate::metrics::Metrics;
use crate::resource::{close_all, Resource};

pub mod client_conn;
pub mod session;

pub use client_conn::ClientConn;
pub use session::Session;

/// Correlates one `serve` with one `dial` on a single session.
pub type BrokerId = u32;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A locally implemented service reachable through the broker.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// Anything that can carry a call to one remote service.
#[async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value>;
}

/// Typed call through an [`Invoke`].
pub async fn call<C, P, R>(conn: &C, method: &str, params: &P) -> Result<R>
where
    C: Invoke + ?Sized,
    P: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let value = conn.invoke(method, serde_json::to_value(params)?).await?;
    Ok(serde_json::from_value(value)?)
}

/// Decode request params, reporting failures as invalid params.
pub fn params<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::InvalidParams(e.to_string()))
}

pub fn reply<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// The serve/dial seam used by bootstrap code.
#[async_trait]
pub trait ResourceBroker: Send + Sync {
    /// Register `service` and tie `deps` to its lifetime.
    ///
    /// The returned resource unregisters the service, then releases `deps` in order. On
    /// failure `deps` are released before the error is returned.
    async fn serve_new(
        &self,
        name: &str,
        service: Arc<dyn RpcService>,
        deps: Vec<Resource>,
    ) -> Result<(BrokerId, Resource)>;

    async fn serve(&self, name: &str, service: Arc<dyn RpcService>) -> Result<(BrokerId, Resource)> {
        self.serve_new(name, service, Vec::new()).await
    }

    /// Open a handle to a service the peer registered under `id`.
    async fn dial(&self, name: &str, id: BrokerId) -> Result<ServiceConn>;
}

/// Client-side handle to one peer-registered service.
#[derive(Clone)]
pub struct ServiceConn {
    name: String,
    id: BrokerId,
    session: Arc<Session>,
}

impl std::fmt::Debug for ServiceConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConn")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServiceConn {
    pub fn new(name: impl Into<String>, id: BrokerId, session: Arc<Session>) -> Self {
        Self {
            name: name.into(),
            id,
            session,
        }
    }

    pub fn id(&self) -> BrokerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    pub(crate) fn same_as(&self, other: &ServiceConn) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.session, &other.session)
    }
}

#[async_trait]
impl Invoke for ServiceConn {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        self.session.call(self.id, method, params).await
    }
}

/// Broker over whichever session is current.
///
/// The session is swapped wholesale by [`install`](Broker::install) whenever the owning
/// plugin is relaunched, so lazily resolved connections always reach the live process.
pub struct Broker {
    name: String,
    session: ArcSwapOption<Session>,
    metrics: Arc<Metrics>,
    dial_timeout: Duration,
}

impl Broker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session: ArcSwapOption::empty(),
            metrics: Arc::new(Metrics::new()),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn install(&self, session: Arc<Session>) {
        self.session.store(Some(session));
    }

    pub fn current(&self) -> Result<Arc<Session>> {
        match self.session.load_full() {
            Some(session) if !session.is_closed() => Ok(session),
            _ => Err(BrokerError::NoSession.into()),
        }
    }

    /// A connection that calls `dial_fn` to (re)establish its target on demand.
    pub fn new_client_conn<F, Fut>(self: &Arc<Self>, name: impl Into<String>, dial_fn: F) -> ClientConn
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(BrokerId, Vec<Resource>)>> + Send + 'static,
    {
        ClientConn::new(name, self.clone(), dial_fn)
    }
}

#[async_trait]
impl ResourceBroker for Broker {
    async fn serve_new(
        &self,
        name: &str,
        service: Arc<dyn RpcService>,
        deps: Vec<Resource>,
    ) -> Result<(BrokerId, Resource)> {
        let session = match self.current() {
            Ok(session) => session,
            Err(e) => {
                let _ = close_all(&deps).await;
                return Err(BrokerError::Serve {
                    name: name.to_string(),
                    id: 0,
                    reason: e.to_string(),
                }
                .into());
            }
        };

        let id = session.allocate_id();
        if let Err(e) = session.register(id, service) {
            let _ = close_all(&deps).await;
            return Err(BrokerError::Serve {
                name: name.to_string(),
                id,
                reason: e.to_string(),
            }
            .into());
        }

        tracing::debug!(broker = %self.name, id, "Serving {}", name);
        self.metrics.served_resources.inc();

        let weak = Arc::downgrade(&session);
        let metrics = self.metrics.clone();
        let resource = Resource::new(name, move || async move {
            if let Some(session) = weak.upgrade() {
                session.unregister(id);
            }
            metrics.served_resources.dec();
            close_all(&deps).await
        });

        Ok((id, resource))
    }

    async fn dial(&self, name: &str, id: BrokerId) -> Result<ServiceConn> {
        let wrap = |source: Error| -> Error {
            BrokerError::Dial {
                name: name.to_string(),
                id,
                source: Box::new(source),
            }
            .into()
        };

        let result = async {
            let session = self.current()?;
            timeout(self.dial_timeout, session.dial_check(id))
                .await
                .map_err(|_| Error::Timeout)??;
            Ok::<_, Error>(session)
        }
        .await;

        match result {
            Ok(session) => Ok(ServiceConn::new(name, id, session)),
            Err(e) => {
                self.metrics.dial_failures.inc();
                Err(wrap(e))
            }
        }
    }
}
