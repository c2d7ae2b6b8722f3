use bytes::Bytes;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{params, BrokerId, RpcService};
use crate::error::{BrokerError, Error, Result, TransportError};
use crate::protocol::{
    control, DialParams, DispenseParams, DispenseResult, Frame, Request, WireError,
    CONTROL_SERVICE,
};
use crate::transport::Connection;

type Pending = oneshot::Sender<std::result::Result<Value, WireError>>;

/// Many logical services multiplexed over one connection.
///
/// Each side keeps its own registry; a request always addresses the receiving side's
/// registry by broker id. The control channel (id 0) answers `ping` and `dial` itself and
/// forwards anything else to a control extension registered under id 0.
pub struct Session {
    conn: Arc<dyn Connection>,
    services: DashMap<BrokerId, Arc<dyn RpcService>>,
    pending: DashMap<u64, Pending>,
    next_request: AtomicU64,
    next_id: AtomicU32,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(conn: Arc<dyn Connection>) -> Arc<Self> {
        let session = Arc::new(Self {
            conn: conn.clone(),
            services: DashMap::new(),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            next_id: AtomicU32::new(CONTROL_SERVICE + 1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            Arc::downgrade(&session),
            conn,
            session.shutdown.clone(),
        ));

        session
    }

    /// Reserve a fresh id. Ids are never handed out twice on one session.
    pub fn allocate_id(&self) -> BrokerId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, id: BrokerId, service: Arc<dyn RpcService>) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        self.services.insert(id, service);
        Ok(())
    }

    /// Install the handler for control methods other than `ping` and `dial`.
    pub fn set_control(&self, extension: Arc<dyn RpcService>) -> Result<()> {
        self.register(CONTROL_SERVICE, extension)
    }

    pub fn unregister(&self, id: BrokerId) -> bool {
        self.services.remove(&id).is_some()
    }

    pub fn is_served(&self, id: BrokerId) -> bool {
        id != CONTROL_SERVICE && self.services.contains_key(&id)
    }

    pub async fn call(&self, service: BrokerId, method: &str, params: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = Frame::request(id, service, method, params).encode()?;
        if let Err(e) = self.conn.send(frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(Error::from_wire(err)),
                Err(_) => Err(TransportError::Closed.into()),
            },
            _ = self.shutdown.cancelled() => {
                self.pending.remove(&id);
                Err(TransportError::Closed.into())
            }
        }
    }

    /// No-payload liveness probe.
    pub async fn ping(&self) -> Result<()> {
        self.call(CONTROL_SERVICE, control::PING, json!({})).await?;
        Ok(())
    }

    /// Ask the peer whether it serves `id`.
    pub async fn dial_check(&self, id: BrokerId) -> Result<()> {
        self.call(CONTROL_SERVICE, control::DIAL, json!(DialParams { id }))
            .await?;
        Ok(())
    }

    /// Ask the peer for the broker id of its named capability.
    pub async fn dispense(&self, name: &str) -> Result<BrokerId> {
        let value = self
            .call(
                CONTROL_SERVICE,
                control::DISPENSE,
                json!(DispenseParams {
                    name: name.to_string()
                }),
            )
            .await?;
        let result: DispenseResult = serde_json::from_value(value)?;
        Ok(result.id)
    }

    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.pending.clear();
        self.services.clear();
        self.conn.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the session has shut down, locally or because the peer went away.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    fn dispatch(self: &Arc<Self>, line: Bytes) {
        match Frame::decode(&line) {
            Ok(Frame::Request(request)) => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_request(request).await });
            }
            Ok(Frame::Response(response)) => {
                let Some((_, tx)) = self.pending.remove(&response.id) else {
                    tracing::debug!("Dropping response for unknown request {}", response.id);
                    return;
                };
                let reply = match response.error {
                    Some(err) => Err(err),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(reply);
            }
            Err(e) => {
                tracing::warn!("Discarding malformed frame: {}", e);
            }
        }
    }

    async fn handle_request(&self, request: Request) {
        let result = match (request.service, request.method.as_str()) {
            (CONTROL_SERVICE, control::PING) => Ok(json!({})),
            (CONTROL_SERVICE, control::DIAL) => params::<DialParams>(request.params).and_then(|p| {
                if self.is_served(p.id) {
                    Ok(json!({}))
                } else {
                    Err(Error::NotFound(format!("no service registered under id {}", p.id)))
                }
            }),
            (service, method) => {
                let handler = self.services.get(&service).map(|entry| entry.value().clone());
                match handler {
                    Some(handler) => handler.call(method, request.params).await,
                    None if service == CONTROL_SERVICE => {
                        Err(Error::method_not_found(method))
                    }
                    None => Err(BrokerError::ServiceNotFound(service).into()),
                }
            }
        };

        let frame = Frame::response(request.id, result.map_err(|e| e.to_wire()));
        match frame.encode() {
            Ok(line) => {
                if let Err(e) = self.conn.send(line).await {
                    tracing::debug!("Failed to send response {}: {}", request.id, e);
                }
            }
            Err(e) => tracing::error!("Failed to encode response {}: {}", request.id, e),
        }
    }
}

async fn read_loop(session: Weak<Session>, conn: Arc<dyn Connection>, shutdown: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = conn.recv() => received,
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        match received {
            Ok(line) => session.dispatch(line),
            Err(e) => {
                tracing::debug!("Session connection ended: {}", e);
                break;
            }
        }
    }

    shutdown.cancel();
    if let Some(session) = session.upgrade() {
        session.pending.clear();
        session.services.clear();
    }
}
