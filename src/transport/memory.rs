use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::Connection;
use crate::error::{Result, TransportError};

/// One end of an in-process connection pair.
pub struct MemoryConnection {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

/// Two connected ends: whatever one sends the other receives.
pub fn pair() -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Arc::new(MemoryConnection::new(a_tx, b_rx)),
        Arc::new(MemoryConnection::new(b_tx, a_rx)),
    )
}

impl MemoryConnection {
    fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        match self.tx.lock().await.as_ref() {
            Some(tx) => tx.send(data).map_err(|_| TransportError::Closed.into()),
            None => Err(TransportError::Closed.into()),
        }
    }

    async fn recv(&self) -> Result<Bytes> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        match self.rx.lock().await.recv().await {
            Some(data) => Ok(data),
            None => {
                self.closed.store(true, Ordering::SeqCst);
                Err(TransportError::Closed.into())
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the sender ends the peer's stream.
        self.tx.lock().await.take();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
