use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod memory;
pub mod stdio;
pub mod stream;

pub use memory::MemoryConnection;
pub use stdio::StdioConnection;
pub use stream::LineConnection;

/// A bidirectional, message-oriented link to one peer.
///
/// Each `send` carries one complete frame and each `recv` yields one. Only one task is
/// expected to call `recv` at a time; `send` may be called concurrently.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn send(&self, data: Bytes) -> Result<()>;
    async fn recv(&self) -> Result<Bytes>;
    async fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;
}
