use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::Connection;
use crate::error::{Result, TransportError};

const MAX_LINE_LENGTH: usize = 1024 * 1024; // 1MB

/// Newline-delimited frames over any byte stream pair.
pub struct LineConnection<R, W> {
    reader: Mutex<FramedRead<R, LinesCodec>>,
    writer: Mutex<Option<W>>,
    closed: AtomicBool,
}

impl<R, W> LineConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> Connection for LineConnection<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        writer
            .write_all(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if data.last() != Some(&b'\n') {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        Ok(())
    }

    async fn recv(&self) -> Result<Bytes> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return Ok(Bytes::from(line)),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(TransportError::InvalidFormat.into())
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()).into())
                }
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed.into());
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the writer closes the pipe; shutdown alone leaves a child's stdin open.
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Failed to shut down writer: {}", e);
            }
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
