use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use super::stream::LineConnection;
use crate::error::{Result, TransportError};

/// Connection to a child process over its stdin/stdout.
pub type StdioConnection = LineConnection<ChildStdout, ChildStdin>;

/// Connection of a plugin process to its host over its own stdin/stdout.
pub type ParentConnection = LineConnection<tokio::io::Stdin, tokio::io::Stdout>;

/// Take the piped stdio of a freshly spawned child and wrap it.
///
/// The child's stderr, when piped, is forwarded into the log tagged with `name`.
pub fn attach(name: &str, child: &mut Child) -> Result<Arc<StdioConnection>> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::ConnectionFailed("Failed to get stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::ConnectionFailed("Failed to get stdout".into()))?;

    if let Some(stderr) = child.stderr.take() {
        forward_stderr(name.to_string(), stderr);
    }

    Ok(Arc::new(LineConnection::new(stdout, stdin)))
}

pub fn parent() -> Arc<ParentConnection> {
    Arc::new(LineConnection::new(tokio::io::stdin(), tokio::io::stdout()))
}

fn forward_stderr(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::info!(plugin = %name, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(plugin = %name, "Stopped reading stderr: {}", e);
                    break;
                }
            }
        }
    });
}
