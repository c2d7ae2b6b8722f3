//! Plugin process spawning
//!
//! A [`ProcessDescriptor`] describes one launch. The supervisor asks for a fresh
//! descriptor before every attempt because spawning consumes it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PluginConfig;
use crate::error::{Result, SupervisorError};
use crate::plugin::{self, PluginServer};
use crate::transport::{memory, stdio, Connection, MemoryConnection};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A running plugin process.
#[async_trait]
pub trait PluginProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// True once the process is known to be gone.
    fn exited(&self) -> bool;

    /// Stop the process. Safe to call more than once.
    async fn kill(&self) -> Result<()>;
}

/// A spawned process and the connection to it.
pub struct Spawned {
    pub process: Box<dyn PluginProcess>,
    pub conn: Arc<dyn Connection>,
}

/// How to start one plugin process.
#[async_trait]
pub trait ProcessDescriptor: Send {
    async fn spawn(self: Box<Self>, name: &str) -> Result<Spawned>;
}

/// An external executable speaking the line protocol on stdin/stdout.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
    grace_period: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            working_dir: config.working_directory.clone(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// How long a process gets to exit after SIGTERM before it is killed.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl ProcessDescriptor for CommandSpec {
    async fn spawn(self: Box<Self>, name: &str) -> Result<Spawned> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::LaunchFailed {
            name: name.to_string(),
            reason: format!("failed to spawn {}: {}", self.program, e),
        })?;
        let pid = child.id();
        let conn = stdio::attach(name, &mut child)?;
        tracing::debug!(plugin = %name, pid = ?pid, "Spawned {}", self.program);

        Ok(Spawned {
            process: Box::new(ChildProcess {
                name: name.to_string(),
                pid,
                child: Mutex::new(child),
                grace_period: self.grace_period,
                killed: AtomicBool::new(false),
            }),
            conn,
        })
    }
}

/// An OS child process.
pub struct ChildProcess {
    name: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    grace_period: Duration,
    killed: AtomicBool,
}

impl ChildProcess {
    #[cfg(unix)]
    fn terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(plugin = %self.name, pid, "SIGTERM failed: {}", e);
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> bool {
        false
    }
}

#[async_trait]
impl PluginProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn exited(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return true;
        }
        match self.child.try_lock() {
            Ok(mut child) => !matches!(child.try_wait(), Ok(None)),
            // Someone is killing it right now.
            Err(_) => false,
        }
    }

    async fn kill(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(plugin = %self.name, "Process already exited: {}", status);
            return Ok(());
        }

        if self.terminate() {
            if let Ok(Ok(status)) = tokio::time::timeout(self.grace_period, child.wait()).await {
                tracing::debug!(plugin = %self.name, "Process exited: {}", status);
                return Ok(());
            }
            tracing::warn!(
                plugin = %self.name,
                "Process ignored SIGTERM for {:?}, killing",
                self.grace_period
            );
        }

        child.kill().await?;
        Ok(())
    }
}

/// A plugin served by a task in this process over an in-memory connection.
///
/// Behaves like a child process from the supervisor's point of view, which makes it the
/// natural fixture for exercising relaunch behaviour.
pub struct InProcess {
    server: PluginServer,
    crash: CancellationToken,
}

impl InProcess {
    pub fn new(server: PluginServer) -> Self {
        Self {
            server,
            crash: CancellationToken::new(),
        }
    }

    /// Cancelling `token` makes the plugin drop its connection as if it had crashed.
    pub fn with_crash_token(mut self, token: CancellationToken) -> Self {
        self.crash = token;
        self
    }
}

#[async_trait]
impl ProcessDescriptor for InProcess {
    async fn spawn(self: Box<Self>, name: &str) -> Result<Spawned> {
        let (host_end, plugin_end) = memory::pair();
        let plugin_conn = plugin_end.clone();
        let server = self.server;
        let crash = self.crash;
        let plugin_name = name.to_string();

        let task = tokio::spawn(async move {
            tokio::select! {
                result = plugin::serve(plugin_conn.clone(), server) => {
                    if let Err(e) = result {
                        tracing::warn!(plugin = %plugin_name, "In-process plugin failed: {}", e);
                    }
                }
                _ = crash.cancelled() => {
                    tracing::debug!(plugin = %plugin_name, "In-process plugin crashed");
                }
            }
            let _ = plugin_conn.close().await;
        });

        Ok(Spawned {
            process: Box::new(TaskProcess {
                task,
                conn: plugin_end,
            }),
            conn: host_end,
        })
    }
}

/// The task behind an [`InProcess`] plugin.
pub struct TaskProcess {
    task: JoinHandle<()>,
    conn: Arc<MemoryConnection>,
}

#[async_trait]
impl PluginProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn exited(&self) -> bool {
        self.task.is_finished()
    }

    async fn kill(&self) -> Result<()> {
        let _ = self.conn.close().await;
        self.task.abort();
        Ok(())
    }
}
