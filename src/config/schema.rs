use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Name of the capability the plugin dispenses.
    #[serde(default = "default_capability")]
    pub capability: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log file; stderr only when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_capability() -> String {
    "service".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    5000
}

fn default_start_timeout() -> u64 {
    30000
}

fn default_health_check_timeout() -> u64 {
    2000
}

fn default_dial_timeout() -> u64 {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            start_timeout_ms: default_start_timeout(),
            health_check_timeout_ms: default_health_check_timeout(),
            dial_timeout_ms: default_dial_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

impl PluginConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            capability: default_capability(),
            enabled: default_enabled(),
        }
    }
}

impl SupervisorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
