use std::sync::Arc;
use tokio::time::timeout;
use tracing::{error, info};

use super::{enabled, supervise};
use crate::config::Config;
use crate::error::{ConfigError, Error, Result};
use crate::metrics::Metrics;

/// Validate the configuration, then launch every enabled plugin once and report its health.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");
    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    let plugins = enabled(&config);
    info!("Checking {} plugin(s)...", plugins.len());

    let metrics = Arc::new(Metrics::new());
    let mut failed = Vec::new();

    for (name, plugin) in plugins {
        info!("\nChecking plugin: {}", name);
        info!("  Command: {} {}", plugin.command, plugin.args.join(" "));
        info!("  Capability: {}", plugin.capability);

        let service = supervise(name, plugin, &config, metrics.clone());
        service.start().await?;

        let ready = match timeout(config.supervisor.start_timeout(), service.wait()).await {
            Ok(Ok(_)) => service.ready().await,
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        };

        match ready {
            Ok(()) => {
                info!("  ✓ Plugin is ready");
                for (component, status) in service.health_report().await {
                    match status {
                        None => info!("    {}: ok", component),
                        Some(err) => info!("    {}: {}", component, err),
                    }
                }
            }
            Err(e) => {
                error!("  ✗ Plugin failed to become ready: {}", e);
                failed.push(name.clone());
            }
        }

        if let Err(e) = service.close().await {
            error!("  ✗ Error closing plugin: {}", e);
        }
    }

    if failed.is_empty() {
        info!("\n✓ All checks passed");
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("plugins failed checks: {}", failed.join(", "))).into())
    }
}
