use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::{enabled, supervise};
use crate::config::Config;
use crate::error::Result;
use crate::metrics::Metrics;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervise every enabled plugin until `shutdown` resolves, then close them all.
pub async fn run_plugins(config: Config, shutdown: impl Future<Output = ()>) -> Result<()> {
    let metrics = Arc::new(Metrics::new());
    let mut services = Vec::new();

    for (name, plugin) in enabled(&config) {
        let service = supervise(name, plugin, &config, metrics.clone());
        service.start().await?;
        services.push(service);
    }

    if services.is_empty() {
        warn!("No enabled plugins configured");
    } else {
        info!("Supervising {} plugin(s)", services.len());
    }

    shutdown.await;
    info!("Shutting down plugins...");

    let closing = futures::future::join_all(services.iter().map(|service| async move {
        if let Err(e) = service.close().await {
            error!(plugin = %service.name(), "Error closing plugin: {}", e);
        }
    }));
    if timeout(SHUTDOWN_TIMEOUT, closing).await.is_err() {
        warn!("Plugins did not shut down within {:?}", SHUTDOWN_TIMEOUT);
    }

    tracing::debug!("Final metrics:\n{}", metrics.render());
    info!("All plugins stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_without_plugins_returns_on_shutdown() {
        let result = timeout(
            Duration::from_secs(1),
            run_plugins(Config::default(), async {}),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}
