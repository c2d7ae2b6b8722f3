use std::sync::Arc;

use crate::config::{Config, PluginConfig};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::services::ServiceClient;
use crate::supervisor::{CommandSpec, PluginService, ProcessDescriptor, SupervisorOptions};

pub mod check;
pub mod run;

pub use check::run_config_check;
pub use run::run_plugins;

/// Supervise one configured plugin behind the generic lifecycle facade.
pub fn supervise(
    name: &str,
    plugin: &PluginConfig,
    config: &Config,
    metrics: Arc<Metrics>,
) -> PluginService<ServiceClient> {
    let spec = CommandSpec::from_config(plugin);
    let options = SupervisorOptions {
        config: config.supervisor.clone(),
        metrics,
    };

    PluginService::with_options(
        name,
        plugin.capability.clone(),
        options,
        move || -> Result<Box<dyn ProcessDescriptor>> { Ok(Box::new(spec.clone())) },
        |instance| async move {
            Ok(Arc::new(ServiceClient::new(
                instance.name.clone(),
                Arc::new(instance.client_conn()),
            )))
        },
    )
}

fn enabled(config: &Config) -> Vec<(&String, &PluginConfig)> {
    let mut plugins: Vec<_> = config.plugins.iter().filter(|(_, p)| p.enabled).collect();
    plugins.sort_by(|a, b| a.0.cmp(b.0));
    plugins
}
