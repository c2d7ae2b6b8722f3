use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::schema::Config;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "PLUGIN_HOST_";

/// Load from `plugin-host.{toml,json,yaml,yml}` in the working directory, then
/// `~/.plugin-host/config.toml`, then `PLUGIN_HOST_*` variables.
pub fn load_from_env_or_file() -> Result<Config> {
    let mut figment = Figment::new()
        .merge(Toml::file("plugin-host.toml"))
        .merge(Json::file("plugin-host.json"))
        .merge(Yaml::file("plugin-host.yaml"))
        .merge(Yaml::file("plugin-host.yml"));

    if let Some(home) = dirs::home_dir() {
        figment = figment.merge(Toml::file(home.join(".plugin-host").join("config.toml")));
    }

    finish(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Parse(format!("{} does not exist", path.display())).into());
    }

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(format!(
                "unsupported config format: {}",
                path.display()
            ))
            .into())
        }
    };

    finish(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
}

fn finish(figment: Figment) -> Result<Config> {
    let config: Config = figment
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    for (name, plugin) in &config.plugins {
        if plugin.command.trim().is_empty() {
            return Err(
                ConfigError::Validation(format!("Plugin '{}' has empty command", name)).into(),
            );
        }
        if plugin.capability.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Plugin '{}' has empty capability",
                name
            ))
            .into());
        }
    }

    let supervisor = &config.supervisor;
    if supervisor.tick_interval_ms == 0 {
        return Err(ConfigError::Validation("tickIntervalMs must be greater than 0".into()).into());
    }
    if supervisor.start_timeout_ms < supervisor.tick_interval_ms {
        return Err(ConfigError::Validation(format!(
            "startTimeoutMs ({}) must not be shorter than tickIntervalMs ({})",
            supervisor.start_timeout_ms, supervisor.tick_interval_ms
        ))
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for plugin in config.plugins.values_mut() {
        plugin.command = substitute_env_vars(&plugin.command)?;
        for arg in &mut plugin.args {
            *arg = substitute_env_vars(arg)?;
        }
        for value in plugin.env.values_mut() {
            *value = substitute_env_vars(value)?;
        }
    }
    Ok(config)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid pattern"))
}

/// Expand `${VAR}` and `${VAR:-default}`. A missing variable without default is an error.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in env_pattern().captures_iter(input) {
        let expr = &cap[1];
        let value = match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{}' not found", expr))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_substitute_env_vars() {
        std::env::set_var("PLUGIN_HOST_TEST_BIN", "/opt/plugins");
        assert_eq!(
            substitute_env_vars("${PLUGIN_HOST_TEST_BIN}/median").unwrap(),
            "/opt/plugins/median"
        );
        assert_eq!(
            substitute_env_vars("${PLUGIN_HOST_TEST_UNSET_VAR:-fallback}").unwrap(),
            "fallback"
        );
        assert!(substitute_env_vars("${PLUGIN_HOST_TEST_UNSET_VAR}").is_err());
        assert_eq!(substitute_env_vars("plain").unwrap(), "plain");
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[supervisor]
tickIntervalMs = 1000
startTimeoutMs = 5000

[plugins.median]
command = "/usr/local/bin/median"
args = ["--verbose"]
capability = "reporting-plugin"

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).unwrap();
        let plugin = &config.plugins["median"];
        assert_eq!(plugin.command, "/usr/local/bin/median");
        assert_eq!(plugin.args, vec!["--verbose"]);
        assert_eq!(plugin.capability, "reporting-plugin");
        assert!(plugin.enabled);
        assert_eq!(config.supervisor.tick_interval_ms, 1000);
        assert_eq!(config.supervisor.health_check_timeout_ms, 2000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_timing() {
        let mut config = Config::default();
        config.supervisor.tick_interval_ms = 0;
        assert!(validate(&config).is_err());

        config.supervisor.tick_interval_ms = 10_000;
        config.supervisor.start_timeout_ms = 1_000;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_command() {
        let mut config = Config::default();
        config
            .plugins
            .insert("broken".into(), crate::config::PluginConfig::new("  "));
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).is_err());
    }
}
