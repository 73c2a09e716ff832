//! Layered application configuration: built-in defaults, overridden by an
//! optional config file, overridden by `WORKFLOW_*` environment variables —
//! the same precedence the teacher's server binary reads by hand from
//! `std::env`, expressed here through the `config` crate's layered `Config`
//! builder instead, with `.env` loaded first via `dotenv`.

use serde::Deserialize;

use crate::{CoreError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_global_max")]
    pub global_max: usize,
    #[serde(default = "default_per_workflow_max")]
    pub per_workflow_max: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_max: default_global_max(),
            per_workflow_max: default_per_workflow_max(),
        }
    }
}

fn default_global_max() -> usize {
    10
}

fn default_per_workflow_max() -> usize {
    3
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_history_ttl_secs")]
    pub run_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            providers: ProvidersConfig::default(),
            log_level: default_log_level(),
            run_ttl_secs: default_history_ttl_secs(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_history_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl AppConfig {
    /// Loads `.env` (if present, silently ignored otherwise), then layers
    /// defaults < an optional `config.toml` in the working directory <
    /// `WORKFLOW_*` environment variables (double-underscore separated for
    /// nesting, e.g. `WORKFLOW_SERVER__PORT=9090`).
    pub fn load() -> Result<Self> {
        let _ = dotenv::dotenv();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("WORKFLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .map_err(|err| CoreError::Other(anyhow::anyhow!(err)))?;

        // An empty environment/file still deserializes successfully into
        // every field's `#[serde(default)]`.
        config
            .try_deserialize()
            .map_err(|err| CoreError::Other(anyhow::anyhow!(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.concurrency.global_max, 10);
        assert_eq!(config.concurrency.per_workflow_max, 3);
    }
}
