//! CLI settings

use obs_transfer::TransferConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings merged from an optional settings file and `OBS_*` environment
/// variables. Command-line flags are applied on top by the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Service endpoint URL
    pub endpoint: Option<String>,
    /// Bearer token
    pub token: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Use virtual-hosted bucket addressing
    pub virtual_host: bool,
    /// Transfer defaults
    pub transfer: TransferConfig,
}

impl CliSettings {
    /// Load settings from `file` (TOML, JSON or YAML by extension) and the
    /// environment. Nested keys use a double underscore, e.g.
    /// `OBS_TRANSFER__TASK_NUM=4`.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("OBS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Client configuration for these settings
    pub fn client_config(&self) -> anyhow::Result<obs_client::Config> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no endpoint configured; pass --endpoint or set OBS_ENDPOINT"))?;

        let mut config = obs_client::Config::new(endpoint);
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if self.virtual_host {
            config = config.with_virtual_host_style();
        }
        Ok(config)
    }
}
