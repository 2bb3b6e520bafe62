//! Tail configuration.
//!
//! Configuration is layered, later sources winning:
//! - TOML configuration file (`nimbus.toml`)
//! - Environment variables (`NIMBUS_BASE_URL`, `NIMBUS_API_KEY`)
//! - Command line arguments

use anyhow::{bail, Context, Result};
use nimbus_realtime::RealtimeOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Files searched, in order, when no `--config` is given.
const CONFIG_PATHS: [&str; 3] = [
    "nimbus.toml",
    "~/.config/nimbus/nimbus.toml",
    "/etc/nimbus/nimbus.toml",
];

pub const ENV_BASE_URL: &str = "NIMBUS_BASE_URL";
pub const ENV_API_KEY: &str = "NIMBUS_API_KEY";

/// Tail configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL of the project.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Project API key.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Realtime connection options.
    #[serde(default)]
    pub realtime: RealtimeOptions,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load from an explicit file, else the first file on the search path,
    /// else defaults. Environment overrides are applied last.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// explicit file cannot be read.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => Self::search()?,
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn search() -> Result<Self> {
        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override credentials from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = Some(base_url);
        }
        if let Some(api_key) = lookup(ENV_API_KEY).filter(|v| !v.is_empty()) {
            self.api_key = Some(api_key);
        }
    }

    /// Base URL and API key, both required to connect.
    ///
    /// # Errors
    ///
    /// Names whichever one is missing.
    pub fn credentials(&self) -> Result<(&str, &str)> {
        let Some(base_url) = self.base_url.as_deref() else {
            bail!("no base URL: set base_url in nimbus.toml, {ENV_BASE_URL} or --base-url");
        };
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("no API key: set api_key in nimbus.toml, {ENV_API_KEY} or --api-key");
        };
        Ok((base_url, api_key))
    }
}
