//! Config file for promwatch
//!
//! All keys are optional; command line flags take precedence.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use promwatch_k8s::{DEFAULT_PORT_SUFFIX, DEFAULT_TIMEOUT};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub client: ClientConfig,
    pub informers: InformerConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Kubeconfig context to use instead of the current one
    pub context: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub timeout_secs: u64,
    /// Appended to the ServiceMonitor name to form the endpoint port
    pub port_suffix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            port_suffix: DEFAULT_PORT_SUFFIX.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InformerConfig {
    /// Watch a single namespace instead of the whole cluster
    pub namespace: Option<String>,
}

impl Config {
    /// Load the config file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        anyhow::ensure!(
            config.client.timeout_secs > 0,
            "client.timeout_secs must be at least 1"
        );
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client.timeout_secs)
    }
}
