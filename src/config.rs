//! Application configuration loaded from YAML.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cdp_adapter::CdpConfig;
use cipherscope_correlator::CaptureConfig;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub cdp: CdpConfig,
    /// Written with every record when the watch session ends.
    pub export_path: Option<PathBuf>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().context("Failed to get config directory")?;
    path.push("cipherscope");
    path.push("config.yaml");
    Ok(path)
}

pub async fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        warn!(
            "Config file not found, using defaults: {}",
            config_path.display()
        );
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
    let config: Config = serde_yaml::from_str(&content).context("Failed to parse config file")?;

    info!("Loaded configuration from: {}", config_path.display());
    Ok(config)
}
