use std::path::Path;

use anyhow::{Context, Result};

use crate::config::Config;

pub async fn cmd_info(config: &Config, config_path: &Path) -> Result<()> {
    println!("cipherscope {}", env!("CARGO_PKG_VERSION"));
    println!("  build: {} ({})", env!("BUILD_DATE"), env!("GIT_HASH"));
    println!(
        "  config file: {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (not found, defaults)" }
    );

    let chrome = &config.cdp.executable;
    if config.cdp.websocket_url.is_none() {
        if chrome.as_os_str().is_empty() {
            println!("  chrome: not detected (set CIPHERSCOPE_CHROME or pass --chrome)");
        } else {
            println!("  chrome: {}", chrome.display());
        }
    }

    let resolved = serde_yaml::to_string(config).context("Failed to render configuration")?;
    println!("\nresolved configuration:");
    for line in resolved.lines() {
        println!("  {line}");
    }
    Ok(())
}
