//! Server configuration loading.
//!
//! The `ServerConfig` struct is defined in `vaste-core`; this module
//! handles the file I/O, the default config file, and the environment
//! overrides.

use std::fs;
use std::path::Path;

use anyhow::Context;
pub use vaste_core::config::{ServerConfig, validate};

const DEFAULT_CONFIG: &str = include_str!("../package-content/vaste_config.json5");

/// Loads the server configuration, creating the default file when none
/// exists, and applies the `PORT` environment override.
pub fn load_or_create(path: &Path) -> anyhow::Result<ServerConfig> {
    let mut config = if path.exists() {
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        serde_json5::from_str(config_str.as_str()).context("failed to parse config")?
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }
        fs::write(path, DEFAULT_CONFIG).context("failed to write default config")?;
        log::info!("wrote default config to {}", path.display());
        serde_json5::from_str::<ServerConfig>(DEFAULT_CONFIG)
            .context("failed to parse default config")?
    };

    if let Ok(port) = std::env::var("PORT") {
        config.port = port
            .parse()
            .with_context(|| format!("PORT={port} is not a valid port"))?;
    }

    validate(&config).map_err(|reason| anyhow::anyhow!("invalid config: {reason}"))?;
    Ok(config)
}
