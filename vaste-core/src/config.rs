//! Handles all the server configuration.
//!
//! The `ServerConfig` struct is defined here; loading it from disk is
//! handled by the `vaste` binary crate.

use serde::Deserialize;

/// The server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The license key presented to the account service.
    pub license_key: String,
    /// Base URL of the account service.
    pub account_service_url: String,
    /// The port the server will listen on. Overridden by `PORT`.
    pub port: u16,
    /// The maximum number of players that can be on the server at once.
    pub max_players: u32,
    /// World extent hint sent to clients in `world_init`.
    pub world_size: u32,
    /// Radius of the streamed chunk neighborhood, in chunks.
    pub render_distance_chunks: i32,
    /// Upper bound on waiting for spawn-area generation before the
    /// first batch is sent, in milliseconds.
    pub initial_chunk_generation_wait_ms: u64,
    /// Maximum number of chunks kept in memory before LRU eviction.
    pub max_chunks: usize,
    /// Which generator fills absent chunks.
    pub world_generator: WorldGeneratorType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            license_key: String::new(),
            account_service_url: "http://127.0.0.1:8080".to_string(),
            port: 25565,
            max_players: 20,
            world_size: 1024,
            render_distance_chunks: 4,
            initial_chunk_generation_wait_ms: 1200,
            max_chunks: 65_536,
            world_generator: WorldGeneratorType::Flat,
        }
    }
}

/// The different types of world generators that can be used.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldGeneratorType {
    /// Produces a flat world with a single surface layer.
    Flat,
    /// Creates an empty world, useful for tests.
    Empty,
}

/// Validates the server configuration.
///
/// # Errors
/// Returns a description of the first violated constraint.
pub fn validate(config: &ServerConfig) -> Result<(), &'static str> {
    if config.license_key.is_empty() {
        return Err("license_key must be set");
    }
    if config.max_players == 0 {
        return Err("max_players must be at least 1");
    }
    if !(1..=32).contains(&config.render_distance_chunks) {
        return Err("render_distance_chunks must be in range 1..=32");
    }
    if config.max_chunks == 0 {
        return Err("max_chunks must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_only_on_license() {
        let mut config = ServerConfig::default();
        assert_eq!(validate(&config), Err("license_key must be set"));
        config.license_key = "key".to_string();
        assert_eq!(validate(&config), Ok(()));
    }

    #[test]
    fn render_distance_is_clamped_by_validation() {
        let mut config = ServerConfig {
            license_key: "key".to_string(),
            ..ServerConfig::default()
        };
        config.render_distance_chunks = 0;
        assert!(validate(&config).is_err());
        config.render_distance_chunks = 33;
        assert!(validate(&config).is_err());
    }
}
