//! Configuration loading and management.
//!
//! A single TOML document describes the whole cluster: presets, eagerly
//! started servers, ingress binds, matchmaking formats, spawn parameters,
//! and the optional key-value sidecar. Loading and validation failures are
//! fatal; nothing else in the process is.

mod defaults;
mod types;
mod validation;

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub use types::{
    ClusterConfig, DatabaseConfig, DesktopIngressBlock, DuelFormatBlock, ForceRespawn,
    IngressConfig, MatchmakingConfig, PresetBlock, ServerBlock, SpawnConfig, WebIngressBlock,
};
pub use validation::ValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub cluster: ClusterConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        validation::validate(&config.cluster)?;
        Ok(config)
    }
}
