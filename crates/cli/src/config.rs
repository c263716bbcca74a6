//! Configuration management for the CLI

use anyhow::{Context, Result};
use migration_lib::location::DEFAULT_LOCATION_PORT;
use migration_lib::token::DEFAULT_TOKEN_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration, read from `~/.config/migctl/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    pub token_port: Option<u16>,
    pub location_port: Option<u16>,
}

impl Config {
    /// Load the user's config file; a missing file is an empty config
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Flag or env value first, then the file, then the built-in default
    pub fn token_port(&self, flag: Option<u16>) -> u16 {
        flag.or(self.token_port).unwrap_or(DEFAULT_TOKEN_PORT)
    }

    pub fn location_port(&self, flag: Option<u16>) -> u16 {
        flag.or(self.location_port).unwrap_or(DEFAULT_LOCATION_PORT)
    }

    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("migctl").join("config.json"))
    }
}
