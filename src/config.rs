//! Configuration loading and persistence.
//!
//! `config.json` lives in the platform config directory (or
//! `URNET_CONFIG_DIR`). Every field can be overridden from the environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_ADDR_DIGITS, DEFAULT_CALL_TIMEOUT, DEFAULT_SERVER_ADDR,
    DEFAULT_SOCKET_NAME, MAX_ADDR_DIGITS,
};
use crate::endpoint::EndpointConfig;

/// Configuration for the `urnet` binary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Unix socket the hub listens on.
    pub socket_path: PathBuf,
    /// Address the hub claims.
    pub server_addr: String,
    /// Networked call timeout in milliseconds.
    pub call_timeout_ms: u64,
    /// Ordinal width for generated addresses.
    pub addr_digits: usize,
    /// Auth token sent on connect - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: Self::base_dir().join(DEFAULT_SOCKET_NAME),
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            call_timeout_ms: u64::try_from(DEFAULT_CALL_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
            addr_digits: DEFAULT_ADDR_DIGITS,
            token: None,
        }
    }
}

impl Config {
    /// `URNET_CONFIG_DIR`, else `<platform config dir>/urnet`.
    fn base_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("URNET_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        dirs::config_dir()
            .map(|d| d.join("urnet"))
            .unwrap_or_else(|| PathBuf::from(".urnet"))
    }

    /// Returns the configuration directory path, creating it if necessary.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = Self::base_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file quietly falls back to defaults; an unreadable or
    /// invalid one falls back with a warning.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_or_default(&dir);
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_or_default(dir: &Path) -> Self {
        if !dir.join(CONFIG_FILE_NAME).exists() {
            log::debug!("[Config] no {CONFIG_FILE_NAME} in {}, using defaults", dir.display());
            return Self::default();
        }
        match Self::load_from(dir) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("[Config] ignoring config file, using defaults: {e:#}");
                Self::default()
            }
        }
    }

    /// Read `config.json` from `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            anyhow::bail!("Config file not found: {}", config_path.display());
        }
        let content = fs::read_to_string(&config_path)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `URNET_*` overrides from `lookup`. Unparseable numbers are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("URNET_SOCKET_PATH") {
            self.socket_path = PathBuf::from(path);
        }

        if let Some(addr) = lookup("URNET_SERVER_ADDR") {
            self.server_addr = addr;
        }

        if let Some(timeout) = lookup("URNET_CALL_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.call_timeout_ms = ms,
                Err(e) => log::warn!("[Config] ignoring URNET_CALL_TIMEOUT_MS={timeout}: {e}"),
            }
        }

        if let Some(digits) = lookup("URNET_ADDR_DIGITS") {
            match digits.parse::<usize>() {
                Ok(d) if (1..=MAX_ADDR_DIGITS).contains(&d) => self.addr_digits = d,
                _ => log::warn!("[Config] ignoring URNET_ADDR_DIGITS={digits}"),
            }
        }

        if let Some(token) = lookup("URNET_TOKEN") {
            self.token = Some(token);
        }
    }

    /// Persists the current configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Write `config.json` into `dir`, owner read/write only.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Call timeout as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Endpoint settings derived from this config.
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            call_timeout: self.call_timeout(),
        }
    }
}
