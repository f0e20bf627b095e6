//! Configuration of the `dmsg env` demo.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Local test environment parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Relay servers to start on loopback
    pub servers: usize,
    /// Relay sessions each client keeps
    pub min_sessions: usize,
    /// Port the responding client listens on
    pub port: u16,
    /// Payload echoed across the relay
    pub message: String,
    /// Log level when neither `-v` nor `RUST_LOG` is given
    pub log_level: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            servers: 1,
            min_sessions: 1,
            port: 7,
            message: "hello".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl EnvConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.servers == 0 {
            anyhow::bail!("At least one server is required");
        }
        if self.min_sessions == 0 || self.min_sessions > self.servers {
            anyhow::bail!(
                "min_sessions must be between 1 and servers ({})",
                self.servers
            );
        }
        if self.port == 0 {
            anyhow::bail!("Port 0 cannot be listened on");
        }
        if self.message.is_empty() {
            anyhow::bail!("Message must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.log_level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }
}
