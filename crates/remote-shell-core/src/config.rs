//! Session configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TerminalGeometry;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings applied to every session a broker opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Value for the remote `TERM`.
    pub terminal_kind: String,
    /// Locale requested for the remote shell.
    pub locale: Option<String>,
    /// Client identification banner.
    pub banner: Option<String>,
    /// Geometry used when the caller does not supply one.
    pub initial_geometry: TerminalGeometry,
    /// Events retained for late subscribers, per hub.
    pub event_history: usize,
    /// Live broadcast channel capacity, per hub.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            terminal_kind: "xterm".to_string(),
            locale: None,
            banner: Some(format!(
                "SSH-2.0-remote-shell_{}",
                env!("CARGO_PKG_VERSION")
            )),
            initial_geometry: TerminalGeometry::default(),
            event_history: 256,
            event_capacity: 1024,
        }
    }
}

impl SessionConfig {
    /// Parse from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns error if the document is not valid TOML or has mistyped keys.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}
