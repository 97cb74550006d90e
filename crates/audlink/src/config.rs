// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 audlink contributors

//! Persisted endpoint selection.
//!
//! Clients remember which relay they last used so startup can skip the
//! network scan. The file is plain JSON; a missing or stale entry just
//! means scanning again.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// A saved relay endpoint plus the client-side deadlines to use with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Relay host name or address.
    pub address: String,

    /// Relay TCP port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-call response deadline in seconds (default: 30)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Discovery probe deadline in seconds (default: 5)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_port() -> u16 {
    3000
}

fn default_call_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: default_port(),
            call_timeout_secs: default_call_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl EndpointConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// `host:port` form suitable for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::InvalidValue("address cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "call_timeout_secs cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
