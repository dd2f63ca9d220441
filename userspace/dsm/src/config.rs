// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TOML configuration for the coordinator and the client engine
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (defaults, overrides, validation, file loading)
//!
//! Every section defaults, so an empty file yields a working configuration:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:1324"
//! max_connections = 16
//! command_timeout_ms = 10
//! command_retries = 8
//!
//! [client]
//! server = "192.168.1.2:1324"
//! write_request_interval = 64
//! targets = ["fptrtest"]
//!
//! [client.quiescence]
//! max_iterations = 256
//! idle_polls = 1
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Offending path (`<inline>` for strings).
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Coordinator settings.
    pub server: ServerConfig,
    /// Client engine settings.
    pub client: ClientConfig,
}

impl Config {
    /// Reads, parses and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: Config = toml::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: PathBuf::from("<inline>"), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.client.validate()
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address.
    pub listen: String,
    /// Bound on simultaneously served client connections.
    pub max_connections: usize,
    /// Idle sleep of the event loop between readiness sweeps.
    pub poll_interval_ms: u64,
    /// Per-attempt timeout of a server→client command.
    pub command_timeout_ms: u64,
    /// Attempts per server→client command before the enclosing operation fails.
    pub command_retries: u32,
    /// Bound on frames stashed per connection while a command awaits its ack.
    pub backlog_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1324".into(),
            max_connections: 16,
            poll_interval_ms: 10,
            command_timeout_ms: 10,
            command_retries: 8,
            backlog_limit: 16,
        }
    }
}

impl ServerConfig {
    /// Idle sleep as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-attempt command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be at least 1"));
        }
        if self.command_retries == 0 {
            return Err(ConfigError::Invalid("server.command_retries must be at least 1"));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.command_timeout_ms must be non-zero"));
        }
        if self.backlog_limit == 0 {
            return Err(ConfigError::Invalid("server.backlog_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Client engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Coordinator address.
    pub server: String,
    /// Listener receive timeout; bounds how quickly shutdown is noticed.
    pub recv_timeout_ms: u64,
    /// One WriteRequest is sent per this many identical write faults.
    pub write_request_interval: u32,
    /// Process names taking part in the protocol.
    pub targets: Vec<String>,
    /// Write-quiescence detection policy.
    pub quiescence: QuiescencePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "192.168.1.2:1324".into(),
            recv_timeout_ms: 10,
            write_request_interval: 64,
            targets: vec!["fptrtest".into()],
            quiescence: QuiescencePolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Listener receive timeout as a duration.
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.write_request_interval == 0 {
            return Err(ConfigError::Invalid("client.write_request_interval must be at least 1"));
        }
        if self.recv_timeout_ms == 0 {
            return Err(ConfigError::Invalid("client.recv_timeout_ms must be non-zero"));
        }
        self.quiescence.validate()
    }
}

/// Bounded poll loop deciding when a writer has gone quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuiescencePolicy {
    /// Upper bound on polls; quiescence is declared once it is reached.
    pub max_iterations: u32,
    /// Consecutive unchanged polls that declare quiescence.
    pub idle_polls: u32,
    /// Pause between polls in microseconds; 0 only yields the thread.
    pub poll_interval_us: u64,
}

impl Default for QuiescencePolicy {
    fn default() -> Self {
        Self { max_iterations: 256, idle_polls: 1, poll_interval_us: 0 }
    }
}

impl QuiescencePolicy {
    /// Pause between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("client.quiescence.max_iterations must be at least 1"));
        }
        if self.idle_polls == 0 {
            return Err(ConfigError::Invalid("client.quiescence.idle_polls must be at least 1"));
        }
        Ok(())
    }
}
