// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! Shared-page coherence coordinator daemon.
//!
//! Loads the `[server]` table of the DSM configuration, binds the listener and
//! runs the coordinator event loop until asked to stop.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use log::info;
use nexus_dsm::server::Server;
use nexus_dsm::{Config, ConfigError, ServerConfig};
use thiserror::Error;

/// Result alias for the daemon.
pub type Result<T> = core::result::Result<T, ServiceError>;

/// Daemon failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration could not be loaded.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    /// The listener could not be bound.
    #[error("bind {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
}

/// Notifies the init process once the listener is bound.
pub struct ReadyNotifier(Box<dyn FnOnce(SocketAddr) + Send>);

impl ReadyNotifier {
    /// Creates a notifier from `func`; it receives the bound address.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(SocketAddr) + Send + 'static,
    {
        Self(Box::new(func))
    }

    /// Emits the ready marker.
    pub fn notify(self, addr: SocketAddr) {
        (self.0)(addr);
    }
}

/// Reads the server settings, applying a command-line listen override.
///
/// Without a file the built-in defaults apply.
pub fn load_config(path: Option<&Path>, listen: Option<&str>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(path) => Config::load(path)?.server,
        None => ServerConfig::default(),
    };
    if let Some(listen) = listen {
        config.listen = listen.to_owned();
    }
    Ok(config)
}

/// Binds the coordinator and serves until `stop` is raised.
pub fn service_main_loop(config: ServerConfig, notifier: ReadyNotifier, stop: &AtomicBool) -> Result<()> {
    let addr = config.listen.clone();
    let mut server = Server::bind(config).map_err(|source| ServiceError::Bind { addr: addr.clone(), source })?;
    let bound = server
        .local_addr()
        .ok_or_else(|| ServiceError::Bind { addr, source: std::io::ErrorKind::AddrNotAvailable.into() })?;
    info!("dsmd: listening on {bound}");
    notifier.notify(bound);
    server.serve_until(stop);
    Ok(())
}
