// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error type.
//!
//! Transport loss is fatal to a connection; timeouts and protocol
//! violations are retried by the coordinator's command exchange before they
//! surface; mapping and allocation failures fail a single operation.

use thiserror::Error;

use crate::client::{LedgerError, MappingError};
use crate::config::ConfigError;
use crate::page::AllocationFailure;
use crate::server::{CommandError, DirectoryError};
use crate::transport::TransportError;
use crate::wire::WireError;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Every failure the crate reports.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Malformed frame.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Server→client command failed after its retry budget.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// Ownership directory refused the operation.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// Page-table entry not constructible.
    #[error(transparent)]
    Mapping(#[from] MappingError),
    /// Pending lock bookkeeping.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Page buffer allocation failed.
    #[error(transparent)]
    Allocation(#[from] AllocationFailure),
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Socket setup or thread spawn failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
