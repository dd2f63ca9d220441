// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table collaborator consumed by the client engine.

use thiserror::Error;

use crate::client::monitor::Fault;
use crate::page::{PageData, PageIdentity};

bitflags::bitflags! {
    /// Per-page protocol flags.
    ///
    /// `WRITE` and `READ` mean the access is permitted; a cleared bit is a
    /// block that makes the next access of that kind fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PermissionFlags: u32 {
        /// Page has been primed for write interception.
        const ASSOCIATED = 1 << 0;
        /// Writes are permitted.
        const WRITE = 1 << 1;
        /// Reads are permitted.
        const READ = 1 << 2;
        /// Page belongs to a shared region.
        const SHAREABLE = 1 << 3;
    }
}

/// Page-table failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MappingError {
    /// No page-table entry exists (yet) for the page.
    #[error("no mapping for page {0}")]
    Unavailable(PageIdentity),
}

/// Access to the page-table entries of the target address spaces.
///
/// Every call operates on one entry and is atomic with respect to other
/// calls on the same entry.
pub trait PageTable: Send + Sync {
    /// Flags of the mapping backing `page`.
    fn flags(&self, page: PageIdentity) -> Result<PermissionFlags, MappingError>;

    /// Sets `flags` on the mapping.
    fn set_flags(&self, page: PageIdentity, flags: PermissionFlags) -> Result<(), MappingError>;

    /// Clears `flags` on the mapping.
    fn clear_flags(&self, page: PageIdentity, flags: PermissionFlags) -> Result<(), MappingError>;

    /// Copies the raw page bytes, regardless of the protocol flags.
    fn read_page(&self, page: PageIdentity) -> Result<PageData, MappingError>;

    /// Overwrites the raw page bytes, regardless of the protocol flags.
    fn write_page(&self, page: PageIdentity, data: &PageData) -> Result<(), MappingError>;
}

/// The default fault handling of the host (materializes missing mappings).
pub trait FallbackResolver: Send + Sync {
    /// Resolves `fault` the way the host would without the protocol.
    fn resolve(&self, fault: &Fault);
}
