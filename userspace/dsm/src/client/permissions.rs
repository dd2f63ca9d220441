// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page Permission Store: named protocol operations over the page table.
//!
//! Flags are client-local and live only as long as the mapping. They may lag
//! the coordinator's lock state; the next fault on the page reconciles them.

use std::sync::Arc;

use crate::client::pagetable::{MappingError, PageTable, PermissionFlags};
use crate::page::{PageData, PageIdentity};

/// Per-page flags of one host.
#[derive(Clone)]
pub struct PermissionStore {
    table: Arc<dyn PageTable>,
}

impl PermissionStore {
    /// Store backed by `table`.
    pub fn new(table: Arc<dyn PageTable>) -> Self {
        Self { table }
    }

    /// Current flags.
    pub fn flags(&self, page: PageIdentity) -> Result<PermissionFlags, MappingError> {
        self.table.flags(page)
    }

    /// Returns `true` if a mapping exists.
    pub fn is_mapped(&self, page: PageIdentity) -> bool {
        self.table.flags(page).is_ok()
    }

    /// Shareability, or `None` while the mapping does not exist.
    pub fn is_shareable(&self, page: PageIdentity) -> Option<bool> {
        self.query(page, PermissionFlags::SHAREABLE)
    }

    /// Returns `true` once the page has been primed for write interception.
    pub fn is_associated(&self, page: PageIdentity) -> bool {
        self.query(page, PermissionFlags::ASSOCIATED).unwrap_or(false)
    }

    /// Write permission, or `None` while unmapped.
    pub fn writes_allowed(&self, page: PageIdentity) -> Option<bool> {
        self.query(page, PermissionFlags::WRITE)
    }

    /// Read permission, or `None` while unmapped.
    pub fn reads_allowed(&self, page: PageIdentity) -> Option<bool> {
        self.query(page, PermissionFlags::READ)
    }

    /// Marks the page as taking part in the protocol.
    pub fn associate(&self, page: PageIdentity) -> Result<(), MappingError> {
        self.table.set_flags(page, PermissionFlags::ASSOCIATED)
    }

    /// Makes the next write fault.
    pub fn block_writes(&self, page: PageIdentity) -> Result<(), MappingError> {
        self.table.clear_flags(page, PermissionFlags::WRITE)
    }

    /// Lets writes through.
    pub fn allow_writes(&self, page: PageIdentity) -> Result<(), MappingError> {
        self.table.set_flags(page, PermissionFlags::WRITE)
    }

    /// Makes the next read fault.
    pub fn block_reads(&self, page: PageIdentity) -> Result<(), MappingError> {
        self.table.clear_flags(page, PermissionFlags::READ)
    }

    /// Lets reads through.
    pub fn allow_reads(&self, page: PageIdentity) -> Result<(), MappingError> {
        self.table.set_flags(page, PermissionFlags::READ)
    }

    /// Copies the page content.
    pub fn capture(&self, page: PageIdentity) -> Result<PageData, MappingError> {
        self.table.read_page(page)
    }

    /// Overwrites the page content.
    pub fn install(&self, page: PageIdentity, data: &PageData) -> Result<(), MappingError> {
        self.table.write_page(page, data)
    }

    fn query(&self, page: PageIdentity, flag: PermissionFlags) -> Option<bool> {
        self.table.flags(page).ok().map(|flags| flags.contains(flag))
    }
}
