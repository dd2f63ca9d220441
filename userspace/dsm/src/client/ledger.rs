// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Pending Lock Ledger
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest
//!
//! A LockRead can arrive before the local mapping of the page exists, in
//! which case no read block can be applied. The ledger remembers the intent
//! so the fault path refuses to materialize the page until the matching
//! ResumeRead has delivered the committed content.
//!
//! INVARIANTS:
//!   - At most one entry per page; re-adding resets it
//!   - Every call is one critical section
//!   - An entry is removed only by the fault path after it was resolved

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::page::{PageData, PageIdentity};

/// A recorded read block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLock {
    /// Page the block applies to.
    pub page: PageIdentity,
    /// Set once the coordinator resumed reads.
    pub resolved: bool,
    /// Content delivered with the resume, if any.
    pub content: Option<PageData>,
}

/// Ledger failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Resolve found nothing to resolve.
    #[error("no pending lock for page {0}")]
    NotPending(PageIdentity),
}

/// Registry of pending locks keyed by page.
#[derive(Default)]
pub struct PendingLockLedger {
    entries: Mutex<HashMap<PageIdentity, PendingLock>>,
}

impl PendingLockLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an unresolved entry or resets an existing one.
    ///
    /// Returns `true` when a new entry was created.
    pub fn add_or_reset(&self, page: PageIdentity) -> bool {
        let fresh = PendingLock { page, resolved: false, content: None };
        self.entries.lock().insert(page, fresh).is_none()
    }

    /// Marks the entry resolved and stores the delivered content.
    pub fn resolve(&self, page: PageIdentity, content: Option<PageData>) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&page).ok_or(LedgerError::NotPending(page))?;
        entry.resolved = true;
        entry.content = content;
        Ok(())
    }

    /// Snapshot of the entry.
    pub fn find(&self, page: PageIdentity) -> Option<PendingLock> {
        self.entries.lock().get(&page).cloned()
    }

    /// Deletes the entry.
    pub fn remove(&self, page: PageIdentity) -> Option<PendingLock> {
        self.entries.lock().remove(&page)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
