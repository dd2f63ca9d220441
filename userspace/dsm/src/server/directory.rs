// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page Ownership Directory
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (lock/writer/holder invariant)
//!
//! INVARIANTS:
//!   - At most one record per page
//!   - `locked` ⇔ `writer.is_some()`, and the writer is a holder
//!   - Holders are unique and keep join order
//!   - Every method is one critical section over the whole table

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

use crate::page::{AddressSpaceId, PageData, PageIdentity};

/// Coordinator-local id of one client connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// One client process reachable over one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    /// Connection the client talks over.
    pub conn: ConnId,
    /// Coherence domain.
    pub space: AddressSpaceId,
    /// Process id on the client host.
    pub pid: u32,
}

/// State of one shared page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipRecord {
    /// A write handshake or write is in flight.
    pub locked: bool,
    /// Client the page is granted to while locked.
    pub writer: Option<ClientHandle>,
    /// Last committed content.
    pub cached: Option<PageData>,
    /// Clients holding cached read access, in join order.
    pub holders: Vec<ClientHandle>,
}

impl OwnershipRecord {
    fn others(&self, client: &ClientHandle) -> Vec<ClientHandle> {
        self.holders.iter().filter(|h| *h != client).copied().collect()
    }
}

/// Directory refusals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The page was never joined.
    #[error("page {0} has no ownership record")]
    NoRecord(PageIdentity),
    /// A write is in flight.
    #[error("page {0} is locked")]
    Locked(PageIdentity),
    /// Commit without a write in flight.
    #[error("page {0} is not locked")]
    NotLocked(PageIdentity),
    /// Requester never joined the page.
    #[error("requester is not a holder of page {0}")]
    NotHolder(PageIdentity),
    /// Commit from someone other than the granted writer.
    #[error("committer is not the writer of page {0}")]
    NotWriter(PageIdentity),
}

/// Page → ownership record table.
#[derive(Default)]
pub struct OwnershipDirectory {
    records: Mutex<HashMap<PageIdentity, OwnershipRecord>>,
}

impl OwnershipDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client` to the holders, creating the record on first use.
    ///
    /// Returns the cached content (absent before the first commit). Joining a
    /// locked page is refused.
    pub fn join(&self, page: PageIdentity, client: ClientHandle) -> Result<Option<PageData>, DirectoryError> {
        let mut records = self.records.lock();
        let record = records.entry(page).or_default();
        if record.locked {
            return Err(DirectoryError::Locked(page));
        }
        if !record.holders.contains(&client) {
            record.holders.push(client);
        }
        Ok(record.cached.clone())
    }

    /// Locks the page for `requester` and returns the holders to read-block.
    pub fn begin_write(
        &self,
        page: PageIdentity,
        requester: ClientHandle,
    ) -> Result<Vec<ClientHandle>, DirectoryError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&page).ok_or(DirectoryError::NoRecord(page))?;
        if record.locked {
            return Err(DirectoryError::Locked(page));
        }
        if !record.holders.contains(&requester) {
            return Err(DirectoryError::NotHolder(page));
        }
        record.locked = true;
        record.writer = Some(requester);
        Ok(record.others(&requester))
    }

    /// Releases a lock whose handshake failed. Holders already read-blocked
    /// stay blocked until the next successful commit.
    pub fn abort_write(&self, page: PageIdentity) {
        if let Some(record) = self.records.lock().get_mut(&page) {
            record.locked = false;
            record.writer = None;
        }
    }

    /// Stores the writer's content, unlocks, and returns the holders to resume.
    pub fn commit(
        &self,
        page: PageIdentity,
        committer: ClientHandle,
        content: PageData,
    ) -> Result<Vec<ClientHandle>, DirectoryError> {
        let mut records = self.records.lock();
        let record = records.get_mut(&page).ok_or(DirectoryError::NoRecord(page))?;
        if !record.locked {
            return Err(DirectoryError::NotLocked(page));
        }
        if record.writer != Some(committer) {
            return Err(DirectoryError::NotWriter(page));
        }
        record.cached = Some(content);
        record.locked = false;
        record.writer = None;
        Ok(record.others(&committer))
    }

    /// Forgets every holder on `conn`; returns pages whose writer was on it.
    ///
    /// Records and their cached content survive so later joins still see
    /// the last committed page.
    pub fn drop_connection(&self, conn: ConnId) -> Vec<PageIdentity> {
        let mut released = Vec::new();
        for (page, record) in self.records.lock().iter_mut() {
            record.holders.retain(|h| h.conn != conn);
            if record.writer.is_some_and(|w| w.conn == conn) {
                record.locked = false;
                record.writer = None;
                released.push(*page);
            }
        }
        released
    }

    /// Snapshot of one record.
    pub fn record(&self, page: PageIdentity) -> Option<OwnershipRecord> {
        self.records.lock().get(&page).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` when no page was ever joined.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SPACE: AddressSpaceId = AddressSpaceId(77);

    fn page() -> PageIdentity {
        PageIdentity::new(SPACE, 4)
    }

    fn client(n: u64) -> ClientHandle {
        ClientHandle { conn: ConnId(n), space: SPACE, pid: 1000 + n as u32 }
    }

    #[test]
    fn write_needs_a_record_and_a_holder() {
        let dir = OwnershipDirectory::new();
        assert_eq!(dir.begin_write(page(), client(1)), Err(DirectoryError::NoRecord(page())));
        dir.join(page(), client(1)).unwrap();
        assert_eq!(dir.begin_write(page(), client(2)), Err(DirectoryError::NotHolder(page())));
        assert_eq!(dir.begin_write(page(), client(1)), Ok(vec![]));
        assert_eq!(dir.begin_write(page(), client(1)), Err(DirectoryError::Locked(page())));
    }

    #[test]
    fn join_returns_cache_and_refuses_locked_pages() {
        let dir = OwnershipDirectory::new();
        assert_eq!(dir.join(page(), client(1)), Ok(None));
        assert_eq!(dir.join(page(), client(1)), Ok(None));
        dir.join(page(), client(2)).unwrap();
        assert_eq!(dir.record(page()).unwrap().holders, vec![client(1), client(2)]);

        assert_eq!(dir.begin_write(page(), client(2)), Ok(vec![client(1)]));
        assert_eq!(dir.join(page(), client(3)), Err(DirectoryError::Locked(page())));
        assert_eq!(dir.commit(page(), client(2), PageData::filled(6)), Ok(vec![client(1)]));
        assert_eq!(dir.join(page(), client(3)), Ok(Some(PageData::filled(6))));
    }

    #[test]
    fn commit_requires_the_granted_writer() {
        let dir = OwnershipDirectory::new();
        dir.join(page(), client(1)).unwrap();
        dir.join(page(), client(2)).unwrap();
        assert_eq!(
            dir.commit(page(), client(1), PageData::zeroed()),
            Err(DirectoryError::NotLocked(page()))
        );
        dir.begin_write(page(), client(1)).unwrap();
        assert_eq!(
            dir.commit(page(), client(2), PageData::zeroed()),
            Err(DirectoryError::NotWriter(page()))
        );
        let record = dir.record(page()).unwrap();
        assert!(record.locked);
        assert_eq!(record.cached, None);
    }

    #[test]
    fn aborted_and_dropped_writers_release_the_lock() {
        let dir = OwnershipDirectory::new();
        dir.join(page(), client(1)).unwrap();
        dir.join(page(), client(2)).unwrap();
        dir.begin_write(page(), client(1)).unwrap();
        dir.abort_write(page());
        assert!(!dir.record(page()).unwrap().locked);

        dir.begin_write(page(), client(2)).unwrap();
        assert_eq!(dir.drop_connection(ConnId(2)), vec![page()]);
        let record = dir.record(page()).unwrap();
        assert!(!record.locked);
        assert_eq!(record.holders, vec![client(1)]);
        assert_eq!(dir.drop_connection(ConnId(1)), vec![]);
        assert_eq!(dir.len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u64),
        Write(u64),
        Commit(u64),
        Abort,
        Drop(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..4).prop_map(Op::Join),
            (0u64..4).prop_map(Op::Write),
            (0u64..4).prop_map(Op::Commit),
            Just(Op::Abort),
            (0u64..4).prop_map(Op::Drop),
        ]
    }

    proptest! {
        #[test]
        fn locked_record_has_exactly_one_holding_writer(ops in prop::collection::vec(op(), 0..64)) {
            let dir = OwnershipDirectory::new();
            for op in ops {
                match op {
                    Op::Join(n) => { let _ = dir.join(page(), client(n)); }
                    Op::Write(n) => { let _ = dir.begin_write(page(), client(n)); }
                    Op::Commit(n) => { let _ = dir.commit(page(), client(n), PageData::zeroed()); }
                    Op::Abort => dir.abort_write(page()),
                    Op::Drop(n) => { dir.drop_connection(ConnId(n)); }
                }
                if let Some(record) = dir.record(page()) {
                    prop_assert_eq!(record.locked, record.writer.is_some());
                    if let Some(writer) = record.writer {
                        prop_assert!(record.holders.contains(&writer));
                    }
                    let unique: std::collections::HashSet<_> = record.holders.iter().collect();
                    prop_assert_eq!(unique.len(), record.holders.len());
                }
            }
        }
    }
}
