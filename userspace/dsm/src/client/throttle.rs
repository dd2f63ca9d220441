// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-page WriteRequest rate limit and grant bookkeeping.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::page::PageIdentity;

/// Admits one WriteRequest per `interval` consecutive write faults on a page.
///
/// The counter restarts when the grant arrives or the request is refused, so
/// the first fault after either event requests again. A page accepts at most
/// one grant per WriteRequest sent for it.
pub struct WriteThrottle {
    interval: u32,
    counters: Mutex<HashMap<PageIdentity, u32>>,
    granted: Mutex<HashSet<PageIdentity>>,
}

impl WriteThrottle {
    /// Throttle admitting every `interval`-th fault (at least every fault).
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
            counters: Mutex::new(HashMap::new()),
            granted: Mutex::new(HashSet::new()),
        }
    }

    /// Counts one fault; returns `true` if it may send a request.
    pub fn admit(&self, page: PageIdentity) -> bool {
        let mut counters = self.counters.lock();
        let counter = counters.entry(page).or_insert(0);
        let admitted = *counter == 0;
        *counter = (*counter + 1) % self.interval;
        admitted
    }

    /// Restarts counting for `page`.
    pub fn reset(&self, page: PageIdentity) {
        self.counters.lock().remove(&page);
    }

    /// Records that a WriteRequest for `page` is going out; the next grant
    /// answers it.
    pub fn note_request(&self, page: PageIdentity) {
        self.granted.lock().remove(&page);
    }

    /// Claims the grant for `page`.
    ///
    /// Returns `false` if a grant was already taken since the last request,
    /// i.e. this one is a retransmission.
    pub fn claim_grant(&self, page: PageIdentity) -> bool {
        if !self.granted.lock().insert(page) {
            return false;
        }
        self.reset(page);
        true
    }
}
