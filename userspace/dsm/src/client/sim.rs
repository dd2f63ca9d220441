// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic in-memory page table for tests and host simulation
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! Models one host's view of the shared address spaces: declared regions,
//! lazily materialized mappings with protocol flags, and a CPU-like
//! `load`/`store` pair that reports a [`Fault`] instead of touching a page
//! whose flags block the access. The type is also the fallback resolver: a
//! missing-page fault on a declared region materializes a zeroed mapping.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::client::monitor::{AccessKind, Fault, FaultKind};
use crate::client::pagetable::{FallbackResolver, MappingError, PageTable, PermissionFlags};
use crate::page::{AddressSpaceId, PageData, PageIdentity, PAGE_SIZE};

struct SimMapping {
    flags: PermissionFlags,
    data: PageData,
}

#[derive(Default)]
struct SimState {
    /// Declared regions and whether they are shareable.
    regions: HashMap<PageIdentity, bool>,
    mappings: HashMap<PageIdentity, SimMapping>,
    fallback_log: Vec<Fault>,
}

/// In-memory page table.
#[derive(Default)]
pub struct SimPageTable {
    state: Mutex<SimState>,
}

impl SimPageTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a page as part of the address space without mapping it.
    pub fn declare(&self, page: PageIdentity, shareable: bool) {
        self.state.lock().regions.insert(page, shareable);
    }

    /// Declares a page and materializes a zeroed, fully accessible mapping.
    pub fn map(&self, page: PageIdentity, shareable: bool) {
        let mut state = self.state.lock();
        state.regions.insert(page, shareable);
        state.mappings.insert(page, fresh_mapping(shareable));
    }

    /// Drops the mapping, keeping the region declared.
    pub fn unmap(&self, page: PageIdentity) {
        self.state.lock().mappings.remove(&page);
    }

    /// Returns `true` if a mapping exists.
    pub fn is_mapped(&self, page: PageIdentity) -> bool {
        self.state.lock().mappings.contains_key(&page)
    }

    /// Raw contents of the mapping.
    pub fn contents(&self, page: PageIdentity) -> Option<PageData> {
        self.state.lock().mappings.get(&page).map(|m| m.data.clone())
    }

    /// Faults forwarded to the fallback resolver so far.
    pub fn fallback_log(&self) -> Vec<Fault> {
        self.state.lock().fallback_log.clone()
    }

    /// Simulated one-byte load by process `pid`.
    pub fn load(&self, space: AddressSpaceId, pid: u32, vaddr: u64) -> Result<u8, Fault> {
        let page = PageIdentity::containing(space, vaddr);
        let state = self.state.lock();
        let fault = |kind| Fault { space, pid, vaddr, access: AccessKind::Read, kind };
        match state.mappings.get(&page) {
            None => Err(fault(FaultKind::MissingPage)),
            Some(m) if !m.flags.contains(PermissionFlags::READ) => Err(fault(FaultKind::Violation)),
            Some(m) => Ok(m.data.as_bytes()[offset(vaddr)]),
        }
    }

    /// Simulated one-byte store by process `pid`.
    pub fn store(&self, space: AddressSpaceId, pid: u32, vaddr: u64, byte: u8) -> Result<(), Fault> {
        let page = PageIdentity::containing(space, vaddr);
        let mut state = self.state.lock();
        let fault = |kind| Fault { space, pid, vaddr, access: AccessKind::Write, kind };
        match state.mappings.get_mut(&page) {
            None => Err(fault(FaultKind::MissingPage)),
            Some(m) if !m.flags.contains(PermissionFlags::WRITE) => Err(fault(FaultKind::Violation)),
            Some(m) => {
                m.data.as_bytes_mut()[offset(vaddr)] = byte;
                Ok(())
            }
        }
    }
}

fn offset(vaddr: u64) -> usize {
    (vaddr as usize) & (PAGE_SIZE - 1)
}

fn fresh_mapping(shareable: bool) -> SimMapping {
    let mut flags = PermissionFlags::READ | PermissionFlags::WRITE;
    flags.set(PermissionFlags::SHAREABLE, shareable);
    SimMapping { flags, data: PageData::zeroed() }
}

impl PageTable for SimPageTable {
    fn flags(&self, page: PageIdentity) -> Result<PermissionFlags, MappingError> {
        let state = self.state.lock();
        state.mappings.get(&page).map(|m| m.flags).ok_or(MappingError::Unavailable(page))
    }

    fn set_flags(&self, page: PageIdentity, flags: PermissionFlags) -> Result<(), MappingError> {
        let mut state = self.state.lock();
        let mapping = state.mappings.get_mut(&page).ok_or(MappingError::Unavailable(page))?;
        mapping.flags.insert(flags);
        Ok(())
    }

    fn clear_flags(&self, page: PageIdentity, flags: PermissionFlags) -> Result<(), MappingError> {
        let mut state = self.state.lock();
        let mapping = state.mappings.get_mut(&page).ok_or(MappingError::Unavailable(page))?;
        mapping.flags.remove(flags);
        Ok(())
    }

    fn read_page(&self, page: PageIdentity) -> Result<PageData, MappingError> {
        self.contents(page).ok_or(MappingError::Unavailable(page))
    }

    fn write_page(&self, page: PageIdentity, data: &PageData) -> Result<(), MappingError> {
        let mut state = self.state.lock();
        let mapping = state.mappings.get_mut(&page).ok_or(MappingError::Unavailable(page))?;
        mapping.data = data.clone();
        Ok(())
    }
}

impl FallbackResolver for SimPageTable {
    fn resolve(&self, fault: &Fault) {
        let page = fault.page();
        let mut state = self.state.lock();
        state.fallback_log.push(*fault);
        if state.mappings.contains_key(&page) {
            return;
        }
        if let Some(&shareable) = state.regions.get(&page) {
            state.mappings.insert(page, fresh_mapping(shareable));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACE: AddressSpaceId = AddressSpaceId(5);

    #[test]
    fn missing_page_materializes_through_fallback() {
        let sim = SimPageTable::new();
        let page = PageIdentity::containing(SPACE, 0x9000);
        sim.declare(page, true);
        let fault = sim.load(SPACE, 1, 0x9004).unwrap_err();
        assert_eq!(fault.kind, FaultKind::MissingPage);
        sim.resolve(&fault);
        assert_eq!(sim.load(SPACE, 1, 0x9004), Ok(0));
        assert!(sim.flags(page).unwrap().contains(PermissionFlags::SHAREABLE));
        assert_eq!(sim.fallback_log().len(), 1);
    }

    #[test]
    fn undeclared_page_stays_unmapped() {
        let sim = SimPageTable::new();
        let fault = sim.store(SPACE, 1, 0x1000, 1).unwrap_err();
        sim.resolve(&fault);
        assert!(!sim.is_mapped(fault.page()));
    }

    #[test]
    fn cleared_flags_turn_accesses_into_violations() {
        let sim = SimPageTable::new();
        let page = PageIdentity::containing(SPACE, 0x2000);
        sim.map(page, true);
        sim.store(SPACE, 1, 0x2001, 7).unwrap();
        sim.clear_flags(page, PermissionFlags::WRITE).unwrap();
        let fault = sim.store(SPACE, 1, 0x2001, 8).unwrap_err();
        assert_eq!((fault.access, fault.kind), (AccessKind::Write, FaultKind::Violation));
        sim.clear_flags(page, PermissionFlags::READ).unwrap();
        assert_eq!(sim.load(SPACE, 1, 0x2001).unwrap_err().kind, FaultKind::Violation);
        assert_eq!(sim.read_page(page).unwrap().as_bytes()[1], 7);
    }
}
