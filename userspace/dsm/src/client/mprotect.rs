// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-space protection trap backend (Linux)
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! Expresses the protocol's read/write blocks as `mprotect(2)` protections on
//! registered pages of the current process. A blocked access raises SIGSEGV;
//! catching it and turning it into a `Fault` for the `AccessMonitor` is the
//! embedding application's job. Missing-page faults do not occur with this
//! backend: registration requires an existing mapping.

#![allow(unsafe_code)]

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::client::pagetable::{MappingError, PageTable, PermissionFlags};
use crate::page::{AddressSpaceId, PageData, PageIdentity, PAGE_SIZE};

struct Region {
    base: usize,
    flags: PermissionFlags,
}

/// Page table over `mprotect` for pages of the running process.
pub struct MprotectPageTable {
    space: AddressSpaceId,
    regions: Mutex<HashMap<PageIdentity, Region>>,
}

impl MprotectPageTable {
    /// Table for the coherence domain `space`.
    pub fn new(space: AddressSpaceId) -> Self {
        Self { space, regions: Mutex::new(HashMap::new()) }
    }

    /// Places the page at `base` under protocol control with full access.
    ///
    /// # Safety
    ///
    /// `base` must be the page-aligned start of a private read/write mapping
    /// of at least `PAGE_SIZE` bytes that stays mapped until
    /// [`MprotectPageTable::unregister`] is called or the table is dropped.
    pub unsafe fn register(&self, base: *mut u8, shareable: bool) -> Result<PageIdentity, MappingError> {
        let vaddr = base as u64;
        let page = PageIdentity::containing(self.space, vaddr);
        if vaddr != page.base_address() {
            return Err(MappingError::Unavailable(page));
        }
        let mut flags = PermissionFlags::READ | PermissionFlags::WRITE;
        flags.set(PermissionFlags::SHAREABLE, shareable);
        protect(page, base as usize, flags)?;
        self.regions.lock().insert(page, Region { base: base as usize, flags });
        Ok(page)
    }

    /// Restores full access and releases the page.
    pub fn unregister(&self, page: PageIdentity) {
        if let Some(region) = self.regions.lock().remove(&page) {
            let _ = protect(page, region.base, PermissionFlags::READ | PermissionFlags::WRITE);
        }
    }

    fn update(
        &self,
        page: PageIdentity,
        apply: impl FnOnce(&mut PermissionFlags),
    ) -> Result<(), MappingError> {
        let mut regions = self.regions.lock();
        let region = regions.get_mut(&page).ok_or(MappingError::Unavailable(page))?;
        let mut flags = region.flags;
        apply(&mut flags);
        protect(page, region.base, flags)?;
        region.flags = flags;
        Ok(())
    }
}

fn prot_for(flags: PermissionFlags) -> libc::c_int {
    // Write access implies read on every supported MMU.
    if flags.contains(PermissionFlags::WRITE) {
        libc::PROT_READ | libc::PROT_WRITE
    } else if flags.contains(PermissionFlags::READ) {
        libc::PROT_READ
    } else {
        libc::PROT_NONE
    }
}

fn protect(page: PageIdentity, base: usize, flags: PermissionFlags) -> Result<(), MappingError> {
    // SAFETY: `base` was validated as a registered, page-aligned mapping of
    // PAGE_SIZE bytes; changing its protection does not alias Rust memory.
    let rc = unsafe { libc::mprotect(base as *mut libc::c_void, PAGE_SIZE, prot_for(flags)) };
    if rc == 0 {
        Ok(())
    } else {
        Err(MappingError::Unavailable(page))
    }
}

impl PageTable for MprotectPageTable {
    fn flags(&self, page: PageIdentity) -> Result<PermissionFlags, MappingError> {
        self.regions.lock().get(&page).map(|r| r.flags).ok_or(MappingError::Unavailable(page))
    }

    fn set_flags(&self, page: PageIdentity, flags: PermissionFlags) -> Result<(), MappingError> {
        self.update(page, |current| current.insert(flags))
    }

    fn clear_flags(&self, page: PageIdentity, flags: PermissionFlags) -> Result<(), MappingError> {
        self.update(page, |current| current.remove(flags))
    }

    fn read_page(&self, page: PageIdentity) -> Result<PageData, MappingError> {
        let regions = self.regions.lock();
        let region = regions.get(&page).ok_or(MappingError::Unavailable(page))?;
        let mut data = PageData::try_zeroed().map_err(|_| MappingError::Unavailable(page))?;
        protect(page, region.base, region.flags | PermissionFlags::READ)?;
        // SAFETY: the region is a readable mapping of PAGE_SIZE bytes for the
        // duration of the copy; the regions lock excludes protection changes.
        let src = unsafe { std::slice::from_raw_parts(region.base as *const u8, PAGE_SIZE) };
        data.as_bytes_mut().copy_from_slice(src);
        protect(page, region.base, region.flags)?;
        Ok(data)
    }

    fn write_page(&self, page: PageIdentity, data: &PageData) -> Result<(), MappingError> {
        let regions = self.regions.lock();
        let region = regions.get(&page).ok_or(MappingError::Unavailable(page))?;
        protect(page, region.base, region.flags | PermissionFlags::READ | PermissionFlags::WRITE)?;
        // SAFETY: the region is a writable mapping of PAGE_SIZE bytes for the
        // duration of the copy and is never borrowed as a Rust reference.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_bytes().as_ptr(), region.base as *mut u8, PAGE_SIZE)
        };
        protect(page, region.base, region.flags)?;
        Ok(())
    }
}

impl Drop for MprotectPageTable {
    fn drop(&mut self) {
        for (page, region) in self.regions.lock().drain() {
            let _ = protect(page, region.base, PermissionFlags::READ | PermissionFlags::WRITE);
        }
    }
}
