// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page identities and page-sized buffers.

use core::fmt;

use thiserror::Error;

/// log2 of the shared page size.
pub const PAGE_SHIFT: u32 = 12;
/// Size in bytes of every shared page. Variable page sizes are not supported.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Opaque token naming one coherence domain (the shared address space of the
/// target process as seen by every participating host).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpaceId(pub u64);

/// Names one shared page across the whole system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageIdentity {
    /// Address space the page belongs to.
    pub space: AddressSpaceId,
    /// Page frame number (`vaddr >> PAGE_SHIFT`).
    pub frame: u64,
}

impl PageIdentity {
    /// Builds an identity from its parts.
    pub const fn new(space: AddressSpaceId, frame: u64) -> Self {
        Self { space, frame }
    }

    /// Identity of the page containing `vaddr`.
    pub const fn containing(space: AddressSpaceId, vaddr: u64) -> Self {
        Self { space, frame: vaddr >> PAGE_SHIFT }
    }

    /// First virtual address of the page.
    pub const fn base_address(&self) -> u64 {
        self.frame << PAGE_SHIFT
    }
}

impl fmt::Display for PageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.space.0, self.base_address())
    }
}

/// A slice that was expected to hold exactly one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page payload must be {PAGE_SIZE} bytes, got {0}")]
pub struct PageSizeError(pub usize);

/// Page buffer could not be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page buffer allocation failed")]
pub struct AllocationFailure;

/// Owned copy of one page. Always exactly [`PAGE_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct PageData(Box<[u8]>);

impl PageData {
    /// Zero-filled page, reporting allocation failure instead of aborting.
    pub fn try_zeroed() -> Result<Self, AllocationFailure> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(PAGE_SIZE).map_err(|_| AllocationFailure)?;
        bytes.resize(PAGE_SIZE, 0);
        Ok(Self(bytes.into_boxed_slice()))
    }

    /// Zero-filled page.
    pub fn zeroed() -> Self {
        Self(vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    /// Page with every byte set to `byte`.
    pub fn filled(byte: u8) -> Self {
        Self(vec![byte; PAGE_SIZE].into_boxed_slice())
    }

    /// Copies `bytes`, which must be exactly one page long.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, PageSizeError> {
        if bytes.len() != PAGE_SIZE {
            return Err(PageSizeError(bytes.len()));
        }
        Ok(Self(bytes.into()))
    }

    /// Page contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Mutable page contents.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl fmt::Debug for PageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageData").field("head", &&self.0[..8]).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_groups_addresses_by_frame() {
        let space = AddressSpaceId(0x7f00);
        let a = PageIdentity::containing(space, 0x4000);
        let b = PageIdentity::containing(space, 0x4fff);
        let c = PageIdentity::containing(space, 0x5000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.base_address(), 0x4000);
        assert_ne!(a, PageIdentity::containing(AddressSpaceId(1), 0x4000));
    }

    #[test]
    fn page_data_rejects_wrong_length() {
        assert_eq!(PageData::try_from_slice(&[0u8; 12]), Err(PageSizeError(12)));
        let page = PageData::try_from_slice(&[3u8; PAGE_SIZE]).unwrap();
        assert_eq!(page, PageData::filled(3));
        assert_eq!(PageData::try_zeroed().unwrap(), PageData::zeroed());
    }
}
