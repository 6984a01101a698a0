//! Message-box buffers — the proxy's own staging pages and the
//! per-endpoint buffer table.
//!
//! The proxy owns one TX/RX pair used to talk to the Secure World plus a
//! larger scratch buffer for painted descriptors and reassembled retrieve
//! responses. Endpoints own at most one TX/RX pair each, mapped into the
//! proxy's address space by the ownership authority and tracked here
//! together with their in-flight transfers.

use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::vec::Vec;

use crate::defs::PAGE_SIZE;
use crate::error::Error;
use crate::transfer::MemTransfer;

/// One page-aligned, page-sized block.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

impl Page {
    pub const ZERO: Page = Page([0; PAGE_SIZE]);
}

/// A page-aligned staging buffer owned by the proxy, allocated once at
/// init. Identity-mapped environments hand its address straight to the
/// Secure World as the buffer's physical address.
pub struct DescriptorBuf {
    pages: Box<[Page]>,
}

impl DescriptorBuf {
    /// Allocate `npages` zeroed pages, failing cleanly on exhaustion.
    pub fn new(npages: usize) -> Result<Self, Error> {
        let mut pages = Vec::new();
        pages
            .try_reserve_exact(npages)
            .map_err(|_: TryReserveError| Error::NoMemory)?;
        pages.resize(npages, Page::ZERO);
        Ok(Self {
            pages: pages.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `Page` is exactly PAGE_SIZE bytes at PAGE_SIZE alignment,
        // so the boxed array is one contiguous, fully initialised block.
        unsafe { core::slice::from_raw_parts(self.pages.as_ptr() as *const u8, self.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the borrow is exclusive.
        unsafe { core::slice::from_raw_parts_mut(self.pages.as_mut_ptr() as *mut u8, self.pages.len() * PAGE_SIZE) }
    }

    /// The buffer's physical address under an identity mapping.
    pub fn pa(&self) -> u64 {
        self.pages.as_ptr() as u64
    }
}

/// An endpoint page mapped into the proxy's address space by the ownership
/// authority. Stored as a bare address so the endpoint table stays `Send`;
/// the mapping is only dereferenced while the page is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPage(usize);

impl MappedPage {
    pub fn new(ptr: *mut u8) -> Self {
        Self(ptr as usize)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Copy out of the mapped page.
    ///
    /// # Safety
    ///
    /// The page must still be pinned by the ownership authority and `dst`
    /// must not exceed the page size.
    pub unsafe fn read_into(&self, dst: &mut [u8]) {
        debug_assert!(dst.len() <= PAGE_SIZE);
        core::ptr::copy_nonoverlapping(self.as_ptr(), dst.as_mut_ptr(), dst.len());
    }

    /// Copy into the mapped page.
    ///
    /// # Safety
    ///
    /// The page must still be pinned by the ownership authority and `src`
    /// must not exceed the page size.
    pub unsafe fn write_from(&self, src: &[u8]) {
        debug_assert!(src.len() <= PAGE_SIZE);
        core::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr(), src.len());
    }
}

/// Per-endpoint buffer state: the mapped TX/RX pair, the caller-supplied
/// addresses it was mapped from, and the endpoint's in-flight transfers.
///
/// Either both buffers are present and pinned or both are absent; the
/// transient in-between states only exist under the proxy lock.
#[derive(Default)]
pub struct EndpointBuffers {
    pub tx: Option<MappedPage>,
    pub rx: Option<MappedPage>,
    pub tx_addr: u64,
    pub rx_addr: u64,
    pub transfers: Vec<MemTransfer>,
}

impl EndpointBuffers {
    pub const fn new() -> Self {
        Self {
            tx: None,
            rx: None,
            tx_addr: 0,
            rx_addr: 0,
            transfers: Vec::new(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.tx.is_some()
    }

    pub fn find_transfer(&self, handle: u64) -> Option<usize> {
        self.transfers.iter().position(|t| t.handle == handle)
    }
}
