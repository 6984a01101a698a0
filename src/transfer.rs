//! Transfer records and the per-transfer translation ledger.
//!
//! A transfer tracks one accepted share/lend from a guest until it is
//! reclaimed. While the descriptor is painted with physical addresses,
//! every guest-address→physical-address mapping is recorded here so the
//! reclaim path can undo the share page by page.

use alloc::vec::Vec;

use crate::defs::PAGE_SIZE;
use crate::error::Error;

/// One guest-address → physical-address mapping, owned by exactly one
/// transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub guest_addr: u64,
    pub pa: u64,
}

/// One in-flight or completed share/lend by a guest endpoint.
///
/// The handle stays zero until the Secure World acknowledges the transfer;
/// only then is the record linked into the endpoint's transfer list.
#[derive(Debug, Default)]
pub struct MemTransfer {
    pub handle: u64,
    translations: Vec<Translation>,
}

impl MemTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a translation, surfacing bookkeeping exhaustion as a
    /// cooperative donation request rather than aborting.
    pub fn record(&mut self, guest_addr: u64, pa: u64) -> Result<(), Error> {
        self.translations
            .try_reserve(1)
            .map_err(|_| Error::DonateMemory(1))?;
        self.translations.push(Translation { guest_addr, pa });
        Ok(())
    }

    /// Remove and return the translation that produced `pa`.
    pub fn take_translation(&mut self, pa: u64) -> Option<Translation> {
        let idx = self.translations.iter().position(|t| t.pa == pa)?;
        Some(self.translations.swap_remove(idx))
    }

    /// Drain the whole ledger, e.g. when tearing an endpoint down.
    pub fn drain_translations(&mut self) -> impl Iterator<Item = Translation> + '_ {
        self.translations.drain(..)
    }

    pub fn translation_count(&self) -> usize {
        self.translations.len()
    }

    /// Pages covered by this transfer, from the ledger.
    pub fn page_count(&self) -> u64 {
        self.translations.len() as u64
    }
}

/// Donation size hint for an allocation of `bytes`, in whole pages.
pub fn donation_pages(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE).max(1)
}
