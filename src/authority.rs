//! Stage-2 ownership authority — the external collaborator that tracks
//! who owns every physical page.
//!
//! The proxy treats it as an oracle and mutator: it is assumed to enforce
//! single ownership, so a page that it reports as shared really is shared
//! and cannot simultaneously be donated elsewhere. All methods take
//! `&self`; implementations synchronize internally (the real one sits on
//! its own page-table locks).

use thiserror::Error;

/// Distinct failure modes of the ownership authority. `NotPresent` and
/// `OutOfMemory` are recoverable through the caller's run loop; the rest
/// are policy refusals.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("page is not owned by the endpoint")]
    NotOwned,
    #[error("page is already shared")]
    AlreadyShared,
    #[error("guest page is not resident")]
    NotPresent,
    #[error("ownership bookkeeping is out of memory")]
    OutOfMemory,
}

/// Operations the proxy needs from the stage-2 tracker. Addresses are
/// physical for the host endpoint and guest addresses otherwise; each
/// operation is idempotent on already-correct state.
pub trait MemoryAuthority {
    /// Make one endpoint-owned page accessible to the proxy, returning
    /// its mapping in the proxy's address space.
    fn share_with_proxy(&self, endpoint: u16, addr: u64) -> Result<*mut u8, AuthorityError>;

    /// Undo [`MemoryAuthority::share_with_proxy`].
    fn unshare_with_proxy(&self, endpoint: u16, addr: u64) -> Result<(), AuthorityError>;

    /// Pin a page previously shared with the proxy so it cannot be
    /// unmapped while the proxy holds references into it.
    fn pin(&self, endpoint: u16, addr: u64) -> Result<(), AuthorityError>;

    /// Undo [`MemoryAuthority::pin`].
    fn unpin(&self, endpoint: u16, addr: u64);

    /// Transition `pages` pages starting at `addr` into the "shared with
    /// the secure world" state. For a guest endpoint the address is
    /// translated and the physical address of the first page is returned;
    /// for the host the address is returned unchanged.
    fn share_with_secure(&self, endpoint: u16, addr: u64, pages: u64)
        -> Result<u64, AuthorityError>;

    /// Undo [`MemoryAuthority::share_with_secure`], returning the pages to
    /// exclusive endpoint ownership.
    fn unshare_with_secure(&self, endpoint: u16, addr: u64, pages: u64)
        -> Result<(), AuthorityError>;
}
