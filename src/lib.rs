//! FF-A proxy — a trusted mediator for firmware memory sharing.
//!
//! Sits between untrusted endpoints (the host, and guest VMs) and the
//! secure partition manager, filtering the memory-sharing calls of the Arm
//! Firmware Framework (FF-A, DEN0077A): buffer registration, share/lend,
//! fragmented transfers, and reclaim. An endpoint can only ever hand the
//! secure side memory it exclusively owns; every multi-phase operation
//! that fails partway is rolled back, and the one rollback that cannot be
//! rolled back (a dead fragmented transfer) degrades to documented,
//! stranded pages rather than to a confidentiality hole.
//!
//! The trapping/dispatch transport, the stage-2 ownership tracker and the
//! raw secure-world call primitive are external collaborators, reached
//! through the [`smc::SecureWorld`] and [`authority::MemoryAuthority`]
//! traits; this crate is the protocol state machine between them.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod authority;
pub mod defs;
pub mod descriptors;
pub mod error;
pub mod mailbox;
pub mod proxy;
pub mod smc;
pub mod transfer;

pub use authority::{AuthorityError, MemoryAuthority};
pub use defs::{CallRegs, FfaStatus, Version};
pub use error::{Error, InitError, RunRequest};
pub use proxy::{FfaProxy, GuestOutcome, HostOutcome};
pub use smc::SecureWorld;
