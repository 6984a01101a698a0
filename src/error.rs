//! Mediation error taxonomy.
//!
//! Every failure is one of: a structural/validation error (rejected before
//! any state mutation), local resource exhaustion, a status forwarded from
//! the Secure World, an aborted rollback, or one of the two cooperative
//! suspension points that bounce back to the caller's run loop.

use thiserror::Error;

use crate::defs::FfaStatus;

/// A side effect the caller's execution loop must perform before
/// re-issuing the same call. Never surfaced to the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    /// A guest page backing `addr` is not resident; resolve the fault,
    /// then retry.
    ResolvePage { addr: u64 },
    /// The bookkeeping allocator ran dry; donate `pages` pages, then retry.
    DonateMemory { pages: usize },
}

/// Why a mediated operation failed. The variant selects the rollback and
/// propagation policy at the dispatcher boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed descriptor or arguments; nothing was mutated.
    #[error("invalid descriptor or call arguments")]
    InvalidParameters,
    /// Local bookkeeping or buffer capacity exhausted.
    #[error("out of bookkeeping memory")]
    NoMemory,
    /// The shared buffer pair cannot take another reference.
    #[error("shared buffer capacity exhausted")]
    Busy,
    /// Refused by ownership or lifecycle policy.
    #[error("operation denied")]
    Denied,
    /// Explicit failure status from the Secure World, forwarded as-is.
    #[error("secure world returned {0:?}")]
    SecureWorld(FfaStatus),
    /// The Secure World answered with an opcode that does not match the
    /// protocol state; the response was not acted upon.
    #[error("unexpected secure world response {0:#010x}")]
    Protocol(u32),
    /// Rollback itself failed; the affected pages are stranded.
    #[error("rollback failed, pages stranded")]
    Aborted,
    /// Suspension: fault in a guest page, then retry.
    #[error("guest page {0:#x} must be resolved before retrying")]
    ResolvePage(u64),
    /// Suspension: donate bookkeeping memory, then retry.
    #[error("{0} page(s) must be donated before retrying")]
    DonateMemory(usize),
}

impl Error {
    /// The protocol status word reported to the caller. Suspension
    /// variants never reach the wire; they are split off by
    /// [`Error::run_request`] first.
    pub fn status(self) -> FfaStatus {
        match self {
            Error::InvalidParameters => FfaStatus::InvalidParameters,
            Error::NoMemory => FfaStatus::NoMemory,
            Error::Busy => FfaStatus::Busy,
            Error::Denied => FfaStatus::Denied,
            Error::SecureWorld(status) => status,
            Error::Protocol(_) => FfaStatus::InvalidParameters,
            Error::Aborted => FfaStatus::Aborted,
            Error::ResolvePage(_) | Error::DonateMemory(_) => FfaStatus::Interrupted,
        }
    }

    /// Split off the suspension variants for the caller's run loop.
    pub fn run_request(self) -> Option<RunRequest> {
        match self {
            Error::ResolvePage(addr) => Some(RunRequest::ResolvePage { addr }),
            Error::DonateMemory(pages) => Some(RunRequest::DonateMemory { pages }),
            _ => None,
        }
    }
}

/// Why proxy construction failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The Secure World does not implement FF-A; run without a proxy.
    #[error("FF-A is not implemented by the secure world")]
    Unavailable,
    /// The Secure World speaks a major version this proxy cannot mediate.
    #[error("incompatible FF-A version {0:#x}")]
    IncompatibleVersion(u32),
    /// Not enough memory for the staging buffers.
    #[error("out of memory for staging buffers")]
    NoMemory,
}
