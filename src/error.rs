//! Crate-wide error type.
//!
//! Mirrors the semantic error kinds from the coordination store, the
//! repository layer, and the task runner into one enum so callers at
//! any layer match on the same set of variants.

use thiserror::Error;

/// Errors surfaced by the coordination store, repositories, task runner,
/// and lifecycle engine.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create/transition guard conflicted with existing state.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Illegal state transition or malformed input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// An optimistic transaction lost a compare-and-swap race.
    #[error("stale revision on {0}")]
    StaleRevision(String),

    /// The coordination store or warehouse bridge is transiently
    /// unavailable. Retried by the caller with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A write was rejected because the target file is not `writing`;
    /// the caller must re-read the current file and retry.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The target volume has been deregistered (its node's lease expired).
    #[error("volume gone: {0}")]
    VolumeGone(String),

    /// A task function panicked.
    #[error("panic: {0}")]
    Panic(String),

    /// The operation was canceled via its `CancellationToken`.
    #[error("canceled")]
    Canceled,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors the `kv` layer retries transparently with backoff.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub fn is_stale_revision(&self) -> bool {
        matches!(self, Error::StaleRevision(_))
    }
}
