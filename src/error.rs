//! Error taxonomy for the union filesystem core.
//!
//! Every fallible core operation returns [`UnionError`]. The variants map onto
//! the taxonomy from the design notes: invariant violations are bugs and are
//! expected to be turned into a `panic!` at the detection site rather than
//! propagated; [`UnionError::CopyUp`] is a retry sentinel that must never
//! escape [`crate::ops`] into a caller.

use std::io;

/// The distinguished "retry on a higher branch" signal used internally by
/// mutation operations. If this ever reaches a host caller it is a bug in the
/// mutation loop; callers should see [`UnionError::to_errno`] turn it into
/// `EROFS` as a last resort.
pub(crate) const COPYUP_ERRNO: i32 = libc::EROFS;

/// Errors produced by the union filesystem core.
#[derive(thiserror::Error, Debug)]
pub enum UnionError {
    /// A core invariant was violated. This indicates a bug and callers should
    /// treat it as fatal rather than attempt recovery.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    /// The cached fan-out node no longer corresponds to anything on the
    /// backing branches; the host must drop its cache entry and re-look-up.
    #[error("stale object")]
    Stale,

    /// Internal retry signal: the mutation must be retried against a branch
    /// further left than the one that produced this error. Never returned
    /// from a public `ops::*` function.
    #[error("copy-up required")]
    CopyUp,

    /// The name is reserved for internal use (whiteout prefix or the opacity
    /// marker) and may not be the target of a user-visible operation.
    #[error("reserved name")]
    NameViolation,

    /// An error surfaced verbatim from a lower filesystem.
    #[error("lower filesystem error: {0}")]
    Lower(#[from] io::Error),

    /// Allocation failed while building or growing core state.
    #[error("out of memory")]
    NoMem,
}

impl UnionError {
    /// Invariant-violation constructor used at assertion sites throughout the
    /// core; see spec §7 "Invariant violation (bug)".
    pub(crate) fn invariant(msg: &'static str) -> Self {
        UnionError::Invariant(msg)
    }

    /// Maps this error onto a POSIX errno, the form every external collaborator
    /// ultimately needs to hand back to its own caller. `CopyUp` reaching this
    /// point means a mutation operation failed to convert it internally; we
    /// still must not panic on a host-caller-visible path, so it degrades to
    /// `EROFS` per spec §7.
    pub fn to_errno(&self) -> i32 {
        match self {
            UnionError::Invariant(_) => libc::EIO,
            UnionError::Stale => libc::ESTALE,
            UnionError::CopyUp => COPYUP_ERRNO,
            UnionError::NameViolation => libc::EPERM,
            UnionError::Lower(e) => e.raw_os_error().unwrap_or(libc::EIO),
            UnionError::NoMem => libc::ENOMEM,
        }
    }
}

/// Core-wide result alias.
pub type Result<T> = std::result::Result<T, UnionError>;
