//! Error taxonomy for the session manager core.
//!
//! Resource and argument errors are recovered immediately with no partial
//! state change. Host I/O errors are passed through verbatim; during
//! copy-on-open they are carried inside an [`Incarnation`](crate::incarnation::Incarnation)'s
//! `status` rather than propagated, because the incarnation itself is
//! still useful to the caller for orderly cleanup.

use std::io;

use thiserror::Error;

/// The error taxonomy surfaced by control messages (spec: OPEN/CLOSE/SHUTDOWN).
#[derive(Debug, Error)]
pub enum CoreError {
    /// Argument error: a path was not absolute, or otherwise malformed.
    #[error("invalid argument")]
    Invalid,
    /// Resource error: allocation of a session or incarnation record failed.
    #[error("out of memory")]
    NoMem,
    /// Argument error: no incarnation matches the given `(path, fd, pid)`.
    #[error("no such incarnation")]
    BadFd,
    /// Shutdown contention: the core could not be quiesced.
    #[error("core is busy, shutdown refused")]
    Busy,
    /// The owning process died between open and close.
    #[error("owning process is no longer live")]
    OwnerGone,
    /// The session went invalid between lookup and read-lock acquisition;
    /// the caller may retry `create`.
    #[error("session torn down concurrently, retry")]
    Retry,
    /// A host filesystem call failed; the wrapped error carries the raw errno.
    #[error("host I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// The negative-errno encoding used for an incarnation's `status` field
    /// (spec: `status ∈ {0} ∪ NegativeErrorCodes`). Falls back to `-EIO`
    /// when the underlying `io::Error` carries no raw OS error.
    pub fn to_status(&self) -> i32 {
        match self {
            CoreError::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            CoreError::Invalid => -libc::EINVAL,
            CoreError::NoMem => -libc::ENOMEM,
            CoreError::BadFd => -libc::EBADF,
            CoreError::Busy => -libc::EBUSY,
            CoreError::OwnerGone => -libc::ESRCH,
            CoreError::Retry => -libc::EAGAIN,
        }
    }
}

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;
