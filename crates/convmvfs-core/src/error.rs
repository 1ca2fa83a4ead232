//! Error handling and errno mapping for filesystem operations.
//!
//! Every operation in this crate reports failure through [`FsError`], which
//! the dispatch layer flattens to a negated POSIX error code via
//! [`FsError::to_errno`]. Nothing in here terminates the process; the only
//! fatal errors in the system are startup configuration failures, which live
//! in the binary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the passthrough core.
#[derive(Debug, Error)]
pub enum FsError {
    /// The permission walk refused the requested access.
    #[error("access denied: {path}")]
    Denied {
        /// Storage-side path at which the walk was refused.
        path: PathBuf,
    },

    /// The caller is not the owner (or root) for an owner-gated operation.
    #[error("operation not permitted: {path}")]
    NotPermitted {
        /// Storage-side path of the entry.
        path: PathBuf,
    },

    /// A non-directory showed up in an intermediate path position.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// Storage-side path of the offending component.
        path: PathBuf,
    },

    /// Empty pathname, see path_resolution(7).
    #[error("empty pathname")]
    EmptyPath,

    /// No multiplexed descriptor is open for this virtual path.
    ///
    /// This is a caller/dispatcher protocol violation (read or release
    /// without a preceding open), reported as not-found rather than a crash.
    #[error("no open descriptor for {path}")]
    StaleHandle {
        /// Caller-visible path used as the descriptor key.
        path: PathBuf,
    },

    /// A descriptor is already multiplexed for this path with an access mode
    /// that does not cover the newly requested one.
    #[error("descriptor for {path} open with incompatible access mode")]
    AccessModeConflict {
        /// Caller-visible path used as the descriptor key.
        path: PathBuf,
    },

    /// Error from the underlying native filesystem, passed through unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// Converts this error to a libc error code for the dispatch layer.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Denied { .. } | FsError::AccessModeConflict { .. } => libc::EACCES,
            FsError::NotPermitted { .. } => libc::EPERM,
            FsError::NotADirectory { .. } => libc::ENOTDIR,
            FsError::EmptyPath | FsError::StaleHandle { .. } => libc::ENOENT,
            FsError::Io(e) => io_error_to_errno(e),
        }
    }
}

/// Converts an `io::Error` to a libc error code, falling back to EIO when
/// the error carries no raw OS code.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Result type for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Converts a nix errno into the crate error type.
pub(crate) fn errno_to_fs(e: nix::errno::Errno) -> FsError {
    FsError::Io(io::Error::from_raw_os_error(e as i32))
}
