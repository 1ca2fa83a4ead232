//! Reference-counted native descriptor cache keyed by virtual path.
//!
//! Concurrent logical opens of the same caller-visible path multiplex one
//! native descriptor; the underlying file is closed exactly once, when the
//! last reference is released. Lookup-and-create and decrement-and-close
//! are each atomic with respect to concurrent calls: the whole table sits
//! behind one exclusive lock, and the native `open` happens inside the
//! critical section so two racing first-opens cannot create duplicate
//! entries.
//!
//! A re-acquire whose requested access mode is not covered by the cached
//! descriptor's mode is rejected instead of silently reusing the first
//! opener's flags (a later writer must not be handed a read-only
//! descriptor).

use crate::error::{FsError, FsResult, errno_to_fs};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One multiplexed descriptor.
#[derive(Debug)]
struct FdEntry {
    file: File,
    /// Open flags of the first opener; only O_ACCMODE is consulted on
    /// re-acquire.
    flags: i32,
    /// Number of outstanding logical opens, always >= 1 while the entry
    /// exists.
    refs: usize,
}

/// True when a descriptor opened with `held` satisfies a request for
/// `wanted` (both O_ACCMODE values).
fn accmode_covers(held: i32, wanted: i32) -> bool {
    held == libc::O_RDWR || held == wanted
}

/// Table of multiplexed native descriptors, keyed by caller-visible path.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: Mutex<HashMap<PathBuf, FdEntry>>,
}

impl FdTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a descriptor for `vpath`.
    ///
    /// If the path is already open, its reference count is incremented and
    /// the existing descriptor is reused, provided the cached access mode
    /// covers the requested one. Otherwise `open_fn` is invoked and the
    /// result inserted with a reference count of 1.
    pub fn acquire<F>(&self, vpath: &Path, flags: i32, open_fn: F) -> FsResult<()>
    where
        F: FnOnce() -> io::Result<File>,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(vpath) {
            if !accmode_covers(entry.flags & libc::O_ACCMODE, flags & libc::O_ACCMODE) {
                warn!(
                    path = %vpath.display(),
                    held = entry.flags & libc::O_ACCMODE,
                    wanted = flags & libc::O_ACCMODE,
                    "rejecting re-open with incompatible access mode"
                );
                return Err(FsError::AccessModeConflict {
                    path: vpath.to_path_buf(),
                });
            }
            entry.refs += 1;
            debug!(path = %vpath.display(), refs = entry.refs, "descriptor reused");
            return Ok(());
        }
        let file = open_fn()?;
        debug!(path = %vpath.display(), "descriptor opened");
        entries.insert(
            vpath.to_path_buf(),
            FdEntry {
                file,
                flags,
                refs: 1,
            },
        );
        Ok(())
    }

    /// Runs `f` with the descriptor for `vpath`, without touching the
    /// reference count.
    pub fn with_file<R>(&self, vpath: &Path, f: impl FnOnce(&File) -> R) -> FsResult<R> {
        let entries = self.entries.lock();
        let entry = entries.get(vpath).ok_or_else(|| FsError::StaleHandle {
            path: vpath.to_path_buf(),
        })?;
        Ok(f(&entry.file))
    }

    /// Releases one reference to `vpath`, closing the native descriptor
    /// when the count reaches zero. Close failures are surfaced; releasing
    /// an unknown path reports not-found.
    pub fn release(&self, vpath: &Path) -> FsResult<()> {
        let mut entries = self.entries.lock();
        let last = {
            let entry = entries.get_mut(vpath).ok_or_else(|| FsError::StaleHandle {
                path: vpath.to_path_buf(),
            })?;
            entry.refs -= 1;
            entry.refs == 0
        };
        if !last {
            return Ok(());
        }
        if let Some(entry) = entries.remove(vpath) {
            debug!(path = %vpath.display(), "descriptor closed");
            nix::unistd::close(entry.file.into_raw_fd()).map_err(errno_to_fs)?;
        }
        Ok(())
    }

    /// Number of distinct open paths.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no descriptors are open.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
