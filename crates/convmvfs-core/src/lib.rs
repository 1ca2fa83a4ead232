//! Core of a filename-transcoding passthrough filesystem.
//!
//! The filesystem mirrors a local source directory whose filenames are
//! stored in one charset and presents them to callers in another. This
//! crate holds everything below the FUSE dispatch layer:
//!
//! - [`Transcoder`] - stateful, bounded-buffer filename conversion with
//!   sentinel degradation for undecodable or unmappable names
//! - [`permission_walk`] - userspace replay of the kernel's per-component
//!   access decision for the real caller's (uid, gid)
//! - [`FdTable`] - reference-counted multiplexing of native descriptors,
//!   keyed by caller-visible path
//! - [`PathResolver`] / [`MountConfig`] - caller↔storage path mapping and
//!   startup validation
//! - [`ConvFs`] - the full operation set tying the pieces together
//!
//! Everything here is path-based and synchronous; inode bookkeeping and the
//! kernel protocol live in the dispatch crate.
//!
//! # Why userspace permission checks?
//!
//! The driver typically runs as root so it can serve every user's view of
//! the source tree. Native calls therefore pass the kernel's check no
//! matter who the real caller is; [`permission_walk`] re-derives the
//! decision the kernel would have made for the caller before any native
//! call is issued.

pub mod charset;
pub mod error;
pub mod fdtable;
pub mod ops;
pub mod perm;
pub mod resolver;

pub use charset::{Direction, Transcoder, lookup_charset};
pub use error::{FsError, FsResult};
pub use fdtable::FdTable;
pub use ops::{ConvFs, DirEntry};
pub use perm::{Access, Caller, EntryMeta, MetadataSource, NativeMetadata, permission_walk};
pub use resolver::{ConfigError, MountConfig, PathResolver};
