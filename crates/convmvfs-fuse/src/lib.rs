//! FUSE dispatch layer for the convmvfs filename-transcoding filesystem.
//!
//! Bridges the kernel's inode-based protocol to the path-based core in
//! `convmvfs-core`: an [`InodeTable`] maps inode numbers to caller-visible
//! paths, and [`ConvMvFs`] implements `fuser::Filesystem` by forwarding
//! each request, together with the requesting process's (uid, gid), to the
//! core operation set.

pub mod filesystem;
pub mod inode;

pub use filesystem::ConvMvFs;
pub use inode::{InodeTable, ROOT_INODE};
