//! Userspace re-enforcement of UNIX discretionary access control.
//!
//! The driver process runs with its own (typically elevated) privilege, so
//! the kernel's permission check at the moment of the native call reflects
//! the driver, not the real caller. This module replays the kernel's
//! component-by-component path-resolution decision for the caller's
//! (uid, gid) before any native call is made.
//!
//! The walk is pure, input-driven logic over a [`MetadataSource`], so it is
//! unit-testable against synthetic directory trees without mounting
//! anything.

use crate::error::{FsError, FsResult};
use bitflags::bitflags;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// The privileged identity that bypasses discretionary checks.
pub const ROOT_UID: u32 = 0;

bitflags! {
    /// Requested access mask for a permission walk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        /// Read permission on the final entry.
        const READ = 0o1;
        /// Write permission on the final entry.
        const WRITE = 0o2;
        /// Execute (or directory traversal) permission on the final entry.
        const EXEC = 0o4;
    }
}

/// The identity a request is acting as, supplied per request by the
/// dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    /// Effective uid of the calling process.
    pub uid: u32,
    /// Effective gid of the calling process.
    pub gid: u32,
}

impl Caller {
    /// Creates a caller identity.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// True for the privileged super-user identity.
    pub fn is_root(&self) -> bool {
        self.uid == ROOT_UID
    }
}

/// Ownership and mode bits of one filesystem entry, the only metadata the
/// walk needs.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    /// Full st_mode, file-type bits included.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
}

impl EntryMeta {
    /// True if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Selects the mode-bit triple that applies to `caller` and checks the
    /// requested access against it, one bit at a time.
    fn grants(&self, caller: Caller, access: Access) -> bool {
        let (r, w, x) = if self.uid == caller.uid {
            (libc::S_IRUSR, libc::S_IWUSR, libc::S_IXUSR)
        } else if self.gid == caller.gid {
            (libc::S_IRGRP, libc::S_IWGRP, libc::S_IXGRP)
        } else {
            (libc::S_IROTH, libc::S_IWOTH, libc::S_IXOTH)
        };
        if access.contains(Access::READ) && self.mode & r == 0 {
            return false;
        }
        if access.contains(Access::WRITE) && self.mode & w == 0 {
            return false;
        }
        if access.contains(Access::EXEC) && self.mode & x == 0 {
            return false;
        }
        true
    }
}

/// Source of entry metadata for the walk.
///
/// The production implementation issues real `stat`/`lstat` calls; tests
/// substitute a synthetic tree.
pub trait MetadataSource {
    /// Stats an entry, following a final symlink.
    fn stat(&self, path: &Path) -> io::Result<EntryMeta>;
    /// Stats an entry without following a final symlink.
    fn lstat(&self, path: &Path) -> io::Result<EntryMeta>;
}

/// [`MetadataSource`] backed by the native filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeMetadata;

impl MetadataSource for NativeMetadata {
    fn stat(&self, path: &Path) -> io::Result<EntryMeta> {
        let m = std::fs::metadata(path)?;
        Ok(EntryMeta {
            mode: m.mode(),
            uid: m.uid(),
            gid: m.gid(),
        })
    }

    fn lstat(&self, path: &Path) -> io::Result<EntryMeta> {
        let m = std::fs::symlink_metadata(path)?;
        Ok(EntryMeta {
            mode: m.mode(),
            uid: m.uid(),
            gid: m.gid(),
        })
    }
}

/// Replays the kernel's path-resolution access decision for `caller`.
///
/// Every non-final component must resolve to a directory granting traversal
/// (execute) permission; the final entry must grant `access`. When
/// `symlink_final` is set the final entry is resolved with `lstat`, so the
/// check applies to the link itself (readlink/lstat semantics).
///
/// Root is authorized unconditionally; an empty path is refused outright;
/// `stat` failures (missing or dangling components) propagate unchanged.
pub fn permission_walk<M: MetadataSource>(
    meta: &M,
    path: &Path,
    caller: Caller,
    access: Access,
    symlink_final: bool,
) -> FsResult<()> {
    if caller.is_root() {
        return Ok(());
    }
    let components: Vec<Component<'_>> = path.components().collect();
    if components.is_empty() {
        return Err(FsError::EmptyPath);
    }

    let mut current = PathBuf::new();
    let last = components.len() - 1;
    for (i, component) in components.into_iter().enumerate() {
        current.push(component);
        if matches!(component, Component::RootDir) && i != last {
            // "/" itself is traversed implicitly, as in path_resolution(7)
            continue;
        }
        if i == last {
            let m = if symlink_final {
                meta.lstat(&current)?
            } else {
                meta.stat(&current)?
            };
            if !m.grants(caller, access) {
                return Err(FsError::Denied { path: current });
            }
        } else {
            let m = meta.stat(&current)?;
            if !m.is_dir() {
                return Err(FsError::NotADirectory { path: current });
            }
            if !m.grants(caller, Access::EXEC) {
                return Err(FsError::Denied { path: current });
            }
        }
    }
    Ok(())
}

/// Runs [`permission_walk`] against the parent directory of `path`.
///
/// Used by operations that create, remove or rename an entry and therefore
/// need permission on the containing directory rather than the entry.
pub fn permission_walk_parent<M: MetadataSource>(
    meta: &M,
    path: &Path,
    caller: Caller,
    access: Access,
) -> FsResult<()> {
    let parent = path.parent().ok_or(FsError::EmptyPath)?;
    permission_walk(meta, parent, caller, access, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Synthetic directory tree for walk tests.
    struct MapMetadata {
        entries: HashMap<PathBuf, EntryMeta>,
    }

    impl MapMetadata {
        fn new() -> Self {
            Self {
                entries: HashMap::new(),
            }
        }

        fn dir(mut self, path: &str, mode: u32, uid: u32, gid: u32) -> Self {
            self.entries.insert(
                PathBuf::from(path),
                EntryMeta {
                    mode: libc::S_IFDIR | mode,
                    uid,
                    gid,
                },
            );
            self
        }

        fn file(mut self, path: &str, mode: u32, uid: u32, gid: u32) -> Self {
            self.entries.insert(
                PathBuf::from(path),
                EntryMeta {
                    mode: libc::S_IFREG | mode,
                    uid,
                    gid,
                },
            );
            self
        }
    }

    impl MetadataSource for MapMetadata {
        fn stat(&self, path: &Path) -> io::Result<EntryMeta> {
            self.entries
                .get(path)
                .copied()
                .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
        }

        fn lstat(&self, path: &Path) -> io::Result<EntryMeta> {
            self.stat(path)
        }
    }

    fn tree() -> MapMetadata {
        MapMetadata::new()
            .dir("/", 0o755, 0, 0)
            .dir("/data", 0o755, 0, 0)
            .dir("/data/home", 0o750, 1000, 1000)
            .file("/data/home/private.txt", 0o600, 1000, 1000)
            .file("/data/home/group.txt", 0o640, 1000, 1000)
            .file("/data/public.txt", 0o644, 0, 0)
    }

    #[test]
    fn test_root_always_authorized() {
        let t = tree();
        let root = Caller::new(0, 0);
        // Even over files with zero permission bits
        let t = t.file("/data/sealed", 0o000, 1000, 1000);
        assert!(permission_walk(&t, Path::new("/data/sealed"), root, Access::all(), false).is_ok());
    }

    #[test]
    fn test_empty_path_denied() {
        let t = tree();
        let e = permission_walk(&t, Path::new(""), Caller::new(1000, 1000), Access::READ, false)
            .unwrap_err();
        assert_eq!(e.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_owner_bits_apply() {
        let t = tree();
        let owner = Caller::new(1000, 1000);
        let path = Path::new("/data/home/private.txt");
        assert!(permission_walk(&t, path, owner, Access::READ | Access::WRITE, false).is_ok());
    }

    #[test]
    fn test_non_owner_denied_on_0600() {
        let t = tree();
        let stranger = Caller::new(1001, 1001);
        let path = Path::new("/data/home/private.txt");
        // Walk fails at the 0750 home dir already for uid 1001
        let e = permission_walk(&t, path, stranger, Access::READ, false).unwrap_err();
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_group_bits_apply() {
        let t = tree();
        let member = Caller::new(1001, 1000);
        let path = Path::new("/data/home/group.txt");
        assert!(permission_walk(&t, path, member, Access::READ, false).is_ok());
        let e = permission_walk(&t, path, member, Access::WRITE, false).unwrap_err();
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_other_bits_apply() {
        let t = tree();
        let stranger = Caller::new(1001, 1001);
        let path = Path::new("/data/public.txt");
        assert!(permission_walk(&t, path, stranger, Access::READ, false).is_ok());
        let e = permission_walk(&t, path, stranger, Access::WRITE, false).unwrap_err();
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_traversal_requires_exec() {
        // Directory readable but not executable: final read check passes on
        // the dir itself, traversal through it does not
        let t = MapMetadata::new()
            .dir("/", 0o755, 0, 0)
            .dir("/opaque", 0o644, 0, 0)
            .file("/opaque/inner", 0o644, 0, 0);
        let user = Caller::new(1000, 1000);
        assert!(permission_walk(&t, Path::new("/opaque"), user, Access::READ, false).is_ok());
        let e =
            permission_walk(&t, Path::new("/opaque/inner"), user, Access::READ, false).unwrap_err();
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_file_in_intermediate_position() {
        let t = tree();
        let e = permission_walk(
            &t,
            Path::new("/data/public.txt/sub"),
            Caller::new(1000, 1000),
            Access::READ,
            false,
        )
        .unwrap_err();
        assert_eq!(e.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_missing_component_propagates_enoent() {
        let t = tree();
        let e = permission_walk(
            &t,
            Path::new("/data/nowhere/file"),
            Caller::new(1000, 1000),
            Access::READ,
            false,
        )
        .unwrap_err();
        assert_eq!(e.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_parent_walk() {
        let t = tree();
        // Creating under /data/home needs write+exec on /data/home:
        // fine for the owner, denied for a stranger (0750)
        let owner = Caller::new(1000, 1000);
        assert!(
            permission_walk_parent(
                &t,
                Path::new("/data/home/new.txt"),
                owner,
                Access::WRITE | Access::EXEC,
            )
            .is_ok()
        );
        let stranger = Caller::new(1001, 1001);
        let e = permission_walk_parent(
            &t,
            Path::new("/data/home/new.txt"),
            stranger,
            Access::WRITE | Access::EXEC,
        )
        .unwrap_err();
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_parent_of_root_is_empty() {
        let t = tree();
        let e = permission_walk_parent(&t, Path::new("/"), Caller::new(1000, 1000), Access::EXEC)
            .unwrap_err();
        assert_eq!(e.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_walk_on_root_checks_root_itself() {
        let t = MapMetadata::new().dir("/", 0o700, 0, 0);
        let e = permission_walk(&t, Path::new("/"), Caller::new(1000, 1000), Access::READ, false)
            .unwrap_err();
        assert_eq!(e.to_errno(), libc::EACCES);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Reference model: independent replay of the mode-bit rules.
        fn reference_grants(m: &EntryMeta, caller: Caller, access: Access) -> bool {
            let shift = if m.uid == caller.uid {
                6
            } else if m.gid == caller.gid {
                3
            } else {
                0
            };
            let bits = (m.mode >> shift) & 0o7;
            let want = access.bits();
            // rwx requested bits must all be present in the applicable triple
            (want & !bits_to_rwx(bits)) == 0
        }

        fn bits_to_rwx(bits: u32) -> u32 {
            let mut rwx = 0;
            if bits & 0o4 != 0 {
                rwx |= Access::READ.bits();
            }
            if bits & 0o2 != 0 {
                rwx |= Access::WRITE.bits();
            }
            if bits & 0o1 != 0 {
                rwx |= Access::EXEC.bits();
            }
            rwx
        }

        fn reference_walk(
            t: &MapMetadata,
            path: &Path,
            caller: Caller,
            access: Access,
        ) -> Result<(), i32> {
            if caller.uid == 0 {
                return Ok(());
            }
            let components: Vec<_> = path.components().collect();
            let mut current = PathBuf::new();
            for (i, c) in components.iter().enumerate() {
                current.push(c);
                if matches!(c, Component::RootDir) && i + 1 != components.len() {
                    continue;
                }
                let m = t.stat(&current).map_err(|_| libc::ENOENT)?;
                if i + 1 == components.len() {
                    if !reference_grants(&m, caller, access) {
                        return Err(libc::EACCES);
                    }
                } else {
                    if !m.is_dir() {
                        return Err(libc::ENOTDIR);
                    }
                    if !reference_grants(&m, caller, Access::EXEC) {
                        return Err(libc::EACCES);
                    }
                }
            }
            Ok(())
        }

        proptest! {
            #[test]
            fn walk_matches_reference_model(
                dir_modes in proptest::collection::vec(0u32..0o777, 3),
                file_mode in 0u32..0o777,
                owner_uid in 0u32..3,
                owner_gid in 0u32..3,
                caller_uid in 0u32..3,
                caller_gid in 0u32..3,
                mask in 0u32..8,
            ) {
                let mut t = MapMetadata::new().dir("/", 0o755, 0, 0);
                let dirs = ["/a", "/a/b", "/a/b/c"];
                for (d, m) in dirs.iter().zip(dir_modes.iter()) {
                    t = t.dir(d, *m, owner_uid, owner_gid);
                }
                t = t.file("/a/b/c/f", file_mode, owner_uid, owner_gid);

                let caller = Caller::new(caller_uid, caller_gid);
                let access = Access::from_bits_truncate(mask);
                let path = Path::new("/a/b/c/f");

                let got = permission_walk(&t, path, caller, access, false)
                    .map_err(|e| e.to_errno());
                let want = reference_walk(&t, path, caller, access);
                prop_assert_eq!(got, want);
            }
        }
    }
}
