//! The passthrough operation set.
//!
//! [`ConvFs`] ties the other modules together: every operation takes a
//! caller-side path plus the caller's identity, resolves the path to its
//! storage-side counterpart, replays the kernel's permission decision for
//! the caller, and only then issues the native call. Results that carry
//! names (directory entries, symlink targets) are transcoded back to the
//! caller charset on the way out.
//!
//! Operations that create entries run with the driver's privilege, so when
//! the driver is root the new entry is handed over to the caller afterwards,
//! mirroring what the kernel would have done had the caller created it
//! directly.

use crate::error::{FsError, FsResult, errno_to_fs};
use crate::fdtable::FdTable;
use crate::perm::{
    Access, Caller, EntryMeta, MetadataSource, NativeMetadata, ROOT_UID, permission_walk,
    permission_walk_parent,
};
use crate::resolver::{MountConfig, PathResolver};
use filetime::FileTime;
use nix::sys::stat::{FileStat, Mode, SFlag};
use nix::sys::statvfs::Statvfs;
use nix::unistd::{Gid, Uid};
use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};

/// One directory entry as presented to the caller.
#[derive(Debug)]
pub struct DirEntry {
    /// Entry name, already transcoded to the caller charset.
    pub name: OsString,
    /// File type, when the underlying filesystem reports one cheaply.
    pub kind: Option<std::fs::FileType>,
}

/// The filename-transcoding passthrough filesystem core.
#[derive(Debug)]
pub struct ConvFs {
    resolver: PathResolver,
    meta: NativeMetadata,
    fds: FdTable,
    /// Effective uid of the driver process, captured once at startup.
    euid: u32,
}

impl ConvFs {
    /// Builds the core from a validated mount configuration.
    pub fn new(config: MountConfig) -> Self {
        Self {
            resolver: PathResolver::new(config),
            meta: NativeMetadata,
            fds: FdTable::new(),
            euid: nix::unistd::geteuid().as_raw(),
        }
    }

    /// The path resolver, shared with the dispatch layer for name
    /// transcoding.
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    fn walk(&self, spath: &Path, caller: Caller, access: Access) -> FsResult<()> {
        permission_walk(&self.meta, spath, caller, access, false)
    }

    fn walk_link(&self, spath: &Path, caller: Caller, access: Access) -> FsResult<()> {
        permission_walk(&self.meta, spath, caller, access, true)
    }

    fn walk_parent(&self, spath: &Path, caller: Caller, access: Access) -> FsResult<()> {
        permission_walk_parent(&self.meta, spath, caller, access)
    }

    fn stat_entry(&self, spath: &Path) -> FsResult<EntryMeta> {
        Ok(self.meta.stat(spath)?)
    }

    /// Owner-or-root gate used by chmod, setxattr and friends.
    fn owner_check(&self, spath: &Path, caller: Caller) -> FsResult<()> {
        let m = self.stat_entry(spath)?;
        if caller.uid != m.uid && !caller.is_root() {
            return Err(FsError::NotPermitted {
                path: spath.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Hands a freshly created entry over to the caller when the driver
    /// runs as root. Failure here is logged, not surfaced; the entry
    /// itself was created successfully.
    fn give_to_caller(&self, spath: &Path, caller: Caller, follow: bool) {
        if self.euid != ROOT_UID {
            return;
        }
        let res = if follow {
            nix::unistd::chown(
                spath,
                Some(Uid::from_raw(caller.uid)),
                Some(Gid::from_raw(caller.gid)),
            )
            .map_err(errno_to_fs)
        } else {
            lchown(spath, caller.uid, caller.gid)
        };
        if let Err(e) = res {
            warn!(path = %spath.display(), error = %e, "chown of new entry failed");
        }
    }

    // ------------------------------------------------------------------
    // metadata

    /// Stats an entry without following a final symlink. Requires
    /// traversal permission on the parent.
    pub fn getattr(&self, path: &OsStr, caller: Caller) -> FsResult<FileStat> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::EXEC)?;
        nix::sys::stat::lstat(&spath).map_err(errno_to_fs)
    }

    /// Reads a symlink target and transcodes it to the caller charset.
    /// Requires read permission on the link itself.
    pub fn readlink(&self, path: &OsStr, caller: Caller) -> FsResult<OsString> {
        let spath = self.resolver.to_storage(path);
        self.walk_link(&spath, caller, Access::READ)?;
        let target = std::fs::read_link(&spath)?;
        Ok(self.resolver.to_caller(target.as_os_str()))
    }

    /// Changes mode bits. Owner or root only.
    pub fn chmod(&self, path: &OsStr, mode: u32, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.owner_check(&spath, caller)?;
        let perms = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(&spath, perms)?;
        Ok(())
    }

    /// Changes ownership. Root only; everyone else gets EPERM.
    pub fn chown(
        &self,
        path: &OsStr,
        uid: Option<u32>,
        gid: Option<u32>,
        caller: Caller,
    ) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        if !caller.is_root() {
            return Err(FsError::NotPermitted { path: spath });
        }
        nix::unistd::chown(&spath, uid.map(Uid::from_raw), gid.map(Gid::from_raw))
            .map_err(errno_to_fs)
    }

    /// Truncates a file to `length`. Requires write permission on the file.
    pub fn truncate(&self, path: &OsStr, length: i64, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.walk(&spath, caller, Access::WRITE)?;
        nix::unistd::truncate(&spath, length).map_err(errno_to_fs)
    }

    /// Sets access and modification times.
    ///
    /// With explicit times the caller must own the entry (or be root); a
    /// touch-to-now (both times absent) only needs write permission,
    /// matching utime(2).
    pub fn utimens(
        &self,
        path: &OsStr,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        caller: Caller,
    ) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        match (atime, mtime) {
            (None, None) => {
                self.walk(&spath, caller, Access::WRITE)?;
                let now = FileTime::now();
                filetime::set_file_times(&spath, now, now)?;
            }
            (Some(a), Some(m)) => {
                self.owner_check(&spath, caller)?;
                filetime::set_file_times(
                    &spath,
                    FileTime::from_system_time(a),
                    FileTime::from_system_time(m),
                )?;
            }
            (Some(a), None) => {
                self.owner_check(&spath, caller)?;
                filetime::set_file_atime(&spath, FileTime::from_system_time(a))?;
            }
            (None, Some(m)) => {
                self.owner_check(&spath, caller)?;
                filetime::set_file_mtime(&spath, FileTime::from_system_time(m))?;
            }
        }
        Ok(())
    }

    /// Answers access(2) for the caller. An empty mask (F_OK) still walks
    /// the path, so existence and traversal are verified.
    pub fn access(&self, path: &OsStr, mask: i32, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        let mut access = Access::empty();
        if mask & libc::R_OK != 0 {
            access |= Access::READ;
        }
        if mask & libc::W_OK != 0 {
            access |= Access::WRITE;
        }
        if mask & libc::X_OK != 0 {
            access |= Access::EXEC;
        }
        self.walk(&spath, caller, access)
    }

    /// Filesystem statistics for the tree the entry lives on.
    pub fn statfs(&self, path: &OsStr, caller: Caller) -> FsResult<Statvfs> {
        let spath = self.resolver.to_storage(path);
        self.walk(&spath, caller, Access::empty())?;
        nix::sys::statvfs::statvfs(&spath).map_err(errno_to_fs)
    }

    // ------------------------------------------------------------------
    // directories

    /// Checks that the caller may list `path`. The actual enumeration
    /// happens in [`readdir`](Self::readdir).
    pub fn opendir(&self, path: &OsStr, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.walk(&spath, caller, Access::READ)
    }

    /// Enumerates a directory, transcoding every name to the caller
    /// charset. Authorization happened at opendir time.
    pub fn readdir(&self, path: &OsStr) -> FsResult<Vec<DirEntry>> {
        let spath = self.resolver.to_storage(path);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&spath)? {
            let entry = entry?;
            out.push(DirEntry {
                name: self.resolver.to_caller(&entry.file_name()),
                kind: entry.file_type().ok(),
            });
        }
        Ok(out)
    }

    /// Creates a directory. Requires write and traversal permission on the
    /// parent.
    pub fn mkdir(&self, path: &OsStr, mode: u32, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::WRITE | Access::EXEC)?;
        nix::unistd::mkdir(&spath, Mode::from_bits_truncate(mode)).map_err(errno_to_fs)?;
        self.give_to_caller(&spath, caller, true);
        Ok(())
    }

    /// Removes an empty directory. Requires write and traversal permission
    /// on the parent.
    pub fn rmdir(&self, path: &OsStr, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::WRITE | Access::EXEC)?;
        std::fs::remove_dir(&spath)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // entry creation and removal

    /// Creates a filesystem node (regular file, device, fifo or socket).
    /// Requires write and traversal permission on the parent.
    pub fn mknod(&self, path: &OsStr, mode: u32, rdev: u64, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::WRITE | Access::EXEC)?;
        nix::sys::stat::mknod(
            &spath,
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            rdev as libc::dev_t,
        )
        .map_err(errno_to_fs)?;
        self.give_to_caller(&spath, caller, true);
        Ok(())
    }

    /// Removes a file. Requires write and traversal permission on the
    /// parent.
    pub fn unlink(&self, path: &OsStr, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::WRITE | Access::EXEC)?;
        std::fs::remove_file(&spath)?;
        Ok(())
    }

    /// Creates a symlink at `newpath` pointing to `target`.
    ///
    /// The target is an opaque caller-encoded name, transcoded to the
    /// storage charset but never prefixed with the source root; relative
    /// targets stay relative.
    pub fn symlink(&self, target: &OsStr, newpath: &OsStr, caller: Caller) -> FsResult<()> {
        let snew = self.resolver.to_storage(newpath);
        self.walk_parent(&snew, caller, Access::WRITE | Access::EXEC)?;
        let starget = self.resolver.fragment_to_storage(target);
        std::os::unix::fs::symlink(&starget, &snew)?;
        self.give_to_caller(&snew, caller, false);
        Ok(())
    }

    /// Renames an entry. Both parents need write and traversal permission;
    /// a directory being moved additionally needs write permission on
    /// itself, because its `..` entry is rewritten (see rename(2)).
    pub fn rename(&self, from: &OsStr, to: &OsStr, caller: Caller) -> FsResult<()> {
        let sfrom = self.resolver.to_storage(from);
        let sto = self.resolver.to_storage(to);
        self.walk_parent(&sto, caller, Access::WRITE | Access::EXEC)?;
        self.walk_parent(&sfrom, caller, Access::WRITE | Access::EXEC)?;
        if self.stat_entry(&sfrom)?.is_dir() {
            self.walk(&sfrom, caller, Access::WRITE)?;
        }
        std::fs::rename(&sfrom, &sto)?;
        Ok(())
    }

    /// Creates a hard link. Both parents need write and traversal
    /// permission.
    pub fn link(&self, from: &OsStr, to: &OsStr, caller: Caller) -> FsResult<()> {
        let sfrom = self.resolver.to_storage(from);
        let sto = self.resolver.to_storage(to);
        self.walk_parent(&sto, caller, Access::WRITE | Access::EXEC)?;
        self.walk_parent(&sfrom, caller, Access::WRITE | Access::EXEC)?;
        std::fs::hard_link(&sfrom, &sto)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // file I/O

    /// Opens a file, multiplexing concurrent opens of the same caller path
    /// onto one native descriptor. The walk checks the permission matching
    /// the requested access mode.
    pub fn open(&self, path: &OsStr, flags: i32, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        let access = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => Access::WRITE,
            libc::O_RDWR => Access::READ | Access::WRITE,
            _ => Access::READ,
        };
        self.walk(&spath, caller, access)?;
        debug!(path = %spath.display(), flags, "open");
        self.fds
            .acquire(Path::new(path), flags, || open_native(&spath, flags))
    }

    /// Reads up to `size` bytes at `offset` from the descriptor opened for
    /// this caller path. A short result means end of file.
    pub fn read(&self, path: &OsStr, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.fds
            .with_file(Path::new(path), |f| read_at_full(f, offset, size as usize))?
            .map_err(FsError::from)
    }

    /// Writes `data` at `offset` through the descriptor opened for this
    /// caller path.
    pub fn write(&self, path: &OsStr, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.fds
            .with_file(Path::new(path), |f| f.write_all_at(data, offset))?
            .map_err(FsError::from)?;
        Ok(data.len() as u32)
    }

    /// Drops one reference to the descriptor for this caller path, closing
    /// it when no opens remain.
    pub fn release(&self, path: &OsStr) -> FsResult<()> {
        self.fds.release(Path::new(path))
    }

    // ------------------------------------------------------------------
    // extended attributes

    /// Lists extended attribute names (raw NUL-separated form). Requires
    /// traversal permission on the parent.
    pub fn listxattr(&self, path: &OsStr, caller: Caller) -> FsResult<Vec<u8>> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::EXEC)?;
        let c = cpath(&spath)?;
        xattr_fetch(|buf, len| unsafe { libc::llistxattr(c.as_ptr(), buf.cast(), len) })
    }

    /// Reads one extended attribute. Requires traversal permission on the
    /// parent.
    pub fn getxattr(&self, path: &OsStr, name: &OsStr, caller: Caller) -> FsResult<Vec<u8>> {
        let spath = self.resolver.to_storage(path);
        self.walk_parent(&spath, caller, Access::EXEC)?;
        let c = cpath(&spath)?;
        let cname = cname(name)?;
        xattr_fetch(|buf, len| unsafe {
            libc::lgetxattr(c.as_ptr(), cname.as_ptr(), buf.cast(), len)
        })
    }

    /// Sets an extended attribute. Owner or root only.
    pub fn setxattr(
        &self,
        path: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        caller: Caller,
    ) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.owner_check(&spath, caller)?;
        let c = cpath(&spath)?;
        let cname = cname(name)?;
        let rc = unsafe {
            libc::lsetxattr(
                c.as_ptr(),
                cname.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Removes an extended attribute. Owner or root only.
    pub fn removexattr(&self, path: &OsStr, name: &OsStr, caller: Caller) -> FsResult<()> {
        let spath = self.resolver.to_storage(path);
        self.owner_check(&spath, caller)?;
        let c = cpath(&spath)?;
        let cname = cname(name)?;
        let rc = unsafe { libc::lremovexattr(c.as_ptr(), cname.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// Opens a native file with the caller's flags mapped onto `OpenOptions`.
/// O_APPEND is stripped: all writes go through pwrite, which an append-mode
/// descriptor would silently redirect to end of file.
fn open_native(spath: &Path, flags: i32) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    opts.custom_flags(flags & !(libc::O_ACCMODE | libc::O_APPEND));
    opts.open(spath)
}

/// Reads until the buffer is full or end of file.
fn read_at_full(f: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < buf.len() {
        match f.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Two-phase xattr read: probe for the size, then fetch. Retries when the
/// attribute grows between the two calls.
fn xattr_fetch(fetch: impl Fn(*mut u8, usize) -> isize) -> FsResult<Vec<u8>> {
    loop {
        let size = fetch(std::ptr::null_mut(), 0);
        if size < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut buf = vec![0u8; size as usize];
        let n = fetch(buf.as_mut_ptr(), buf.len());
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }
        let e = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ERANGE) {
            return Err(e.into());
        }
    }
}

fn cpath(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))
}

fn cname(name: &OsStr) -> FsResult<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| FsError::Io(io::Error::from_raw_os_error(libc::EINVAL)))
}

fn lchown(path: &Path, uid: u32, gid: u32) -> FsResult<()> {
    let c = cpath(path)?;
    let rc = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_native_maps_accmode() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"xy").unwrap();

        let f = open_native(&p, libc::O_RDONLY).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 2);

        let f = open_native(&p, libc::O_WRONLY).unwrap();
        f.write_all_at(b"ab", 0).unwrap();

        let f = open_native(&p, libc::O_RDWR).unwrap();
        assert_eq!(f.read_at(&mut buf, 0).unwrap(), 2);
        assert_eq!(&buf, b"ab");
    }

    #[test]
    fn test_open_native_strips_append() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"0123456789").unwrap();

        let f = open_native(&p, libc::O_WRONLY | libc::O_APPEND).unwrap();
        f.write_all_at(b"XX", 2).unwrap();
        assert_eq!(std::fs::read(&p).unwrap(), b"01XX456789");
    }

    #[test]
    fn test_read_at_full_stops_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, b"hello").unwrap();
        let f = File::open(&p).unwrap();

        assert_eq!(read_at_full(&f, 0, 64).unwrap(), b"hello");
        assert_eq!(read_at_full(&f, 3, 64).unwrap(), b"lo");
        assert!(read_at_full(&f, 10, 64).unwrap().is_empty());
    }
}
