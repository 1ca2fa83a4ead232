//! The `fuser::Filesystem` implementation.
//!
//! This layer is deliberately thin: it translates between the kernel's
//! inode-based protocol and the path-based core, attaches the real
//! caller's identity from the request context, and maps core errors to
//! errno replies. All permission and transcoding logic lives in the core.

use crate::inode::{InodeTable, ROOT_INODE};
use convmvfs_core::{Caller, ConvFs, FsResult, MountConfig};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use nix::sys::stat::FileStat;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// How long the kernel may cache attributes and lookups. The source tree
/// can change underneath the mount, so keep this short.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Inode-to-path dispatch over the transcoding core.
pub struct ConvMvFs {
    core: ConvFs,
    inodes: InodeTable,
}

impl ConvMvFs {
    /// Builds the filesystem from a validated mount configuration.
    pub fn new(config: MountConfig) -> Self {
        Self {
            core: ConvFs::new(config),
            inodes: InodeTable::new(),
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        Some(self.inodes.path_of(parent)?.join(name))
    }

    /// Stats a freshly looked-up or created path and replies with its
    /// entry, registering one kernel lookup reference.
    fn reply_entry_for(&self, path: &std::path::Path, caller: Caller, reply: ReplyEntry) {
        match self.core.getattr(path.as_os_str(), caller) {
            Ok(st) => {
                let ino = self.inodes.acquire(path);
                reply.entry(&ATTR_TTL, &attr_from_stat(ino, &st), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn reply_empty(result: FsResult<()>, reply: ReplyEmpty) {
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Answers the size-probe/fetch protocol shared by getxattr and
    /// listxattr.
    fn reply_xattr(data: FsResult<Vec<u8>>, size: u32, reply: ReplyXattr) {
        match data {
            Ok(data) => {
                if size == 0 {
                    reply.size(data.len() as u32);
                } else if data.len() <= size as usize {
                    reply.data(&data);
                } else {
                    reply.error(libc::ERANGE);
                }
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

fn caller_of(req: &Request<'_>) -> Caller {
    Caller::new(req.uid(), req.gid())
}

fn kind_of(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Converts a native stat to the kernel's attribute form, substituting the
/// mount-side inode for the storage-side one.
fn attr_from_stat(ino: u64, st: &FileStat) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: kind_of(st.st_mode as u32),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn std_kind(kind: Option<std::fs::FileType>) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    let Some(k) = kind else {
        return FileType::RegularFile;
    };
    if k.is_dir() {
        FileType::Directory
    } else if k.is_symlink() {
        FileType::Symlink
    } else if k.is_char_device() {
        FileType::CharDevice
    } else if k.is_block_device() {
        FileType::BlockDevice
    } else if k.is_fifo() {
        FileType::NamedPipe
    } else if k.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn to_system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for ConvMvFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, ?name, "lookup");
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.reply_entry_for(&path, caller_of(req), reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(ino, "getattr");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.getattr(path.as_os_str(), caller_of(req)) {
            Ok(st) => reply.attr(&ATTR_TTL, &attr_from_stat(ino, &st)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(ino, ?mode, ?uid, ?gid, ?size, "setattr");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let caller = caller_of(req);
        let p = path.as_os_str();

        let result = (|| {
            if let Some(mode) = mode {
                self.core.chmod(p, mode, caller)?;
            }
            if uid.is_some() || gid.is_some() {
                self.core.chown(p, uid, gid, caller)?;
            }
            if let Some(size) = size {
                self.core.truncate(p, size as i64, caller)?;
            }
            match (atime, mtime) {
                (None, None) => {}
                (Some(TimeOrNow::Now), Some(TimeOrNow::Now)) => {
                    // Plain touch: write permission suffices
                    self.core.utimens(p, None, None, caller)?;
                }
                (atime, mtime) => {
                    self.core.utimens(
                        p,
                        atime.map(to_system_time),
                        mtime.map(to_system_time),
                        caller,
                    )?;
                }
            }
            self.core.getattr(p, caller)
        })();

        match result {
            Ok(st) => reply.attr(&ATTR_TTL, &attr_from_stat(ino, &st)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        trace!(ino, "readlink");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.readlink(path.as_os_str(), caller_of(req)) {
            Ok(target) => reply.data(target.as_encoded_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mknod");
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let caller = caller_of(req);
        let mode = mode & !(umask & 0o777);
        if let Err(e) = self
            .core
            .mknod(path.as_os_str(), mode, u64::from(rdev), caller)
        {
            reply.error(e.to_errno());
            return;
        }
        self.reply_entry_for(&path, caller, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?name, mode, "mkdir");
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let caller = caller_of(req);
        let mode = mode & !(umask & 0o777);
        if let Err(e) = self.core.mkdir(path.as_os_str(), mode, caller) {
            reply.error(e.to_errno());
            return;
        }
        self.reply_entry_for(&path, caller, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "unlink");
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.unlink(path.as_os_str(), caller_of(req)) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, ?name, "rmdir");
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.rmdir(path.as_os_str(), caller_of(req)) {
            Ok(()) => {
                self.inodes.unlink(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        trace!(parent, ?link_name, ?target, "symlink");
        let Some(path) = self.child_path(parent, link_name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let caller = caller_of(req);
        if let Err(e) = self
            .core
            .symlink(target.as_os_str(), path.as_os_str(), caller)
        {
            reply.error(e.to_errno());
            return;
        }
        self.reply_entry_for(&path, caller, reply);
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        trace!(parent, ?name, newparent, ?newname, "rename");
        if flags != 0 {
            // RENAME_EXCHANGE and friends are not supported
            reply.error(libc::EINVAL);
            return;
        }
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self
            .core
            .rename(from.as_os_str(), to.as_os_str(), caller_of(req))
        {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        trace!(ino, newparent, ?newname, "link");
        let (Some(from), Some(to)) = (self.inodes.path_of(ino), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let caller = caller_of(req);
        if let Err(e) = self.core.link(from.as_os_str(), to.as_os_str(), caller) {
            reply.error(e.to_errno());
            return;
        }
        self.reply_entry_for(&to, caller, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        trace!(ino, flags, "open");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.open(path.as_os_str(), flags, caller_of(req)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(ino, offset, size, "read");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.core.read(path.as_os_str(), offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(ino, offset, len = data.len(), "write");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.core.write(path.as_os_str(), offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!(ino, "release");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        Self::reply_empty(self.core.release(path.as_os_str()), reply);
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        trace!(ino, "opendir");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.opendir(path.as_os_str(), caller_of(req)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(ino, offset, "readdir");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let parent_ino = path
            .parent()
            .and_then(|p| self.inodes.ino_of(p))
            .unwrap_or(ROOT_INODE);

        let children = match self.core.readdir(path.as_os_str()) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".into()));
        entries.push((parent_ino, FileType::Directory, "..".into()));
        for child in children {
            let child_ino = self.inodes.assign(&path.join(&child.name));
            entries.push((child_ino, std_kind(child.kind), child.name));
        }

        for (i, (entry_ino, kind, name)) in
            entries.into_iter().enumerate().skip(offset as usize)
        {
            // Offset of the entry after this one, so the kernel resumes there
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!(ino, "releasedir");
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        trace!(ino, "statfs");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.core.statfs(path.as_os_str(), caller_of(req)) {
            Ok(sv) => reply.statfs(
                sv.blocks(),
                sv.blocks_free(),
                sv.blocks_available(),
                sv.files(),
                sv.files_free(),
                sv.block_size() as u32,
                sv.name_max() as u32,
                sv.fragment_size() as u32,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        trace!(ino, ?name, "setxattr");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        Self::reply_empty(
            self.core
                .setxattr(path.as_os_str(), name, value, flags, caller_of(req)),
            reply,
        );
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        trace!(ino, ?name, size, "getxattr");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        Self::reply_xattr(
            self.core.getxattr(path.as_os_str(), name, caller_of(req)),
            size,
            reply,
        );
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        trace!(ino, size, "listxattr");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        Self::reply_xattr(
            self.core.listxattr(path.as_os_str(), caller_of(req)),
            size,
            reply,
        );
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(ino, ?name, "removexattr");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        Self::reply_empty(
            self.core
                .removexattr(path.as_os_str(), name, caller_of(req)),
            reply,
        );
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        trace!(ino, mask, "access");
        let Some(path) = self.inodes.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        Self::reply_empty(
            self.core.access(path.as_os_str(), mask, caller_of(req)),
            reply,
        );
    }
}
