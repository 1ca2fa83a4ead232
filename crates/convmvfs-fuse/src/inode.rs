//! Inode number bookkeeping for the kernel protocol.
//!
//! The core is path-based, but the kernel speaks in inode numbers. This
//! table hands out a stable inode per caller-visible path, tracks the
//! kernel's lookup count, and evicts a mapping once every lookup reference
//! has been forgotten. Renames remap the moved entry and everything below
//! it so open inodes keep resolving.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Inode of the mount root, fixed by the kernel protocol.
pub const ROOT_INODE: u64 = 1;

#[derive(Debug)]
struct InodeEntry {
    path: PathBuf,
    nlookup: u64,
}

/// Bidirectional inode ↔ caller-path table.
#[derive(Debug)]
pub struct InodeTable {
    by_ino: DashMap<u64, InodeEntry>,
    by_path: DashMap<PathBuf, u64>,
    next: AtomicU64,
}

impl InodeTable {
    /// Creates a table with the root path pre-seeded at inode 1.
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_ino.insert(
            ROOT_INODE,
            InodeEntry {
                path: PathBuf::from("/"),
                nlookup: 1,
            },
        );
        table.by_path.insert(PathBuf::from("/"), ROOT_INODE);
        table
    }

    /// Returns the inode for `path`, allocating one if needed, and counts
    /// one kernel lookup reference against it.
    pub fn acquire(&self, path: &Path) -> u64 {
        let ino = self.assign(path);
        if let Some(mut entry) = self.by_ino.get_mut(&ino) {
            entry.nlookup += 1;
        }
        ino
    }

    /// Returns the inode for `path`, allocating one if needed, without
    /// touching the lookup count. Used for readdir entries, which the
    /// kernel does not count as lookups.
    pub fn assign(&self, path: &Path) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        match self.by_path.entry(path.to_path_buf()) {
            dashmap::mapref::entry::Entry::Occupied(e) => *e.get(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let ino = self.next.fetch_add(1, Ordering::Relaxed);
                self.by_ino.insert(
                    ino,
                    InodeEntry {
                        path: path.to_path_buf(),
                        nlookup: 0,
                    },
                );
                v.insert(ino);
                ino
            }
        }
    }

    /// The caller path currently mapped to `ino`.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).map(|e| e.path.clone())
    }

    /// The inode currently mapped to `path`, if any.
    pub fn ino_of(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).map(|e| *e)
    }

    /// Releases `nlookup` kernel references; the mapping is dropped when
    /// none remain. The root inode is never evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let evict = match self.by_ino.get_mut(&ino) {
            Some(mut entry) => {
                entry.nlookup = entry.nlookup.saturating_sub(nlookup);
                entry.nlookup == 0
            }
            None => false,
        };
        if evict
            && let Some((_, entry)) = self.by_ino.remove(&ino)
        {
            self.by_path.remove(&entry.path);
        }
    }

    /// Rewrites the mapping for a renamed entry and every descendant.
    pub fn rename(&self, from: &Path, to: &Path) {
        let affected: Vec<u64> = self
            .by_ino
            .iter()
            .filter(|e| e.path.starts_with(from))
            .map(|e| *e.key())
            .collect();
        for ino in affected {
            if let Some(mut entry) = self.by_ino.get_mut(&ino) {
                let old = std::mem::take(&mut entry.path);
                let new = match old.strip_prefix(from) {
                    Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                    Ok(rest) => to.join(rest),
                    Err(_) => old.clone(),
                };
                self.by_path.remove(&old);
                self.by_path.insert(new.clone(), ino);
                entry.path = new;
            }
        }
    }

    /// Drops the path-keyed mapping for a removed entry, so a recreated
    /// entry with the same name gets a fresh inode. The inode itself lives
    /// on until the kernel forgets it.
    pub fn unlink(&self, path: &Path) {
        self.by_path.remove(path);
    }

    /// Number of live inode mappings.
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    /// True when only the root mapping remains.
    pub fn is_empty(&self) -> bool {
        self.by_ino.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preseeded() {
        let t = InodeTable::new();
        assert_eq!(t.path_of(ROOT_INODE).unwrap(), Path::new("/"));
        assert_eq!(t.ino_of(Path::new("/")).unwrap(), ROOT_INODE);
    }

    #[test]
    fn test_acquire_is_stable_per_path() {
        let t = InodeTable::new();
        let a = t.acquire(Path::new("/x"));
        let b = t.acquire(Path::new("/x"));
        let c = t.acquire(Path::new("/y"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a > ROOT_INODE);
    }

    #[test]
    fn test_forget_evicts_at_zero() {
        let t = InodeTable::new();
        let ino = t.acquire(Path::new("/x"));
        t.acquire(Path::new("/x"));

        t.forget(ino, 1);
        assert!(t.path_of(ino).is_some());
        t.forget(ino, 1);
        assert!(t.path_of(ino).is_none());
        assert!(t.ino_of(Path::new("/x")).is_none());
    }

    #[test]
    fn test_forget_never_evicts_root() {
        let t = InodeTable::new();
        t.forget(ROOT_INODE, u64::MAX);
        assert!(t.path_of(ROOT_INODE).is_some());
    }

    #[test]
    fn test_assign_does_not_count_lookups() {
        let t = InodeTable::new();
        let ino = t.assign(Path::new("/x"));
        // A single forget is enough to evict once one real lookup lands
        assert_eq!(t.acquire(Path::new("/x")), ino);
        t.forget(ino, 1);
        assert!(t.path_of(ino).is_none());
    }

    #[test]
    fn test_rename_remaps_subtree() {
        let t = InodeTable::new();
        let d = t.acquire(Path::new("/a"));
        let f = t.acquire(Path::new("/a/f"));
        let deep = t.acquire(Path::new("/a/b/c"));
        let other = t.acquire(Path::new("/ab"));

        t.rename(Path::new("/a"), Path::new("/z"));

        assert_eq!(t.path_of(d).unwrap(), Path::new("/z"));
        assert_eq!(t.path_of(f).unwrap(), Path::new("/z/f"));
        assert_eq!(t.path_of(deep).unwrap(), Path::new("/z/b/c"));
        // Sibling with a common name prefix is untouched
        assert_eq!(t.path_of(other).unwrap(), Path::new("/ab"));
        assert_eq!(t.ino_of(Path::new("/z/f")).unwrap(), f);
        assert!(t.ino_of(Path::new("/a/f")).is_none());
    }

    #[test]
    fn test_concurrent_acquires_allocate_unique_inodes() {
        use std::collections::HashSet;
        use std::sync::Arc;
        use std::thread;

        let t = Arc::new(InodeTable::new());
        let mut handles = vec![];
        for i in 0..8 {
            let t = Arc::clone(&t);
            handles.push(thread::spawn(move || {
                (0..50)
                    .map(|j| t.acquire(&PathBuf::from(format!("/t{i}/f{j}"))))
                    .collect::<Vec<u64>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for ino in h.join().unwrap() {
                assert!(seen.insert(ino), "inode {ino} handed out twice");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn test_unlink_frees_the_name() {
        let t = InodeTable::new();
        let ino = t.acquire(Path::new("/x"));
        t.unlink(Path::new("/x"));
        // A recreated entry gets a fresh inode
        let fresh = t.acquire(Path::new("/x"));
        assert_ne!(ino, fresh);
        // The stale inode still resolves until the kernel forgets it
        assert_eq!(t.path_of(ino).unwrap(), Path::new("/x"));
    }
}
