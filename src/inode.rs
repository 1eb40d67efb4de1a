//! Inode-number bookkeeping for the filesystem frontend.
//!
//! The kernel addresses files by inode number while the passthrough logic
//! addresses them by path relative to the base directory. This table owns the
//! mapping. The root inode is pinned to `"."` so operations addressed to the
//! filesystem root resolve to the base directory fd itself; every other path
//! is relative with no leading slash.
//!
//! Lookup counts mirror the kernel's: `lookup` (and the entry-producing
//! mutations) increment, `forget` decrements, and an entry is evicted once
//! its count reaches zero. A rename re-roots the moved entry and any cached
//! descendants so stale paths never outlive the directory move that
//! invalidated them.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

/// Inode number of the filesystem root, fixed by the FUSE protocol.
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

struct InodeEntry {
    path: PathBuf,
    nlookup: u64,
}

pub struct InodeTable {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> InodeTable {
        let mut table = InodeTable {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INO + 1,
        };
        table.by_ino.insert(
            ROOT_INO,
            InodeEntry {
                path: PathBuf::from("."),
                nlookup: 0,
            },
        );
        table.by_path.insert(PathBuf::from("."), ROOT_INO);
        table
    }

    /// The base-relative path of `ino`, if the kernel still references it.
    pub fn path_of(&self, ino: u64) -> Option<&Path> {
        self.by_ino.get(&ino).map(|entry| entry.path.as_path())
    }

    /// The path of `name` inside the directory `parent`. The root joins to
    /// the bare name so no path ever starts with `"./"`.
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let parent_path = self.path_of(parent)?;
        if parent_path == Path::new(".") {
            Some(PathBuf::from(name))
        } else {
            Some(parent_path.join(name))
        }
    }

    /// Registers `path` (or finds its existing inode) and counts one kernel
    /// reference against it.
    pub fn register(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(entry) = self.by_ino.get_mut(&ino) {
                entry.nlookup += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.by_ino.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                nlookup: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Drops `nlookup` kernel references; evicts the entry when none remain.
    /// The root is never evicted.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let remove = match self.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.nlookup = entry.nlookup.saturating_sub(nlookup);
                entry.nlookup == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = self.by_ino.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Forgets the mapping for a path that was unlinked. The kernel may still
    /// send a `forget` for the inode later, which is tolerated.
    pub fn unlinked(&mut self, path: &Path) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
        }
    }

    /// Re-roots `old` (and any cached descendants) under `new` after a
    /// successful rename. An overwritten destination entry is dropped first.
    pub fn renamed(&mut self, old: &Path, new: &Path) {
        self.unlinked(new);

        let mut moved: Vec<(u64, PathBuf)> = Vec::new();
        for (path, &ino) in &self.by_path {
            if path == old {
                moved.push((ino, new.to_path_buf()));
            } else if let Ok(suffix) = path.strip_prefix(old) {
                moved.push((ino, new.join(suffix)));
            }
        }
        for (ino, new_path) in moved {
            if let Some(entry) = self.by_ino.get_mut(&ino) {
                self.by_path.remove(&entry.path);
                entry.path = new_path.clone();
                self.by_path.insert(new_path, ino);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_to_dot() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO).unwrap(), Path::new("."));
    }

    #[test]
    fn children_of_root_have_no_leading_dot() {
        let table = InodeTable::new();
        let path = table.child_path(ROOT_INO, OsStr::new("a")).unwrap();
        assert_eq!(path, Path::new("a"));
    }

    #[test]
    fn register_is_stable_and_counted() {
        let mut table = InodeTable::new();
        let ino = table.register(Path::new("a/b"));
        assert_eq!(table.register(Path::new("a/b")), ino);
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_some());
        table.forget(ino, 1);
        assert!(table.path_of(ino).is_none());
    }

    #[test]
    fn forget_never_evicts_root() {
        let mut table = InodeTable::new();
        table.forget(ROOT_INO, u64::MAX);
        assert!(table.path_of(ROOT_INO).is_some());
    }

    #[test]
    fn rename_moves_cached_descendants() {
        let mut table = InodeTable::new();
        let dir = table.register(Path::new("dir"));
        let child = table.register(Path::new("dir/file"));
        table.renamed(Path::new("dir"), Path::new("moved"));
        assert_eq!(table.path_of(dir).unwrap(), Path::new("moved"));
        assert_eq!(table.path_of(child).unwrap(), Path::new("moved/file"));
        assert_eq!(table.register(Path::new("moved/file")), child);
    }

    #[test]
    fn rename_drops_overwritten_destination() {
        let mut table = InodeTable::new();
        let src = table.register(Path::new("src"));
        let dst = table.register(Path::new("dst"));
        table.renamed(Path::new("src"), Path::new("dst"));
        assert_eq!(table.path_of(src).unwrap(), Path::new("dst"));
        assert!(table.path_of(dst).is_none());
    }
}
