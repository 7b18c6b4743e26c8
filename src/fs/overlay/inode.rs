//! Inode table for the mount adapter
//!
//! The engine addresses nodes by path; the kernel addresses them by inode
//! number. The table hands out stable numbers per path and re-keys them
//! when paths move.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::path::VPath;

use super::engine::NodeAttr;
use super::resolver::NodeKind;

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

impl NodeKind {
    pub fn to_fuser_type(self) -> fuser::FileType {
        match self {
            NodeKind::File => fuser::FileType::RegularFile,
            NodeKind::Directory => fuser::FileType::Directory,
        }
    }
}

/// Convert engine attributes to fuser FileAttr
pub fn to_fuser_attr(ino: u64, attr: &NodeAttr, uid: u32, gid: u32) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.mtime,
        kind: attr.kind.to_fuser_type(),
        perm: attr.perm,
        nlink: attr.nlink,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

#[derive(Default)]
struct Maps {
    /// ino -> path
    paths: HashMap<u64, VPath>,
    /// path -> ino
    inos: HashMap<VPath, u64>,
}

/// Manages inode allocation and the ino <-> path mapping
pub struct InodeTable {
    /// Next inode number
    next_ino: AtomicU64,
    maps: RwLock<Maps>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            maps: RwLock::new(Maps::default()),
        };
        {
            let mut maps = table.maps.write();
            maps.paths.insert(ROOT_INO, VPath::root());
            maps.inos.insert(VPath::root(), ROOT_INO);
        }
        table
    }

    /// Path of an inode
    pub fn path(&self, ino: u64) -> Option<VPath> {
        self.maps.read().paths.get(&ino).cloned()
    }

    /// Inode of a path, allocating one on first sight
    pub fn ino_for(&self, path: &VPath) -> u64 {
        if let Some(&ino) = self.maps.read().inos.get(path) {
            return ino;
        }

        let mut maps = self.maps.write();
        if let Some(&ino) = maps.inos.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        maps.paths.insert(ino, path.clone());
        maps.inos.insert(path.clone(), ino);
        ino
    }

    /// Drop the mapping of a removed path
    pub fn remove_path(&self, path: &VPath) {
        let mut maps = self.maps.write();
        if let Some(ino) = maps.inos.remove(path) {
            maps.paths.remove(&ino);
        }
    }

    /// Drop an inode the kernel no longer references
    pub fn forget(&self, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut maps = self.maps.write();
        if let Some(path) = maps.paths.remove(&ino) {
            maps.inos.remove(&path);
        }
    }

    /// Re-key `from` and everything below it to live under `to`. Whatever
    /// was mapped at or below `to` is dropped first.
    pub fn rename(&self, from: &VPath, to: &VPath) {
        let mut maps = self.maps.write();

        let replaced: Vec<VPath> = maps
            .inos
            .keys()
            .filter(|p| p.starts_with(to))
            .cloned()
            .collect();
        for path in replaced {
            if let Some(ino) = maps.inos.remove(&path) {
                maps.paths.remove(&ino);
            }
        }

        let moved: Vec<(VPath, u64)> = maps
            .inos
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old, ino) in moved {
            if let Some(new) = old.rebase(from, to) {
                maps.inos.remove(&old);
                maps.inos.insert(new.clone(), ino);
                maps.paths.insert(ino, new);
            }
        }
    }

    /// Number of mapped inodes
    pub fn mapped(&self) -> usize {
        self.maps.read().paths.len()
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

    fn vp(s: &str) -> VPath {
        VPath::parse(s).unwrap()
    }

    #[test]
    fn test_root_and_allocation() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(VPath::root()));

        let a = table.ino_for(&vp("a"));
        assert_ne!(a, ROOT_INO);
        assert_eq!(table.ino_for(&vp("a")), a);
        assert_eq!(table.path(a), Some(vp("a")));

        table.forget(a);
        assert!(table.path(a).is_none());
        table.forget(ROOT_INO);
        assert_eq!(table.path(ROOT_INO), Some(VPath::root()));
    }

    #[test]
    fn test_rename_rekeys_subtree() {
        let table = InodeTable::new();
        let dir = table.ino_for(&vp("old"));
        let child = table.ino_for(&vp("old/file"));
        let other = table.ino_for(&vp("older"));
        let victim = table.ino_for(&vp("new"));

        table.rename(&vp("old"), &vp("new"));

        assert_eq!(table.path(dir), Some(vp("new")));
        assert_eq!(table.path(child), Some(vp("new/file")));
        assert_eq!(table.path(other), Some(vp("older")));
        assert!(table.path(victim).is_none());
        assert_eq!(table.ino_for(&vp("new/file")), child);
    }

    #[test]
    fn test_remove_path() {
        let table = InodeTable::new();
        let ino = table.ino_for(&vp("gone"));
        table.remove_path(&vp("gone"));
        assert!(table.path(ino).is_none());
        assert_eq!(table.mapped(), 1);
    }
}
