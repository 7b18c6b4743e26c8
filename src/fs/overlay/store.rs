//! Overlay store
//!
//! A plain directory tree holding created and copied-up content. Deleted
//! archive paths are recorded as empty marker files named after the path
//! plus [`WHITEOUT_SUFFIX`]. Copy-ups stage their content in a sibling file
//! named after the path plus [`WRITEBACK_SUFFIX`] before renaming it into
//! place. Neither kind of marker is ever surfaced in the merged view.

use crate::error::{Error, Result};
use crate::path::VPath;
use std::fs::{self, File, Metadata};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix marking a whiteout
pub const WHITEOUT_SUFFIX: &str = ".__whiteout__";

/// Suffix marking a copy-up staging file
pub const WRITEBACK_SUFFIX: &str = ".__writeback__";

/// Whether a file name is reserved for overlay bookkeeping
pub fn is_reserved_name(name: &str) -> bool {
    name.ends_with(WHITEOUT_SUFFIX) || name.ends_with(WRITEBACK_SUFFIX)
}

/// What the overlay holds at a path
#[derive(Debug)]
pub enum OverlayNode {
    /// Real file or directory with authoritative content
    Regular(Metadata),
    /// Deletion record for an archive path
    Whiteout,
}

/// Kind of an overlay directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEntryKind {
    File,
    Directory,
    Whiteout,
}

/// Child of an overlay directory, with markers already decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirEntry {
    /// Logical name (suffix stripped for whiteouts)
    pub name: String,
    pub kind: OverlayEntryKind,
}

/// Writable directory layered above the archive
pub struct OverlayStore {
    /// Root path of the overlay
    root: PathBuf,
}

impl OverlayStore {
    /// Open an overlay directory, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(Error::NotADirectory(root.to_string_lossy().to_string()));
        }
        debug!("Opened overlay at {:?}", root);
        Ok(Self { root })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a logical path to its location in the overlay
    pub fn resolve(&self, path: &VPath) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    /// Location of the whiteout marker for a path
    pub fn whiteout_path(&self, path: &VPath) -> PathBuf {
        self.suffixed(path, WHITEOUT_SUFFIX)
    }

    /// Location of the copy-up staging file for a path
    pub fn writeback_path(&self, path: &VPath) -> PathBuf {
        self.suffixed(path, WRITEBACK_SUFFIX)
    }

    fn suffixed(&self, path: &VPath, suffix: &str) -> PathBuf {
        let mut marker = self.resolve(path).into_os_string();
        marker.push(suffix);
        PathBuf::from(marker)
    }

    /// Inspect the overlay at a path. A regular node wins over a stray
    /// whiteout at the same path.
    pub fn node(&self, path: &VPath) -> Result<Option<OverlayNode>> {
        match fs::metadata(self.resolve(path)) {
            Ok(meta) => return Ok(Some(OverlayNode::Regular(meta))),
            Err(e) if is_absent(&e) => {}
            Err(e) => return Err(e.into()),
        }

        if path.is_root() {
            return Ok(None);
        }

        match fs::symlink_metadata(self.whiteout_path(path)) {
            Ok(_) => Ok(Some(OverlayNode::Whiteout)),
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a path as deleted
    pub fn create_whiteout(&self, path: &VPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::InvalidPath(path.to_string()));
        }
        self.ensure_parent_dirs(path)?;
        File::create(self.whiteout_path(path))?;
        debug!("Created whiteout for {}", path);
        Ok(())
    }

    /// Clear the deletion record of a path. Returns whether one existed.
    pub fn remove_whiteout(&self, path: &VPath) -> Result<bool> {
        if path.is_root() {
            return Ok(false);
        }
        match fs::remove_file(self.whiteout_path(path)) {
            Ok(()) => {
                debug!("Removed whiteout for {}", path);
                Ok(true)
            }
            Err(e) if is_absent(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create every overlay directory above a path
    pub fn ensure_parent_dirs(&self, path: &VPath) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(self.resolve(&parent))?;
        }
        Ok(())
    }

    /// List an overlay directory. A missing directory lists as empty.
    pub fn list(&self, dir: &VPath) -> Result<Vec<OverlayDirEntry>> {
        let read_dir = match fs::read_dir(self.resolve(dir)) {
            Ok(rd) => rd,
            Err(e) if is_absent(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                warn!("Skipping non UTF-8 name in overlay directory {}", dir);
                continue;
            };

            if name.ends_with(WRITEBACK_SUFFIX) {
                continue;
            }
            if let Some(original) = name.strip_suffix(WHITEOUT_SUFFIX) {
                if !original.is_empty() {
                    entries.push(OverlayDirEntry {
                        name: original.to_string(),
                        kind: OverlayEntryKind::Whiteout,
                    });
                }
                continue;
            }

            // Follow symlinks so a link to a directory lists as one
            let is_dir = fs::metadata(entry.path())
                .map(|m| m.is_dir())
                .unwrap_or(false);
            entries.push(OverlayDirEntry {
                name,
                kind: if is_dir {
                    OverlayEntryKind::Directory
                } else {
                    OverlayEntryKind::File
                },
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Create a directory (parents included)
    pub fn create_dir(&self, path: &VPath) -> Result<()> {
        fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    /// Remove a regular file
    pub fn remove_file(&self, path: &VPath) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    /// Remove a directory and whatever markers it still holds
    pub fn remove_dir_all(&self, path: &VPath) -> Result<()> {
        fs::remove_dir_all(self.resolve(path))?;
        Ok(())
    }

    /// Move a regular node, replacing a regular file at the destination
    pub fn rename(&self, from: &VPath, to: &VPath) -> Result<()> {
        self.ensure_parent_dirs(to)?;
        fs::rename(self.resolve(from), self.resolve(to))?;
        Ok(())
    }
}

fn is_absent(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vp(s: &str) -> VPath {
        VPath::parse(s).unwrap()
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("a.txt.__whiteout__"));
        assert!(is_reserved_name("a.txt.__writeback__"));
        assert!(!is_reserved_name("a.txt"));
    }

    #[test]
    fn test_whiteout_lifecycle() {
        let dir = tempdir().unwrap();
        let store = OverlayStore::open(dir.path().join("overlay")).unwrap();
        let path = vp("sub/file.txt");

        assert!(store.node(&path).unwrap().is_none());

        store.create_whiteout(&path).unwrap();
        assert!(matches!(store.node(&path).unwrap(), Some(OverlayNode::Whiteout)));
        assert!(matches!(store.node(&path).unwrap(), Some(OverlayNode::Whiteout)));
        assert!(store.root().join("sub/file.txt.__whiteout__").exists());

        assert!(store.remove_whiteout(&path).unwrap());
        assert!(!store.remove_whiteout(&path).unwrap());
        assert!(store.node(&path).unwrap().is_none());
    }

    #[test]
    fn test_regular_node_wins() {
        let dir = tempdir().unwrap();
        let store = OverlayStore::open(dir.path()).unwrap();
        let path = vp("file");

        store.create_whiteout(&path).unwrap();
        fs::write(store.resolve(&path), b"data").unwrap();
        assert!(matches!(store.node(&path).unwrap(), Some(OverlayNode::Regular(_))));
    }

    #[test]
    fn test_list_decodes_markers() {
        let dir = tempdir().unwrap();
        let store = OverlayStore::open(dir.path()).unwrap();

        fs::write(dir.path().join("b.txt"), b"b").unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("gone.__whiteout__"), b"").unwrap();
        fs::write(dir.path().join("b.txt.__writeback__"), b"partial").unwrap();

        let entries = store.list(&VPath::root()).unwrap();
        assert_eq!(
            entries,
            vec![
                OverlayDirEntry {
                    name: "a".to_string(),
                    kind: OverlayEntryKind::Directory
                },
                OverlayDirEntry {
                    name: "b.txt".to_string(),
                    kind: OverlayEntryKind::File
                },
                OverlayDirEntry {
                    name: "gone".to_string(),
                    kind: OverlayEntryKind::Whiteout
                },
            ]
        );
        assert!(store.list(&vp("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_node_below_file_is_absent() {
        let dir = tempdir().unwrap();
        let store = OverlayStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("file"), b"x").unwrap();
        assert!(store.node(&vp("file/child")).unwrap().is_none());
    }

    #[test]
    fn test_rename_creates_parents() {
        let dir = tempdir().unwrap();
        let store = OverlayStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("src"), b"x").unwrap();

        store.rename(&vp("src"), &vp("deep/dst")).unwrap();
        assert_eq!(fs::read(dir.path().join("deep/dst")).unwrap(), b"x");
    }
}
