//! Overlay file handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::archive::ArchiveEntry;
use crate::error::{Error, Result};
use crate::path::VPath;

/// What an open handle reads from and writes to
pub enum HandleTarget {
    /// Untouched archive file, read-only
    Archive(ArchiveEntry),
    /// File in the overlay
    Overlay {
        file: File,
        /// Writes land at the current end of file
        append: bool,
    },
}

/// Open file handle
pub struct FileHandle {
    /// Handle ID given to the caller
    pub fh: u64,
    /// Path at time of open
    pub path: VPath,
    /// Backing layer
    pub target: HandleTarget,
    /// Opened for writing (any copy-up already happened at open)
    pub write_intent: bool,
    /// Has the file been written through this handle?
    dirty: AtomicBool,
}

impl FileHandle {
    pub fn new(fh: u64, path: VPath, target: HandleTarget, write_intent: bool) -> Self {
        Self {
            fh,
            path,
            target,
            write_intent,
            dirty: AtomicBool::new(false),
        }
    }

    /// Overlay file behind this handle, if any
    pub fn overlay_file(&self) -> Option<&File> {
        match &self.target {
            HandleTarget::Overlay { file, .. } => Some(file),
            HandleTarget::Archive(_) => None,
        }
    }

    /// Check if dirty (modified)
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Mark as dirty
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clear the dirty flag after a sync
    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

/// Manages open file handles
pub struct HandleManager {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
}

impl HandleManager {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new handle and return its ID
    pub fn open(&self, path: VPath, target: HandleTarget, write_intent: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = FileHandle::new(fh, path, target, write_intent);
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    /// Get handle by ID
    pub fn get(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(Error::InvalidHandle(fh))
    }

    /// Close handle and return it
    pub fn close(&self, fh: u64) -> Result<Arc<FileHandle>> {
        self.handles
            .write()
            .remove(&fh)
            .ok_or(Error::InvalidHandle(fh))
    }

    /// Number of open handles
    pub fn open_count(&self) -> usize {
        self.handles.read().len()
    }

}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_open_get_close() {
        let manager = HandleManager::new();
        let entry = ArchiveEntry::directory(VPath::parse("d").unwrap(), Utc::now());

        let a = manager.open(VPath::parse("d").unwrap(), HandleTarget::Archive(entry.clone()), false);
        let b = manager.open(VPath::parse("d").unwrap(), HandleTarget::Archive(entry), false);
        assert_ne!(a, b);
        assert_eq!(manager.open_count(), 2);

        let handle = manager.get(a).unwrap();
        assert!(matches!(handle.target, HandleTarget::Archive(_)));
        assert!(handle.overlay_file().is_none());
        assert!(!handle.is_dirty());
        handle.mark_dirty();
        assert!(manager.get(a).unwrap().is_dirty());

        manager.close(a).unwrap();
        assert!(matches!(manager.get(a), Err(Error::InvalidHandle(_))));
        assert!(matches!(manager.close(a), Err(Error::InvalidHandle(_))));
        assert_eq!(manager.open_count(), 1);
    }
}
