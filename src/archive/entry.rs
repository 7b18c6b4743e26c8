//! Archive index entries
//!
//! Each file and directory of the packed tree is represented by an
//! entry keyed by its relative path.

use crate::chunk::ChunkInfo;
use crate::path::VPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// Location of an entry's stored body inside the archive file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyLocator {
    /// Absolute offset of the first stored byte
    pub offset: u64,
    /// Stored length in bytes
    pub length: u64,
}

impl BodyLocator {
    /// Exclusive end offset, `None` on overflow
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// A single archived file or directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Relative path, unique within the archive
    pub path: VPath,
    /// File or directory
    pub kind: EntryKind,
    /// Original content size (0 for directories)
    pub size: u64,
    /// Source modification time
    pub modified: DateTime<Utc>,
    /// Stored body location
    pub body: BodyLocator,
    /// Chunks partitioning the body, in content order
    pub chunks: Vec<ChunkInfo>,
    /// BLAKE3 hash of the original content (empty for directories)
    pub content_hash: String,
}

impl ArchiveEntry {
    /// Create a directory entry
    pub fn directory(path: VPath, modified: DateTime<Utc>) -> Self {
        ArchiveEntry {
            path,
            kind: EntryKind::Directory,
            size: 0,
            modified,
            body: BodyLocator::default(),
            chunks: Vec::new(),
            content_hash: String::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Modification time as `SystemTime`
    pub fn mtime(&self) -> SystemTime {
        SystemTime::from(self.modified)
    }
}

/// Serialized index section of an archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveIndex {
    /// Entries sorted by path
    pub entries: Vec<ArchiveEntry>,
}
