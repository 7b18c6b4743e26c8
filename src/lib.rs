//! marfs - Immutable archives mounted with a writable overlay
//!
//! This library builds single-file archives of a directory tree and serves
//! them through FUSE, layering a plain directory on top for edits, with
//! copy-up on first write and whiteouts for deletions.

pub mod archive;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod error;
pub mod fs;
pub mod path;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::archive::{ArchiveBuilder, ArchiveEntry, ArchiveStore};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{OpenFlags, OverlayEngine, OverlayStore};
    pub use crate::path::VPath;
}
