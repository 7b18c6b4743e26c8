//! Overlay filesystem module for marfs
//!
//! Provides the merged view where:
//! - Lower layer: the immutable archive
//! - Upper layer: a plain overlay directory holding edits and whiteouts
//! - Result: merged view with copy-up on first write

mod engine;
mod filesystem;
mod handle;
mod inode;
mod resolver;
mod store;

pub use engine::{DirEntry, FsStats, Layer, NodeAttr, OpenFlags, OverlayEngine};
pub use filesystem::MarFs;
pub use handle::{FileHandle, HandleManager, HandleTarget};
pub use inode::{to_fuser_attr, InodeTable, ROOT_INO};
pub use resolver::{list_dir, resolve, NodeKind, Resolved};
pub use store::{
    is_reserved_name, OverlayDirEntry, OverlayEntryKind, OverlayNode, OverlayStore,
    WHITEOUT_SUFFIX, WRITEBACK_SUFFIX,
};
