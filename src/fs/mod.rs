//! FUSE filesystem implementation
//!
//! Serves an archive, optionally layered under a writable overlay
//! directory, through the kernel's FUSE interface.

pub mod overlay;

pub use overlay::{MarFs, OpenFlags, OverlayEngine, OverlayStore};
