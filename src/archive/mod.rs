//! Archive format
//!
//! A single immutable file holding a packed directory tree:
//!
//! ```text
//! header  : "MARA" | u16 version | u16 reserved
//! bodies  : stored chunk bytes of every file, in path order
//! index   : LZ4 (size-prepended) block of a bincode ArchiveIndex
//! trailer : u64 index offset | u64 index length | "MARI"
//! ```
//!
//! All integers are little-endian.

mod builder;
mod entry;
mod reader;
mod rewrite;

pub use builder::{ArchiveBuilder, BuildSummary};
pub use entry::{ArchiveEntry, ArchiveIndex, BodyLocator, EntryKind};
pub use reader::{ArchiveStore, EntryReader};
pub use rewrite::{GlobPattern, PathRewrite};

/// Magic at the start of every archive
pub const HEADER_MAGIC: &[u8; 4] = b"MARA";

/// Magic closing the trailer
pub const TRAILER_MAGIC: &[u8; 4] = b"MARI";

/// Current format version
pub const FORMAT_VERSION: u16 = 1;

/// Header length in bytes
pub const HEADER_LEN: u64 = 8;

/// Trailer length in bytes
pub const TRAILER_LEN: u64 = 20;

/// Encode the fixed header
pub(crate) fn encode_header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(HEADER_MAGIC);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header
}

/// Encode the trailer pointing at the index section
pub(crate) fn encode_trailer(index_offset: u64, index_len: u64) -> [u8; TRAILER_LEN as usize] {
    let mut trailer = [0u8; TRAILER_LEN as usize];
    trailer[..8].copy_from_slice(&index_offset.to_le_bytes());
    trailer[8..16].copy_from_slice(&index_len.to_le_bytes());
    trailer[16..].copy_from_slice(TRAILER_MAGIC);
    trailer
}
