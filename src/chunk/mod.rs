//! Chunk management module
//!
//! Handles splitting file content into fixed-size chunks, compression,
//! and locating the chunks that cover a byte range.

mod chunker;
mod compression;

pub use chunker::{decode_chunk, Chunker, DedupTracker, EncodedFile};
pub use compression::{compress, compress_or_original, decompress};

use serde::{Deserialize, Serialize};

/// How a chunk body is stored
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkMethod {
    /// Stored as-is
    Passthrough,
    /// LZ4 block with the original size prepended
    Lz4,
}

/// Descriptor of one chunk of a file body
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Length of the chunk's original content
    pub original_len: u32,
    /// Length of the stored (possibly compressed) bytes
    pub stored_len: u32,
    /// Storage method
    pub method: ChunkMethod,
}

/// Where a chunk sits within the file and within its stored body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPosition {
    /// Index into the chunk list
    pub index: usize,
    /// Offset of the chunk's first byte in the original content
    pub original_start: u64,
    /// Offset of the chunk's stored bytes within the body
    pub stored_start: u64,
}

/// Find the chunk containing a given offset of the original content
pub fn chunk_at_offset(chunks: &[ChunkInfo], offset: u64) -> Option<ChunkPosition> {
    let mut original_start = 0u64;
    let mut stored_start = 0u64;
    for (index, chunk) in chunks.iter().enumerate() {
        let end = original_start + chunk.original_len as u64;
        if offset >= original_start && offset < end {
            return Some(ChunkPosition {
                index,
                original_start,
                stored_start,
            });
        }
        original_start = end;
        stored_start += chunk.stored_len as u64;
    }
    None
}

/// Total original size described by a chunk list
pub fn original_size(chunks: &[ChunkInfo]) -> u64 {
    chunks.iter().map(|c| c.original_len as u64).sum()
}

/// Total stored size described by a chunk list
pub fn stored_size(chunks: &[ChunkInfo]) -> u64 {
    chunks.iter().map(|c| c.stored_len as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(original_len: u32, stored_len: u32) -> ChunkInfo {
        ChunkInfo {
            original_len,
            stored_len,
            method: ChunkMethod::Lz4,
        }
    }

    #[test]
    fn test_chunk_at_offset() {
        let chunks = vec![chunk(100, 40), chunk(100, 60), chunk(50, 50)];

        let first = chunk_at_offset(&chunks, 0).unwrap();
        assert_eq!(first.index, 0);

        let second = chunk_at_offset(&chunks, 150).unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.original_start, 100);
        assert_eq!(second.stored_start, 40);

        let last = chunk_at_offset(&chunks, 249).unwrap();
        assert_eq!(last.index, 2);
        assert_eq!(last.stored_start, 100);

        assert!(chunk_at_offset(&chunks, 250).is_none());
    }

    #[test]
    fn test_sizes() {
        let chunks = vec![chunk(100, 40), chunk(20, 20)];
        assert_eq!(original_size(&chunks), 120);
        assert_eq!(stored_size(&chunks), 60);
        assert_eq!(original_size(&[]), 0);
    }
}
