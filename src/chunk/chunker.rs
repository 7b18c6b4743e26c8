//! File chunking for archive bodies
//!
//! Splits content into fixed-size chunks, compresses each one when that
//! pays off, and hashes the whole file with BLAKE3 so identical bodies
//! can be detected.

use crate::config::BuildConfig;
use crate::error::{Error, Result};
use blake3::Hasher;
use std::collections::HashMap;
use std::io::Read;

use super::compression::{compress_or_original, decompress};
use super::{ChunkInfo, ChunkMethod};

/// A file's content encoded into its stored form
#[derive(Debug, Clone)]
pub struct EncodedFile {
    /// Chunk descriptors, in content order
    pub chunks: Vec<ChunkInfo>,
    /// Concatenated stored chunk bytes
    pub body: Vec<u8>,
    /// BLAKE3 hash of the original content
    pub content_hash: String,
    /// Original content size
    pub size: u64,
}

/// Chunker for splitting files into fixed-size chunks
pub struct Chunker {
    chunk_size: usize,
    compression_threshold: usize,
}

impl Chunker {
    /// Create a new chunker with the given configuration
    pub fn new(config: &BuildConfig) -> Self {
        Chunker {
            chunk_size: config.chunk_size,
            compression_threshold: config.compression_threshold,
        }
    }

    /// Encode a single chunk of original content
    fn encode_chunk(&self, data: &[u8], body: &mut Vec<u8>) -> ChunkInfo {
        let (stored, compressed) = compress_or_original(data, self.compression_threshold);
        let info = ChunkInfo {
            original_len: data.len() as u32,
            stored_len: stored.len() as u32,
            method: if compressed {
                ChunkMethod::Lz4
            } else {
                ChunkMethod::Passthrough
            },
        };
        body.extend_from_slice(&stored);
        info
    }

    /// Encode a reader's content chunk by chunk
    pub fn encode_reader<R: Read>(&self, mut reader: R) -> Result<EncodedFile> {
        let mut chunks = Vec::new();
        let mut body = Vec::new();
        let mut hasher = Hasher::new();
        let mut size = 0u64;
        let mut buffer = vec![0u8; self.chunk_size];

        loop {
            let mut total_read = 0;

            // Read until buffer is full or EOF
            while total_read < self.chunk_size {
                match reader.read(&mut buffer[total_read..]) {
                    Ok(0) => break,
                    Ok(n) => total_read += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::Io(e)),
                }
            }

            if total_read == 0 {
                break;
            }

            let data = &buffer[..total_read];
            hasher.update(data);
            chunks.push(self.encode_chunk(data, &mut body));
            size += total_read as u64;

            if total_read < self.chunk_size {
                break;
            }
        }

        Ok(EncodedFile {
            chunks,
            body,
            content_hash: hasher.finalize().to_hex().to_string(),
            size,
        })
    }
}

/// Decode one chunk's stored bytes back to its original content
pub fn decode_chunk(info: &ChunkInfo, stored: &[u8]) -> Result<Vec<u8>> {
    if stored.len() != info.stored_len as usize {
        return Err(Error::Corrupt(format!(
            "Chunk has {} stored bytes, expected {}",
            stored.len(),
            info.stored_len
        )));
    }

    match info.method {
        ChunkMethod::Passthrough => {
            if info.stored_len != info.original_len {
                return Err(Error::Corrupt(
                    "Passthrough chunk with mismatched lengths".to_string(),
                ));
            }
            Ok(stored.to_vec())
        }
        ChunkMethod::Lz4 => decompress(stored, info.original_len as usize),
    }
}

/// Deduplication tracker keyed by content hash
pub struct DedupTracker<L> {
    known: HashMap<String, L>,
}

impl<L: Clone> DedupTracker<L> {
    /// Create a new dedup tracker
    pub fn new() -> Self {
        DedupTracker {
            known: HashMap::new(),
        }
    }

    /// Location of an already stored body with this hash
    pub fn lookup(&self, content_hash: &str) -> Option<L> {
        self.known.get(content_hash).cloned()
    }

    /// Register a stored body; the first registration wins
    pub fn register(&mut self, content_hash: String, location: L) {
        self.known.entry(content_hash).or_insert(location);
    }
}

impl<L: Clone> Default for DedupTracker<L> {
    fn default() -> Self {
        Self::new()
    }
}
