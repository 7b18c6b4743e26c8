//! Archive reader
//!
//! Opens an archive, validates its index up front and serves byte ranges
//! of file entries by decoding only the chunks that overlap the range.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::cache::{CacheStats, ChunkCache};
use crate::chunk::{chunk_at_offset, decode_chunk, original_size, stored_size, ChunkMethod};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::path::VPath;

use super::rewrite::PathRewrite;
use super::{
    ArchiveEntry, ArchiveIndex, EntryKind, FORMAT_VERSION, HEADER_LEN, HEADER_MAGIC, TRAILER_LEN,
    TRAILER_MAGIC,
};

/// Read-only view of an archive file
pub struct ArchiveStore {
    /// Archive location
    path: PathBuf,
    /// Open archive file, read positionally
    file: File,
    /// Synthesized root directory
    root: ArchiveEntry,
    /// Entries sorted by path, including synthesized parent directories
    entries: Vec<ArchiveEntry>,
    /// Path -> index into `entries`
    by_path: HashMap<VPath, usize>,
    /// Directory -> child name -> index into `entries`
    children: HashMap<VPath, BTreeMap<String, usize>>,
    /// Decoded chunk cache
    cache: ChunkCache,
}

impl ArchiveStore {
    /// Open and validate an archive
    pub fn open(path: &Path, cache: &CacheConfig) -> Result<Self> {
        Self::open_rewritten(path, cache, &PathRewrite::default())
    }

    /// Open and validate an archive, presenting its paths through `rewrite`
    pub fn open_rewritten(path: &Path, cache: &CacheConfig, rewrite: &PathRewrite) -> Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        let file_len = meta.len();
        let archive_mtime = DateTime::<Utc>::from(meta.modified()?);

        if file_len < HEADER_LEN + TRAILER_LEN {
            return Err(Error::Corrupt(format!(
                "{:?} is too short to be an archive",
                path
            )));
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)?;
        if &header[..4] != HEADER_MAGIC {
            return Err(Error::Corrupt("Invalid header magic".to_string()));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "Unsupported format version {}",
                version
            )));
        }

        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact_at(&mut trailer, file_len - TRAILER_LEN)?;
        if &trailer[16..] != TRAILER_MAGIC {
            return Err(Error::Corrupt("Invalid trailer magic".to_string()));
        }
        let index_offset = u64::from_le_bytes(read_u64(&trailer[..8]));
        let index_len = u64::from_le_bytes(read_u64(&trailer[8..16]));

        if index_offset < HEADER_LEN
            || index_offset.checked_add(index_len) != Some(file_len - TRAILER_LEN)
        {
            return Err(Error::Corrupt(
                "Index section is out of range".to_string(),
            ));
        }

        let mut packed = vec![0u8; index_len as usize];
        file.read_exact_at(&mut packed, index_offset)?;
        let raw = lz4_flex::decompress_size_prepended(&packed)
            .map_err(|e| Error::Corrupt(format!("Index decompression failed: {}", e)))?;
        let index: ArchiveIndex = bincode::deserialize(&raw)
            .map_err(|e| Error::Corrupt(format!("Index decoding failed: {}", e)))?;

        let mut store = ArchiveStore {
            path: path.to_path_buf(),
            file,
            root: ArchiveEntry::directory(VPath::root(), archive_mtime),
            entries: Vec::new(),
            by_path: HashMap::new(),
            children: HashMap::new(),
            cache: ChunkCache::new(cache),
        };
        store.load_index(index, index_offset, archive_mtime, rewrite)?;

        info!(
            "Opened archive {:?} ({} entries)",
            store.path,
            store.entries.len()
        );
        Ok(store)
    }

    /// Validate entries, apply the path rewrite and build the lookup tables
    fn load_index(
        &mut self,
        index: ArchiveIndex,
        data_end: u64,
        archive_mtime: DateTime<Utc>,
        rewrite: &PathRewrite,
    ) -> Result<()> {
        let mut stored: BTreeMap<VPath, ArchiveEntry> = BTreeMap::new();
        for entry in index.entries {
            validate_entry(&entry, data_end)?;
            if stored.contains_key(&entry.path) {
                return Err(Error::Corrupt(format!("Duplicate entry {}", entry.path)));
            }
            stored.insert(entry.path.clone(), entry);
        }

        // Conflicts introduced by rewriting are a mount error, not damage
        let conflict = |msg: String| {
            if rewrite.is_identity() {
                Error::Corrupt(msg)
            } else {
                Error::InvalidConfig(msg)
            }
        };

        let mut by_path: BTreeMap<VPath, ArchiveEntry> = BTreeMap::new();
        for (original, mut entry) in stored {
            let Some(mapped) = rewrite.apply(&original) else {
                debug!("Leaving {} out of the mounted view", original);
                continue;
            };
            if by_path.contains_key(&mapped) {
                return Err(conflict(format!(
                    "{} is mapped to {} more than once",
                    original, mapped
                )));
            }
            entry.path = mapped.clone();
            by_path.insert(mapped, entry);
        }

        // Parents the index does not list become implicit directories
        let mut implicit = Vec::new();
        for path in by_path.keys() {
            for ancestor in path.ancestors() {
                match by_path.get(&ancestor) {
                    Some(parent) if parent.is_dir() => {}
                    Some(_) => return Err(conflict(format!("{} is nested under a file", path))),
                    None => implicit.push(ancestor),
                }
            }
        }
        for path in implicit {
            debug!("Synthesizing directory {}", path);
            by_path
                .entry(path.clone())
                .or_insert_with(|| ArchiveEntry::directory(path, archive_mtime));
        }

        self.entries = by_path.into_values().collect();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.by_path.insert(entry.path.clone(), idx);
            let parent = entry.path.parent().unwrap_or_default();
            let name = entry.path.file_name().unwrap_or_default().to_string();
            self.children.entry(parent).or_default().insert(name, idx);
        }
        Ok(())
    }

    /// Archive location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All entries, sorted by path
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Look up an entry by path. The root resolves to a synthesized directory.
    pub fn get(&self, path: &VPath) -> Option<&ArchiveEntry> {
        if path.is_root() {
            return Some(&self.root);
        }
        self.by_path.get(path).map(|&idx| &self.entries[idx])
    }

    /// Whether `path` is a directory in the archive
    pub fn is_dir(&self, path: &VPath) -> bool {
        path.is_root() || self.get(path).map(|e| e.is_dir()).unwrap_or(false)
    }

    /// Direct children of a directory, sorted by name
    pub fn children(&self, dir: &VPath) -> Vec<&ArchiveEntry> {
        self.children
            .get(dir)
            .map(|names| names.values().map(|&idx| &self.entries[idx]).collect())
            .unwrap_or_default()
    }

    /// Read up to `size` bytes of a file entry starting at `offset`
    pub fn read(&self, entry: &ArchiveEntry, offset: u64, size: usize) -> Result<Vec<u8>> {
        if entry.kind != EntryKind::File {
            return Err(Error::IsADirectory(entry.path.to_string()));
        }
        if offset >= entry.size || size == 0 {
            return Ok(Vec::new());
        }

        let end = entry.size.min(offset.saturating_add(size as u64));
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut cursor = offset;

        while cursor < end {
            let pos = chunk_at_offset(&entry.chunks, cursor).ok_or_else(|| {
                Error::Corrupt(format!("{}: no chunk covers offset {}", entry.path, cursor))
            })?;
            let info = &entry.chunks[pos.index];
            let chunk_end = pos.original_start + info.original_len as u64;
            let take_end = chunk_end.min(end);
            let within = (cursor - pos.original_start) as usize;
            let take = (take_end - cursor) as usize;

            if info.method == ChunkMethod::Passthrough {
                let mut buf = vec![0u8; take];
                self.file.read_exact_at(
                    &mut buf,
                    entry.body.offset + pos.stored_start + within as u64,
                )?;
                out.extend_from_slice(&buf);
            } else {
                let decoded = self.load_chunk(entry, pos.index, pos.stored_start)?;
                out.extend_from_slice(&decoded[within..within + take]);
            }

            cursor = take_end;
        }

        Ok(out)
    }

    /// Streaming reader over a file entry
    pub fn reader<'a>(&'a self, entry: &'a ArchiveEntry) -> EntryReader<'a> {
        EntryReader {
            store: self,
            entry,
            position: 0,
        }
    }

    /// Decode every chunk of a file entry and compare its content hash
    pub fn verify(&self, entry: &ArchiveEntry) -> Result<bool> {
        if !entry.is_file() {
            return Ok(true);
        }
        let mut hasher = blake3::Hasher::new();
        let mut reader = self.reader(entry);
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string() == entry.content_hash)
    }

    /// Decoded chunk cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fetch a decoded chunk, going through the cache
    fn load_chunk(&self, entry: &ArchiveEntry, index: usize, stored_start: u64) -> Result<Arc<Vec<u8>>> {
        let key = (entry.body.offset, index as u32);
        if let Some(data) = self.cache.get(&key) {
            return Ok(data);
        }

        let info = &entry.chunks[index];
        let mut stored = vec![0u8; info.stored_len as usize];
        self.file
            .read_exact_at(&mut stored, entry.body.offset + stored_start)?;
        let decoded = Arc::new(decode_chunk(info, &stored)?);
        self.cache.insert(key, decoded.clone());
        Ok(decoded)
    }
}

/// `Read` adapter over one archived file
pub struct EntryReader<'a> {
    store: &'a ArchiveStore,
    entry: &'a ArchiveEntry,
    position: u64,
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self
            .store
            .read(self.entry, self.position, buf.len())
            .map_err(|e| match e {
                Error::Io(io) => io,
                other => std::io::Error::new(std::io::ErrorKind::InvalidData, other.to_string()),
            })?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }
}

fn read_u64(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

/// Reject entries whose metadata is inconsistent or points outside the body section
fn validate_entry(entry: &ArchiveEntry, data_end: u64) -> Result<()> {
    if entry.path.is_root() {
        return Err(Error::Corrupt("Entry with an empty path".to_string()));
    }

    match entry.kind {
        EntryKind::Directory => {
            if entry.size != 0 || !entry.chunks.is_empty() {
                return Err(Error::Corrupt(format!("Directory {} has content", entry.path)));
            }
        }
        EntryKind::File => {
            if original_size(&entry.chunks) != entry.size {
                return Err(Error::Corrupt(format!(
                    "{}: chunk sizes do not add up to {}",
                    entry.path, entry.size
                )));
            }
            if stored_size(&entry.chunks) != entry.body.length {
                return Err(Error::Corrupt(format!(
                    "{}: stored chunk sizes do not match the body",
                    entry.path
                )));
            }
            for chunk in &entry.chunks {
                let consistent = match chunk.method {
                    // Served straight from the body, so both sizes must agree
                    ChunkMethod::Passthrough => chunk.stored_len == chunk.original_len,
                    ChunkMethod::Lz4 => chunk.stored_len > 0,
                };
                if chunk.original_len == 0 || !consistent {
                    return Err(Error::Corrupt(format!(
                        "{}: inconsistent chunk {:?}",
                        entry.path, chunk
                    )));
                }
            }
            let in_range = entry.body.length == 0
                || (entry.body.offset >= HEADER_LEN
                    && entry.body.end().map(|end| end <= data_end).unwrap_or(false));
            if !in_range {
                return Err(Error::Corrupt(format!(
                    "{}: body is out of range",
                    entry.path
                )));
            }
        }
    }
    Ok(())
}
