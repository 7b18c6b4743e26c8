//! Archive builder
//!
//! Walks a source tree, encodes file contents on a bounded worker pool
//! and writes the archive in path order. The archive is assembled in a
//! temporary file next to the output and renamed into place only after
//! everything succeeded.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::chunk::{stored_size, Chunker, DedupTracker, EncodedFile};
use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::path::VPath;

use super::{encode_header, encode_trailer, ArchiveEntry, ArchiveIndex, BodyLocator, EntryKind, HEADER_LEN};

/// Statistics of a finished build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    /// Regular files packed
    pub files: usize,
    /// Directories recorded
    pub directories: usize,
    /// Sum of original file sizes
    pub original_bytes: u64,
    /// Sum of stored body bytes actually written
    pub stored_bytes: u64,
    /// Files whose body was shared with an earlier identical file
    pub deduplicated: usize,
}

/// A regular file found by the walk
#[derive(Debug)]
struct SourceFile {
    source: PathBuf,
    path: VPath,
    modified: DateTime<Utc>,
}

/// A file after its content was encoded by a worker
struct EncodedSource {
    path: VPath,
    modified: DateTime<Utc>,
    encoded: EncodedFile,
}

/// Builds archives from directory trees
pub struct ArchiveBuilder {
    config: BuildConfig,
}

impl ArchiveBuilder {
    /// Create a builder with the given configuration
    pub fn new(config: BuildConfig) -> Self {
        ArchiveBuilder { config }
    }

    /// Override the worker count
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.config.jobs = jobs;
        self
    }

    /// Enable or disable body deduplication
    pub fn dedup(mut self, dedup: bool) -> Self {
        self.config.dedup = dedup;
        self
    }

    /// Pack `source` into the archive file `output`
    pub fn build(&self, source: &Path, output: &Path) -> Result<BuildSummary> {
        let meta = fs::metadata(source)
            .map_err(|_| Error::NotFound(source.to_string_lossy().to_string()))?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(source.to_string_lossy().to_string()));
        }
        if self.config.jobs == 0 || self.config.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "Build needs at least one job and a non-zero chunk size".to_string(),
            ));
        }

        info!("Scanning {:?}", source);
        let mut files = Vec::new();
        let mut directories = Vec::new();
        walk_source(source, &VPath::root(), &mut files, &mut directories)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            "Found {} files and {} directories, encoding with {} workers",
            files.len(),
            directories.len(),
            self.config.jobs
        );

        let encoded = self.encode_all(&files)?;
        self.write_archive(output, encoded, directories)
    }

    /// Encode every file on a pool of exactly `jobs` threads.
    ///
    /// The first failure stops the remaining work and is returned.
    fn encode_all(&self, files: &[SourceFile]) -> Result<Vec<EncodedSource>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs)
            .thread_name(|i| format!("marfs-encode-{}", i))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to start worker pool: {}", e)))?;

        let chunker = Chunker::new(&self.config);

        pool.install(|| {
            files
                .par_iter()
                .map(|file| {
                    let encoded = File::open(&file.source)
                        .map_err(Error::Io)
                        .and_then(|f| chunker.encode_reader(f))
                        .map_err(|e| Error::BuildFailure(format!("{}: {}", file.path, e)))?;
                    debug!(
                        "{}: {} chunks, {} -> {} bytes",
                        file.path,
                        encoded.chunks.len(),
                        encoded.size,
                        encoded.body.len()
                    );
                    Ok(EncodedSource {
                        path: file.path.clone(),
                        modified: file.modified,
                        encoded,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
    }

    /// Assemble header, bodies, index and trailer, then publish atomically
    fn write_archive(
        &self,
        output: &Path,
        files: Vec<EncodedSource>,
        directories: Vec<ArchiveEntry>,
    ) -> Result<BuildSummary> {
        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = tempfile::Builder::new()
            .prefix(".marfs-")
            .suffix(".tmp")
            .tempfile_in(&parent)?;

        let mut summary = BuildSummary {
            directories: directories.len(),
            ..Default::default()
        };
        let mut entries = directories;
        let mut dedup: DedupTracker<BodyLocator> = DedupTracker::new();

        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            writer.write_all(&encode_header())?;
            let mut offset = HEADER_LEN;

            for file in files {
                let EncodedSource {
                    path,
                    modified,
                    encoded,
                } = file;

                let reused = if self.config.dedup {
                    dedup.lookup(&encoded.content_hash)
                } else {
                    None
                };

                let body = match reused {
                    Some(locator) => {
                        debug!("dedup {}", path);
                        summary.deduplicated += 1;
                        locator
                    }
                    None => {
                        writer.write_all(&encoded.body)?;
                        let locator = BodyLocator {
                            offset,
                            length: stored_size(&encoded.chunks),
                        };
                        offset += locator.length;
                        summary.stored_bytes += locator.length;
                        if self.config.dedup {
                            dedup.register(encoded.content_hash.clone(), locator);
                        }
                        locator
                    }
                };

                summary.files += 1;
                summary.original_bytes += encoded.size;
                entries.push(ArchiveEntry {
                    path,
                    kind: EntryKind::File,
                    size: encoded.size,
                    modified,
                    body,
                    chunks: encoded.chunks,
                    content_hash: encoded.content_hash,
                });
            }

            entries.sort_by(|a, b| a.path.cmp(&b.path));
            let index = ArchiveIndex { entries };
            let raw = bincode::serialize(&index)
                .map_err(|e| Error::BuildFailure(format!("Failed to encode index: {}", e)))?;
            let packed = lz4_flex::compress_prepend_size(&raw);

            writer.write_all(&packed)?;
            writer.write_all(&encode_trailer(offset, packed.len() as u64))?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(output).map_err(|e| Error::Io(e.error))?;

        info!(
            "Wrote {:?}: {} files, {} directories, {} -> {} bytes ({} deduplicated)",
            output,
            summary.files,
            summary.directories,
            summary.original_bytes,
            summary.stored_bytes,
            summary.deduplicated
        );
        Ok(summary)
    }
}

/// Recursively collect regular files and directories below `dir`
fn walk_source(
    dir: &Path,
    prefix: &VPath,
    files: &mut Vec<SourceFile>,
    directories: &mut Vec<ArchiveEntry>,
) -> Result<()> {
    let read_dir = fs::read_dir(dir)
        .map_err(|e| Error::BuildFailure(format!("{:?}: {}", dir, e)))?;

    for entry in read_dir {
        let entry = entry.map_err(|e| Error::BuildFailure(format!("{:?}: {}", dir, e)))?;
        let source = entry.path();
        let name = entry.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| Error::BuildFailure(format!("{:?}: name is not UTF-8", source)))?;
        let path = prefix
            .join(name)
            .map_err(|e| Error::BuildFailure(e.to_string()))?;

        let meta = fs::symlink_metadata(&source)
            .map_err(|e| Error::BuildFailure(format!("{:?}: {}", source, e)))?;
        let modified = DateTime::<Utc>::from(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));

        if meta.is_dir() {
            directories.push(ArchiveEntry::directory(path.clone(), modified));
            walk_source(&source, &path, files, directories)?;
        } else if meta.is_file() {
            files.push(SourceFile {
                source,
                path,
                modified,
            });
        } else {
            warn!("Skipping {:?}: not a regular file or directory", source);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveStore;
    use crate::config::CacheConfig;
    use tempfile::tempdir;

    fn builder(jobs: usize) -> ArchiveBuilder {
        ArchiveBuilder::new(BuildConfig {
            chunk_size: 1024,
            compression_threshold: 16,
            jobs,
            dedup: false,
        })
    }

    fn source_tree(root: &Path) {
        fs::create_dir_all(root.join("b/nested")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("z.txt"), b"last").unwrap();
        fs::write(root.join("a/one.txt"), b"one").unwrap();
        fs::write(root.join("b/nested/big.bin"), vec![9u8; 5000]).unwrap();
        fs::write(root.join("b/empty"), b"").unwrap();
    }

    #[test]
    fn test_build_sorted_entries() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        source_tree(&src);
        let out = dir.path().join("out.mar");

        let summary = builder(3).build(&src, &out).unwrap();
        assert_eq!(summary.files, 4);
        assert_eq!(summary.directories, 3);
        assert_eq!(summary.original_bytes, 5007);

        let store = ArchiveStore::open(&out, &CacheConfig::default()).unwrap();
        let paths: Vec<&str> = store.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["a", "a/one.txt", "b", "b/empty", "b/nested", "b/nested/big.bin", "z.txt"]
        );
    }

    #[test]
    fn test_worker_count_does_not_change_output() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        source_tree(&src);

        let out1 = dir.path().join("one.mar");
        let out4 = dir.path().join("four.mar");
        builder(1).build(&src, &out1).unwrap();
        builder(4).build(&src, &out4).unwrap();

        assert_eq!(fs::read(&out1).unwrap(), fs::read(&out4).unwrap());
    }

    #[test]
    fn test_dedup_shares_bodies() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("x"), vec![1u8; 3000]).unwrap();
        fs::write(src.join("y"), vec![1u8; 3000]).unwrap();
        let out = dir.path().join("out.mar");

        let summary = builder(2).dedup(true).build(&src, &out).unwrap();
        assert_eq!(summary.deduplicated, 1);

        let store = ArchiveStore::open(&out, &CacheConfig::default()).unwrap();
        let x = store.get(&VPath::parse("x").unwrap()).unwrap();
        let y = store.get(&VPath::parse("y").unwrap()).unwrap();
        assert_eq!(x.body, y.body);
        assert_eq!(store.read(y, 0, y.size as usize).unwrap(), vec![1u8; 3000]);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_build_publishes_nothing() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("ok.txt"), b"fine").unwrap();
        let locked = src.join("locked.txt");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read the file anyway; nothing to check in that case.
        if File::open(&locked).is_ok() {
            return;
        }

        let out = dir.path().join("out.mar");
        let result = builder(2).build(&src, &out);
        assert!(matches!(result, Err(Error::BuildFailure(_))));
        assert!(!out.exists());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".marfs-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_source() {
        let dir = tempdir().unwrap();
        let result = builder(1).build(&dir.path().join("nope"), &dir.path().join("o.mar"));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
