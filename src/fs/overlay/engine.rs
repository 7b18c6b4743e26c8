//! Overlay engine
//!
//! Serves POSIX-style operations against the merged view of an archive and
//! an optional overlay directory. Reads of untouched archive files go
//! straight to the archive. Any write intent on such a file first copies
//! its content up into the overlay; deletions of archive paths leave
//! whiteouts behind.
//!
//! Every sequence of {resolve, copy-up or whiteout, mutate} runs under one
//! engine-wide mutex. Reads never take it.

use parking_lot::Mutex;
use std::fs::{self, File, FileTimes, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveEntry, ArchiveStore};
use crate::error::{Error, Result};
use crate::path::VPath;

use super::handle::{HandleManager, HandleTarget};
use super::resolver::{self, NodeKind, Resolved};
use super::store::{is_reserved_name, OverlayNode, OverlayStore};

/// Access requested when opening a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            truncate: false,
        }
    }

    pub fn truncate() -> Self {
        Self {
            write: true,
            append: false,
            truncate: true,
        }
    }

    /// Decode `open(2)` flags
    pub fn from_libc(flags: i32) -> Self {
        let accmode = flags & libc::O_ACCMODE;
        Self {
            write: accmode == libc::O_WRONLY || accmode == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }

    /// Whether opening with these flags may modify the file
    pub fn write_intent(&self) -> bool {
        self.write || self.append || self.truncate
    }
}

/// Layer that serves a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Archive,
    Overlay,
}

/// Attributes of a merged-view node
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub layer: Layer,
}

impl NodeAttr {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    fn from_entry(entry: &ArchiveEntry, writable: bool) -> Self {
        let mtime = entry.mtime();
        let (kind, perm, nlink) = match (entry.is_dir(), writable) {
            (true, true) => (NodeKind::Directory, 0o755, 2),
            (true, false) => (NodeKind::Directory, 0o555, 2),
            (false, true) => (NodeKind::File, 0o644, 1),
            (false, false) => (NodeKind::File, 0o444, 1),
        };
        Self {
            kind,
            size: entry.size,
            blocks: entry.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            perm,
            nlink,
            layer: Layer::Archive,
        }
    }

    fn from_metadata(meta: &Metadata) -> Self {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let ctime = SystemTime::UNIX_EPOCH
            + Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().clamp(0, 999_999_999) as u32);
        Self {
            kind: if meta.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            },
            size: meta.len(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(mtime),
            mtime,
            ctime,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            layer: Layer::Overlay,
        }
    }
}

/// One merged directory child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Filesystem usage figures reported to the host
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Merged view of an archive and an optional writable overlay
pub struct OverlayEngine {
    /// Immutable lower layer
    archive: Arc<ArchiveStore>,
    /// Writable upper layer; `None` mounts read-only
    overlay: Option<OverlayStore>,
    /// Subtrees refusing writes
    readonly_prefixes: Vec<VPath>,
    /// Serializes every state transition
    mutation: Mutex<()>,
    /// Open file handles
    handles: HandleManager,
}

impl OverlayEngine {
    pub fn new(archive: Arc<ArchiveStore>, overlay: Option<OverlayStore>) -> Self {
        Self {
            archive,
            overlay,
            readonly_prefixes: Vec::new(),
            mutation: Mutex::new(()),
            handles: HandleManager::new(),
        }
    }

    /// Refuse writes below the given paths
    pub fn with_readonly_prefixes(mut self, prefixes: Vec<VPath>) -> Self {
        self.readonly_prefixes = prefixes;
        self
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    /// Whether the mount has no writable layer
    pub fn is_read_only(&self) -> bool {
        self.overlay.is_none()
    }

    /// Number of open file handles
    pub fn open_handles(&self) -> usize {
        self.handles.open_count()
    }

    /// Resolve a path in the merged view
    pub fn resolve(&self, path: &VPath) -> Result<Resolved<'_>> {
        resolver::resolve(&self.archive, self.overlay.as_ref(), path)
    }

    /// Attributes of a visible path
    pub fn getattr(&self, path: &VPath) -> Result<NodeAttr> {
        match self.resolve(path)? {
            Resolved::Absent => Err(Error::NotFound(path.to_string())),
            Resolved::ArchiveOnly(entry) => Ok(NodeAttr::from_entry(entry, !self.is_read_only())),
            Resolved::OverlayOnly(meta) | Resolved::OverlayOverArchive(meta, _) => {
                Ok(NodeAttr::from_metadata(&meta))
            }
        }
    }

    /// Merged children of a directory, sorted by name
    pub fn readdir(&self, path: &VPath) -> Result<Vec<DirEntry>> {
        let resolved = self.resolve(path)?;
        if !resolved.is_visible() {
            return Err(Error::NotFound(path.to_string()));
        }
        if !resolved.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }

        let children = resolver::list_dir(&self.archive, self.overlay.as_ref(), path, &resolved)?;
        Ok(children
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// Open a file. Write intent on an untouched archive file copies it up
    /// first; `truncate` skips copying its content.
    pub fn open(&self, path: &VPath, flags: OpenFlags) -> Result<u64> {
        debug!("open({}, {:?})", path, flags);

        if !flags.write_intent() {
            let target = match self.resolve(path)? {
                Resolved::Absent => return Err(Error::NotFound(path.to_string())),
                r if r.is_dir() => return Err(Error::IsADirectory(path.to_string())),
                Resolved::ArchiveOnly(entry) => HandleTarget::Archive(entry.clone()),
                Resolved::OverlayOnly(_) | Resolved::OverlayOverArchive(..) => {
                    let file = File::open(self.overlay_store(path)?.resolve(path))?;
                    HandleTarget::Overlay {
                        file,
                        append: false,
                    }
                }
            };
            return Ok(self.handles.open(path.clone(), target, false));
        }

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        let file = match self.resolve(path)? {
            Resolved::Absent => return Err(Error::NotFound(path.to_string())),
            r if r.is_dir() => return Err(Error::IsADirectory(path.to_string())),
            Resolved::ArchiveOnly(entry) => {
                self.copy_up(overlay, entry, !flags.truncate)?;
                open_rw(&overlay.resolve(path))?
            }
            Resolved::OverlayOnly(_) | Resolved::OverlayOverArchive(..) => {
                let file = open_rw(&overlay.resolve(path))?;
                if flags.truncate {
                    file.set_len(0)?;
                }
                file
            }
        };

        Ok(self.handles.open(
            path.clone(),
            HandleTarget::Overlay {
                file,
                append: flags.append,
            },
            true,
        ))
    }

    /// Create a file and open it for writing. Without `exclusive` an
    /// existing file is truncated; a whiteout at the path is cleared.
    pub fn create(&self, path: &VPath, flags: OpenFlags, exclusive: bool) -> Result<u64> {
        debug!("create({}, exclusive={})", path, exclusive);

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        let resolved = self.resolve(path)?;
        if resolved.is_visible() {
            if exclusive {
                return Err(Error::AlreadyExists(path.to_string()));
            }
            if resolved.is_dir() {
                return Err(Error::IsADirectory(path.to_string()));
            }
        }

        let file = match resolved {
            Resolved::ArchiveOnly(entry) => {
                self.copy_up(overlay, entry, false)?;
                open_rw(&overlay.resolve(path))?
            }
            Resolved::OverlayOnly(_) | Resolved::OverlayOverArchive(..) => {
                let file = open_rw(&overlay.resolve(path))?;
                file.set_len(0)?;
                file
            }
            Resolved::Absent => {
                self.require_parent_dir(path)?;
                overlay.ensure_parent_dirs(path)?;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(overlay.resolve(path))?;
                if overlay.remove_whiteout(path)? {
                    info!("Recreated {} over its whiteout", path);
                }
                file
            }
        };

        Ok(self.handles.open(
            path.clone(),
            HandleTarget::Overlay {
                file,
                append: flags.append,
            },
            true,
        ))
    }

    /// Read up to `size` bytes at `offset`
    pub fn read(&self, fh: u64, offset: u64, size: usize) -> Result<Vec<u8>> {
        let handle = self.handles.get(fh)?;
        match &handle.target {
            HandleTarget::Archive(entry) => self.archive.read(entry, offset, size),
            HandleTarget::Overlay { file, .. } => read_file_at(file, offset, size),
        }
    }

    /// Write `data` at `offset` (at end of file for append handles)
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handles.get(fh)?;
        if !handle.write_intent {
            return Err(Error::InvalidHandle(fh));
        }
        let HandleTarget::Overlay { file, append } = &handle.target else {
            return Err(Error::InvalidHandle(fh));
        };

        if *append {
            let _guard = self.mutation.lock();
            let end = file.metadata()?.len();
            file.write_all_at(data, end)?;
        } else {
            file.write_all_at(data, offset)?;
        }

        handle.mark_dirty();
        Ok(data.len())
    }

    /// Sync a dirty overlay handle. Archive handles have nothing to flush.
    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handles.get(fh)?;
        if let Some(file) = handle.overlay_file() {
            if handle.is_dirty() {
                file.sync_all()?;
                handle.mark_clean();
            }
        }
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.handles.get(fh)?;
        if let Some(file) = handle.overlay_file() {
            if datasync {
                file.sync_data()?;
            } else {
                file.sync_all()?;
            }
            handle.mark_clean();
        }
        Ok(())
    }

    /// Close a handle
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.close(fh)?;
        if handle.is_dirty() {
            debug!("Released dirty handle {} for {}", fh, handle.path);
        }
        Ok(())
    }

    /// Resize a file. A writable handle is resized directly; otherwise the
    /// path is resolved and an untouched archive file is copied up first.
    pub fn truncate(&self, path: &VPath, size: u64, fh: Option<u64>) -> Result<()> {
        debug!("truncate({}, {})", path, size);

        if let Some(fh) = fh {
            if let Ok(handle) = self.handles.get(fh) {
                if let (true, Some(file)) = (handle.write_intent, handle.overlay_file()) {
                    file.set_len(size)?;
                    handle.mark_dirty();
                    return Ok(());
                }
            }
        }

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        match self.resolve(path)? {
            Resolved::Absent => return Err(Error::NotFound(path.to_string())),
            r if r.is_dir() => return Err(Error::IsADirectory(path.to_string())),
            Resolved::ArchiveOnly(entry) => self.copy_up(overlay, entry, size > 0)?,
            Resolved::OverlayOnly(_) | Resolved::OverlayOverArchive(..) => {}
        }

        OpenOptions::new()
            .write(true)
            .open(overlay.resolve(path))?
            .set_len(size)?;
        Ok(())
    }

    /// Change access and modification times. Untouched archive nodes are
    /// copied up so the new times have somewhere to live.
    pub fn set_times(
        &self,
        path: &VPath,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        debug!("set_times({}, {:?}, {:?})", path, atime, mtime);

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        let target = self.materialize(overlay, path)?;
        let mut times = FileTimes::new();
        if let Some(atime) = atime {
            times = times.set_accessed(atime);
        }
        if let Some(mtime) = mtime {
            times = times.set_modified(mtime);
        }
        File::open(target)?.set_times(times)?;
        Ok(())
    }

    /// Change permission bits, copying an untouched archive node up first
    pub fn set_mode(&self, path: &VPath, mode: u32) -> Result<()> {
        debug!("set_mode({}, {:o})", path, mode);

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        let target = self.materialize(overlay, path)?;
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    /// Delete a file
    pub fn unlink(&self, path: &VPath) -> Result<()> {
        debug!("unlink({})", path);

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        match self.resolve(path)? {
            Resolved::Absent => return Err(Error::NotFound(path.to_string())),
            r if r.is_dir() => return Err(Error::IsADirectory(path.to_string())),
            Resolved::ArchiveOnly(_) => overlay.create_whiteout(path)?,
            Resolved::OverlayOnly(_) => overlay.remove_file(path)?,
            Resolved::OverlayOverArchive(..) => {
                overlay.create_whiteout(path)?;
                if let Err(e) = overlay.remove_file(path) {
                    self.rollback_whiteout(overlay, path);
                    return Err(e);
                }
            }
        }

        info!("Deleted {}", path);
        Ok(())
    }

    /// Create a directory. Recreating a deleted archive directory hides
    /// its archive children so it starts out empty.
    pub fn mkdir(&self, path: &VPath) -> Result<()> {
        debug!("mkdir({})", path);

        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        if self.resolve(path)?.is_visible() {
            return Err(Error::AlreadyExists(path.to_string()));
        }
        self.require_parent_dir(path)?;

        overlay.create_dir(path)?;
        if self.archive.is_dir(path) {
            let mut masked = Vec::new();
            if let Err(e) = self.mask_archive_children(overlay, path, path, &mut masked) {
                if let Err(cleanup) = overlay.remove_dir_all(path) {
                    warn!("Failed to remove half-made directory {}: {}", path, cleanup);
                }
                return Err(e);
            }
        }
        overlay.remove_whiteout(path)?;
        Ok(())
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &VPath) -> Result<()> {
        debug!("rmdir({})", path);

        if path.is_root() {
            return Err(Error::InvalidPath(path.to_string()));
        }
        let overlay = self.writable_overlay(path)?;
        let _guard = self.mutation.lock();

        let resolved = self.resolve(path)?;
        if !resolved.is_visible() {
            return Err(Error::NotFound(path.to_string()));
        }
        if !resolved.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        if !resolver::list_dir(&self.archive, Some(overlay), path, &resolved)?.is_empty() {
            return Err(Error::NotEmpty(path.to_string()));
        }

        let archived = resolved.archive_entry().is_some();
        if archived {
            overlay.create_whiteout(path)?;
        }
        if resolved.overlay_meta().is_some() {
            if let Err(e) = overlay.remove_dir_all(path) {
                if archived {
                    self.rollback_whiteout(overlay, path);
                }
                return Err(e);
            }
        }

        info!("Removed directory {}", path);
        Ok(())
    }

    /// Move a file or directory already held by the overlay. Untouched
    /// archive paths and directories with archive content cannot move.
    pub fn rename(&self, from: &VPath, to: &VPath) -> Result<()> {
        self.rename_inner(from, to, false)
    }

    /// [`rename`](Self::rename) that fails if anything is visible at `to`
    pub fn rename_noreplace(&self, from: &VPath, to: &VPath) -> Result<()> {
        self.rename_inner(from, to, true)
    }

    fn rename_inner(&self, from: &VPath, to: &VPath, no_replace: bool) -> Result<()> {
        debug!("rename({} -> {}, no_replace={})", from, to, no_replace);

        if from.is_root() || to.is_root() {
            return Err(Error::InvalidPath(from.to_string()));
        }
        if to != from && to.starts_with(from) {
            return Err(Error::InvalidPath(to.to_string()));
        }
        let overlay = self.writable_overlay(from)?;
        self.writable_overlay(to)?;
        let _guard = self.mutation.lock();

        let source_is_dir = match self.resolve(from)? {
            Resolved::Absent => return Err(Error::NotFound(from.to_string())),
            Resolved::ArchiveOnly(_) => {
                return Err(Error::Unsupported(format!(
                    "rename of {} which was never opened for writing",
                    from
                )))
            }
            Resolved::OverlayOnly(meta) | Resolved::OverlayOverArchive(meta, _) => meta.is_dir(),
        };
        if source_is_dir && self.archive.is_dir(from) {
            return Err(Error::Unsupported(format!(
                "rename of directory {} with archive content",
                from
            )));
        }
        if from == to {
            return if no_replace {
                Err(Error::AlreadyExists(to.to_string()))
            } else {
                Ok(())
            };
        }

        self.require_parent_dir(to)?;
        let target = self.resolve(to)?;
        if no_replace && target.is_visible() {
            return Err(Error::AlreadyExists(to.to_string()));
        }
        if target.is_visible() {
            match (source_is_dir, target.is_dir()) {
                (true, true) => return Err(Error::AlreadyExists(to.to_string())),
                (false, true) => return Err(Error::IsADirectory(to.to_string())),
                (true, false) => return Err(Error::NotADirectory(to.to_string())),
                (false, false) => {}
            }
        }

        // Whiteouts go in first and the overlay move commits; a failure
        // at any step undoes the ones before it.
        let mut undo = Vec::new();
        if source_is_dir && self.archive.is_dir(to) {
            if let Err(e) = self.mask_archive_children(overlay, to, from, &mut undo) {
                self.rollback_whiteouts(overlay, &undo);
                return Err(e);
            }
        }
        if self.archive.get(from).is_some() {
            if let Err(e) = overlay.create_whiteout(from) {
                self.rollback_whiteouts(overlay, &undo);
                return Err(e);
            }
            undo.push(from.clone());
        }

        if let Err(e) = overlay.rename(from, to) {
            self.rollback_whiteouts(overlay, &undo);
            return Err(e);
        }
        if let Err(e) = overlay.remove_whiteout(to) {
            // A whiteout at the target means nothing was replaced there
            if let Err(back) = overlay.rename(to, from) {
                error!("Failed to move {} back to {}: {}", to, from, back);
                return Err(e);
            }
            self.rollback_whiteouts(overlay, &undo);
            return Err(e);
        }

        info!("Renamed {} -> {}", from, to);
        Ok(())
    }

    /// Usage figures of the filesystem backing the overlay (or the archive)
    pub fn statfs(&self) -> Result<FsStats> {
        let path: &Path = match &self.overlay {
            Some(overlay) => overlay.root(),
            None => self.archive.path(),
        };
        let stats = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;

        let (bfree, bavail) = if self.is_read_only() {
            (0, 0)
        } else {
            (stats.blocks_free() as u64, stats.blocks_available() as u64)
        };
        Ok(FsStats {
            blocks: stats.blocks() as u64,
            bfree,
            bavail,
            files: stats.files() as u64,
            ffree: stats.files_free() as u64,
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }

    /// Overlay store for a path that must be writable
    fn writable_overlay(&self, path: &VPath) -> Result<&OverlayStore> {
        let overlay = self
            .overlay
            .as_ref()
            .ok_or_else(|| Error::ReadOnly(path.to_string()))?;
        if path.components().any(is_reserved_name) {
            return Err(Error::InvalidPath(path.to_string()));
        }
        if self.readonly_prefixes.iter().any(|p| path.starts_with(p)) {
            return Err(Error::ReadOnly(path.to_string()));
        }
        Ok(overlay)
    }

    /// Overlay store backing a path the resolver placed in the overlay
    fn overlay_store(&self, path: &VPath) -> Result<&OverlayStore> {
        self.overlay
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("{} resolved to a missing overlay", path)))
    }

    fn require_parent_dir(&self, path: &VPath) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidPath(path.to_string()))?;
        let resolved = self.resolve(&parent)?;
        if !resolved.is_visible() {
            return Err(Error::NotFound(parent.to_string()));
        }
        if !resolved.is_dir() {
            return Err(Error::NotADirectory(parent.to_string()));
        }
        Ok(())
    }

    /// Overlay location of a visible path. An untouched archive file is
    /// copied up with its content; an archive directory gets an overlay
    /// directory that merges with it.
    fn materialize(&self, overlay: &OverlayStore, path: &VPath) -> Result<PathBuf> {
        match self.resolve(path)? {
            Resolved::Absent => return Err(Error::NotFound(path.to_string())),
            Resolved::ArchiveOnly(entry) if entry.is_dir() => overlay.create_dir(path)?,
            Resolved::ArchiveOnly(entry) => self.copy_up(overlay, entry, true)?,
            Resolved::OverlayOnly(_) | Resolved::OverlayOverArchive(..) => {}
        }
        Ok(overlay.resolve(path))
    }

    /// Materialize an archive file in the overlay. Content is staged in a
    /// writeback file and renamed into place, so a failure leaves nothing
    /// visible behind.
    fn copy_up(&self, overlay: &OverlayStore, entry: &ArchiveEntry, keep_content: bool) -> Result<()> {
        let path = &entry.path;
        overlay.ensure_parent_dirs(path)?;

        let staging = overlay.writeback_path(path);
        let result = self
            .write_staging(&staging, entry, keep_content)
            .and_then(|()| fs::rename(&staging, overlay.resolve(path)).map_err(Error::from));

        if let Err(e) = result {
            error!("Copy-up of {} failed: {}", path, e);
            if let Err(cleanup) = fs::remove_file(&staging) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove staging file {:?}: {}", staging, cleanup);
                }
            }
            return Err(e);
        }

        info!(
            "Copied up {} ({} bytes)",
            path,
            if keep_content { entry.size } else { 0 }
        );
        Ok(())
    }

    fn write_staging(&self, staging: &Path, entry: &ArchiveEntry, keep_content: bool) -> Result<()> {
        let mut file = File::create(staging)?;
        if keep_content {
            let mut reader = self.archive.reader(entry);
            io::copy(&mut reader, &mut file)?;
            file.set_modified(entry.mtime())?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Whiteout, inside overlay directory `dir`, every child of archive
    /// directory `archive_dir` that `dir` does not already cover. Descends
    /// into overlay directories that merge with archive ones. Created
    /// whiteouts are appended to `created`.
    fn mask_archive_children(
        &self,
        overlay: &OverlayStore,
        archive_dir: &VPath,
        dir: &VPath,
        created: &mut Vec<VPath>,
    ) -> Result<()> {
        for child in self.archive.children(archive_dir) {
            let Some(name) = child.path.file_name() else {
                continue;
            };
            let path = dir.join(name)?;
            match overlay.node(&path)? {
                Some(OverlayNode::Regular(meta)) => {
                    if meta.is_dir() && child.is_dir() {
                        self.mask_archive_children(overlay, &child.path, &path, created)?;
                    }
                }
                Some(OverlayNode::Whiteout) => {}
                None => {
                    overlay.create_whiteout(&path)?;
                    created.push(path);
                }
            }
        }
        Ok(())
    }

    fn rollback_whiteout(&self, overlay: &OverlayStore, path: &VPath) {
        if let Err(e) = overlay.remove_whiteout(path) {
            warn!("Failed to roll back whiteout for {}: {}", path, e);
        }
    }

    fn rollback_whiteouts(&self, overlay: &OverlayStore, paths: &[VPath]) {
        for path in paths.iter().rev() {
            self.rollback_whiteout(overlay, path);
        }
    }
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Positional read that keeps going until `size` bytes or end of file
fn read_file_at(file: &File, offset: u64, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::config::{BuildConfig, CacheConfig};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        overlay_root: std::path::PathBuf,
        engine: OverlayEngine,
    }

    fn vp(s: &str) -> VPath {
        VPath::parse(s).unwrap()
    }

    fn fixture(files: &[(&str, &str)], with_overlay: bool) -> Fixture {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        for (name, data) in files {
            let path = src.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
        let archive_path = dir.path().join("test.mar");
        ArchiveBuilder::new(BuildConfig {
            jobs: 1,
            ..BuildConfig::default()
        })
        .build(&src, &archive_path)
        .unwrap();

        let archive = Arc::new(ArchiveStore::open(&archive_path, &CacheConfig::default()).unwrap());
        let overlay_root = dir.path().join("overlay");
        let overlay = with_overlay.then(|| OverlayStore::open(&overlay_root).unwrap());
        Fixture {
            engine: OverlayEngine::new(archive, overlay),
            overlay_root,
            _dir: dir,
        }
    }

    fn read_all(engine: &OverlayEngine, path: &str) -> Vec<u8> {
        let fh = engine.open(&vp(path), OpenFlags::read_only()).unwrap();
        let data = engine.read(fh, 0, 1 << 20).unwrap();
        engine.release(fh).unwrap();
        data
    }

    fn names(engine: &OverlayEngine, path: &str) -> Vec<String> {
        engine
            .readdir(&vp(path))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[test]
    fn test_open_flags_from_libc() {
        let flags = OpenFlags::from_libc(libc::O_WRONLY | libc::O_APPEND);
        assert!(flags.write && flags.append && !flags.truncate);
        assert!(!OpenFlags::from_libc(libc::O_RDONLY).write_intent());
        assert!(OpenFlags::from_libc(libc::O_RDONLY | libc::O_TRUNC).write_intent());
    }

    #[test]
    fn test_getattr_layers() {
        let f = fixture(&[("a.txt", "hello"), ("dir/b.txt", "b")], true);
        let attr = f.engine.getattr(&vp("a.txt")).unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(attr.layer, Layer::Archive);
        assert!(f.engine.getattr(&vp("dir")).unwrap().is_dir());
        assert!(f.engine.getattr(&VPath::root()).unwrap().is_dir());
        assert!(matches!(f.engine.getattr(&vp("nope")), Err(Error::NotFound(_))));
        assert!(matches!(f.engine.getattr(&vp("a.txt/x")), Err(Error::NotFound(_))));

        let fh = f.engine.open(&vp("a.txt"), OpenFlags::append()).unwrap();
        f.engine.write(fh, 0, b"!").unwrap();
        f.engine.release(fh).unwrap();
        let attr = f.engine.getattr(&vp("a.txt")).unwrap();
        assert_eq!(attr.size, 6);
        assert_eq!(attr.layer, Layer::Overlay);
    }

    #[test]
    fn test_markers_are_invisible() {
        let f = fixture(&[("a.txt", "hello")], true);
        f.engine.unlink(&vp("a.txt")).unwrap();

        assert!(f.overlay_root.join("a.txt.__whiteout__").exists());
        assert!(names(&f.engine, "").is_empty());
        assert!(matches!(
            f.engine.getattr(&vp("a.txt.__whiteout__")),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            f.engine.create(&vp("x.__writeback__"), OpenFlags::write(), false),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_read_only_mount() {
        let f = fixture(&[("a.txt", "hello")], false);
        assert_eq!(read_all(&f.engine, "a.txt"), b"hello");
        assert_eq!(f.engine.getattr(&vp("a.txt")).unwrap().perm, 0o444);

        assert!(matches!(
            f.engine.open(&vp("a.txt"), OpenFlags::write()),
            Err(Error::ReadOnly(_))
        ));
        assert!(matches!(f.engine.unlink(&vp("a.txt")), Err(Error::ReadOnly(_))));
        assert!(matches!(f.engine.mkdir(&vp("d")), Err(Error::ReadOnly(_))));
        assert!(matches!(
            f.engine.create(&vp("n"), OpenFlags::write(), true),
            Err(Error::ReadOnly(_))
        ));
        assert!(!f.overlay_root.exists());
    }

    #[test]
    fn test_readonly_prefix() {
        let f = fixture(&[("locked/a.txt", "a"), ("free.txt", "f")], true);
        let engine = f.engine.with_readonly_prefixes(vec![vp("locked")]);

        assert!(matches!(
            engine.open(&vp("locked/a.txt"), OpenFlags::write()),
            Err(Error::ReadOnly(_))
        ));
        assert!(matches!(engine.unlink(&vp("locked/a.txt")), Err(Error::ReadOnly(_))));
        assert_eq!(read_all(&engine, "locked/a.txt"), b"a");
        engine.unlink(&vp("free.txt")).unwrap();
    }

    #[test]
    fn test_create_exclusive_and_truncating() {
        let f = fixture(&[("a.txt", "hello")], true);
        assert!(matches!(
            f.engine.create(&vp("a.txt"), OpenFlags::write(), true),
            Err(Error::AlreadyExists(_))
        ));

        let fh = f.engine.create(&vp("a.txt"), OpenFlags::write(), false).unwrap();
        f.engine.write(fh, 0, b"new").unwrap();
        f.engine.release(fh).unwrap();
        assert_eq!(read_all(&f.engine, "a.txt"), b"new");

        assert!(matches!(
            f.engine.create(&vp("missing/x"), OpenFlags::write(), false),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            f.engine.create(&vp("a.txt/x"), OpenFlags::write(), false),
            Err(Error::NotADirectory(_))
        ));
    }

    #[test]
    fn test_truncate_copies_up() {
        let f = fixture(&[("a.txt", "hello")], true);
        f.engine.truncate(&vp("a.txt"), 2, None).unwrap();
        assert_eq!(read_all(&f.engine, "a.txt"), b"he");
        assert_eq!(fs::read(f.overlay_root.join("a.txt")).unwrap(), b"he");

        let fh = f.engine.open(&vp("a.txt"), OpenFlags::write()).unwrap();
        f.engine.truncate(&vp("a.txt"), 0, Some(fh)).unwrap();
        f.engine.release(fh).unwrap();
        assert!(read_all(&f.engine, "a.txt").is_empty());
    }

    #[test]
    fn test_write_through_read_only_handle_fails() {
        let f = fixture(&[("a.txt", "hello")], true);
        let fh = f.engine.open(&vp("a.txt"), OpenFlags::read_only()).unwrap();
        assert!(matches!(f.engine.write(fh, 0, b"x"), Err(Error::InvalidHandle(_))));
        f.engine.release(fh).unwrap();
        assert!(matches!(f.engine.read(fh, 0, 1), Err(Error::InvalidHandle(_))));
        assert_eq!(f.engine.open_handles(), 0);
    }

    #[test]
    fn test_unlink_and_rmdir_kinds() {
        let f = fixture(&[("dir/a.txt", "a")], true);
        assert!(matches!(f.engine.unlink(&vp("dir")), Err(Error::IsADirectory(_))));
        assert!(matches!(f.engine.rmdir(&vp("dir/a.txt")), Err(Error::NotADirectory(_))));
        assert!(matches!(f.engine.rmdir(&vp("dir")), Err(Error::NotEmpty(_))));

        f.engine.unlink(&vp("dir/a.txt")).unwrap();
        f.engine.rmdir(&vp("dir")).unwrap();
        assert!(matches!(f.engine.getattr(&vp("dir")), Err(Error::NotFound(_))));
        assert!(matches!(f.engine.getattr(&vp("dir/a.txt")), Err(Error::NotFound(_))));
        assert!(names(&f.engine, "").is_empty());
    }

    #[test]
    fn test_mkdir_over_deleted_archive_dir_is_empty() {
        let f = fixture(&[("dir/a.txt", "a"), ("dir/sub/b.txt", "b")], true);
        f.engine.unlink(&vp("dir/a.txt")).unwrap();
        f.engine.unlink(&vp("dir/sub/b.txt")).unwrap();
        f.engine.rmdir(&vp("dir/sub")).unwrap();
        f.engine.rmdir(&vp("dir")).unwrap();

        f.engine.mkdir(&vp("dir")).unwrap();
        assert!(names(&f.engine, "dir").is_empty());
        assert!(matches!(f.engine.mkdir(&vp("dir")), Err(Error::AlreadyExists(_))));

        let fh = f.engine.create(&vp("dir/a.txt"), OpenFlags::write(), true).unwrap();
        f.engine.write(fh, 0, b"fresh").unwrap();
        f.engine.release(fh).unwrap();
        assert_eq!(names(&f.engine, "dir"), vec!["a.txt".to_string()]);
        assert_eq!(read_all(&f.engine, "dir/a.txt"), b"fresh");
    }

    #[test]
    fn test_rename_rules() {
        let f = fixture(&[("a.txt", "a"), ("dir/b.txt", "b")], true);
        assert!(matches!(
            f.engine.rename(&vp("a.txt"), &vp("c.txt")),
            Err(Error::Unsupported(_))
        ));

        f.engine.mkdir(&vp("new")).unwrap();
        assert!(matches!(
            f.engine.rename(&vp("new"), &vp("dir")),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            f.engine.rename(&vp("new"), &vp("new/inner")),
            Err(Error::InvalidPath(_))
        ));

        let fh = f.engine.create(&vp("n.txt"), OpenFlags::write(), true).unwrap();
        f.engine.release(fh).unwrap();
        assert!(matches!(
            f.engine.rename(&vp("n.txt"), &vp("dir")),
            Err(Error::IsADirectory(_))
        ));
        assert!(matches!(
            f.engine.rename(&vp("new"), &vp("n.txt")),
            Err(Error::NotADirectory(_))
        ));

        f.engine.rename(&vp("new"), &vp("moved")).unwrap();
        assert!(f.engine.getattr(&vp("moved")).unwrap().is_dir());
        assert!(matches!(f.engine.getattr(&vp("new")), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_renamed_dir_over_deleted_archive_dir_masks_children() {
        let f = fixture(&[("dir/b.txt", "b")], true);
        f.engine.unlink(&vp("dir/b.txt")).unwrap();
        f.engine.rmdir(&vp("dir")).unwrap();

        f.engine.mkdir(&vp("tmp")).unwrap();
        let fh = f.engine.create(&vp("tmp/c.txt"), OpenFlags::write(), true).unwrap();
        f.engine.release(fh).unwrap();
        f.engine.rename(&vp("tmp"), &vp("dir")).unwrap();

        assert_eq!(names(&f.engine, "dir"), vec!["c.txt".to_string()]);
        assert!(!f.overlay_root.join("dir.__whiteout__").exists());
    }

    #[test]
    fn test_rename_failure_restores_source() {
        let f = fixture(&[("a.txt", "hello")], true);
        let fh = f.engine.open(&vp("a.txt"), OpenFlags::write()).unwrap();
        f.engine.release(fh).unwrap();

        // A directory where the target's whiteout sits cannot be removed
        fs::create_dir_all(f.overlay_root.join("dest.__whiteout__/blocker")).unwrap();
        assert!(matches!(f.engine.getattr(&vp("dest")), Err(Error::NotFound(_))));

        assert!(f.engine.rename(&vp("a.txt"), &vp("dest")).is_err());
        assert_eq!(read_all(&f.engine, "a.txt"), b"hello");
        assert_eq!(f.engine.getattr(&vp("a.txt")).unwrap().layer, Layer::Overlay);
        assert!(!f.overlay_root.join("a.txt.__whiteout__").exists());
        assert!(!f.overlay_root.join("dest").exists());
        assert_eq!(names(&f.engine, ""), vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_failed_dir_rename_drops_masking_whiteouts() {
        let f = fixture(&[("dir/b.txt", "b")], true);
        fs::create_dir_all(f.overlay_root.join("dir.__whiteout__/blocker")).unwrap();

        f.engine.mkdir(&vp("tmp")).unwrap();
        let fh = f.engine.create(&vp("tmp/c.txt"), OpenFlags::write(), true).unwrap();
        f.engine.release(fh).unwrap();

        assert!(f.engine.rename(&vp("tmp"), &vp("dir")).is_err());
        assert_eq!(names(&f.engine, "tmp"), vec!["c.txt".to_string()]);
        assert!(!f.overlay_root.join("tmp/b.txt.__whiteout__").exists());
        assert!(!f.overlay_root.join("dir").exists());
    }

    #[test]
    fn test_rename_noreplace() {
        let f = fixture(&[("a.txt", "a")], true);
        for name in ["x.txt", "y.txt"] {
            let fh = f.engine.create(&vp(name), OpenFlags::write(), true).unwrap();
            f.engine.release(fh).unwrap();
        }

        assert!(matches!(
            f.engine.rename_noreplace(&vp("x.txt"), &vp("y.txt")),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            f.engine.rename_noreplace(&vp("x.txt"), &vp("a.txt")),
            Err(Error::AlreadyExists(_))
        ));
        f.engine.rename_noreplace(&vp("x.txt"), &vp("z.txt")).unwrap();
        assert!(f.engine.getattr(&vp("z.txt")).is_ok());
        assert!(matches!(f.engine.getattr(&vp("x.txt")), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_failed_copy_up_leaves_no_trace() {
        let content = "x".repeat(4096);
        let f = fixture(&[("big.txt", content.as_str())], true);

        let entry = f.engine.archive().get(&vp("big.txt")).unwrap().clone();
        assert_eq!(entry.chunks[0].method, crate::chunk::ChunkMethod::Lz4);
        let archive_file = OpenOptions::new()
            .write(true)
            .open(f.engine.archive().path())
            .unwrap();
        let garbage = vec![0xffu8; entry.body.length as usize - 4];
        archive_file
            .write_all_at(&garbage, entry.body.offset + 4)
            .unwrap();

        assert!(matches!(
            f.engine.open(&vp("big.txt"), OpenFlags::append()),
            Err(Error::Io(_))
        ));
        assert_eq!(fs::read_dir(&f.overlay_root).unwrap().count(), 0);
        assert_eq!(f.engine.getattr(&vp("big.txt")).unwrap().layer, Layer::Archive);
        assert_eq!(f.engine.open_handles(), 0);
    }

    #[test]
    fn test_set_times_and_mode_copy_up() {
        let f = fixture(&[("a.txt", "hello"), ("d/x", "x")], true);
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        f.engine.set_times(&vp("a.txt"), None, Some(when)).unwrap();
        let attr = f.engine.getattr(&vp("a.txt")).unwrap();
        assert_eq!(attr.layer, Layer::Overlay);
        assert_eq!(attr.mtime, when);
        assert_eq!(read_all(&f.engine, "a.txt"), b"hello");

        f.engine.set_times(&vp("d"), Some(when), Some(when)).unwrap();
        assert_eq!(f.engine.getattr(&vp("d")).unwrap().mtime, when);
        assert_eq!(names(&f.engine, "d"), vec!["x".to_string()]);
        assert_eq!(read_all(&f.engine, "d/x"), b"x");

        f.engine.set_mode(&vp("a.txt"), 0o600).unwrap();
        assert_eq!(f.engine.getattr(&vp("a.txt")).unwrap().perm, 0o600);
        assert!(matches!(
            f.engine.set_mode(&vp("missing"), 0o600),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_set_times_on_read_only_mount() {
        let f = fixture(&[("a.txt", "hello")], false);
        assert!(matches!(
            f.engine.set_times(&vp("a.txt"), Some(SystemTime::now()), None),
            Err(Error::ReadOnly(_))
        ));
    }
}
