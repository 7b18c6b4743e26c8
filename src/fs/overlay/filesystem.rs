//! Overlay FUSE filesystem implementation
//!
//! Translates kernel requests into overlay engine calls and engine errors
//! into errno values.

use fuser::{
    FileAttr, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info};

use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::path::VPath;

use super::engine::{OpenFlags, OverlayEngine};
use super::inode::{to_fuser_attr, InodeTable, ROOT_INO};

/// FUSE adapter over an [`OverlayEngine`]
pub struct MarFs {
    engine: OverlayEngine,
    inodes: InodeTable,
    ttl: Duration,
    uid: u32,
    gid: u32,
}

impl MarFs {
    pub fn new(engine: OverlayEngine, config: &MountConfig) -> Self {
        Self {
            engine,
            inodes: InodeTable::new(),
            ttl: Duration::from_secs(config.attr_ttl_secs),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    pub fn engine(&self) -> &OverlayEngine {
        &self.engine
    }

    fn path_of(&self, ino: u64) -> Result<VPath> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<VPath> {
        let name = name
            .to_str()
            .ok_or_else(|| Error::InvalidPath(name.to_string_lossy().to_string()))?;
        self.path_of(parent)?.join(name)
    }

    fn attr_of(&self, path: &VPath) -> Result<FileAttr> {
        let attr = self.engine.getattr(path)?;
        let ino = self.inodes.ino_for(path);
        Ok(to_fuser_attr(ino, &attr, self.uid, self.gid))
    }

    /// Apply size, mode and time changes. Ownership and file flags cannot
    /// change; ctime and the BSD-only times are ignored.
    fn do_setattr(&self, ino: u64, changes: AttrChanges) -> Result<FileAttr> {
        let path = self.path_of(ino)?;
        if changes.uid.is_some() || changes.gid.is_some() || changes.flags.is_some() {
            return Err(Error::Unsupported(format!("ownership or flags of {}", path)));
        }

        if let Some(size) = changes.size {
            self.engine.truncate(&path, size, changes.fh)?;
        }
        if let Some(mode) = changes.mode {
            self.engine.set_mode(&path, mode)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            self.engine.set_times(
                &path,
                changes.atime.map(resolve_time),
                changes.mtime.map(resolve_time),
            )?;
        }
        self.attr_of(&path)
    }

    fn do_create(&self, parent: u64, name: &OsStr, flags: i32) -> Result<(FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        let exclusive = flags & libc::O_EXCL != 0;
        let fh = self
            .engine
            .create(&path, OpenFlags::from_libc(flags), exclusive)?;
        match self.attr_of(&path) {
            Ok(attr) => Ok((attr, fh)),
            Err(e) => {
                let _ = self.engine.release(fh);
                Err(e)
            }
        }
    }

    fn do_mkdir(&self, parent: u64, name: &OsStr) -> Result<FileAttr> {
        let path = self.child_path(parent, name)?;
        self.engine.mkdir(&path)?;
        self.attr_of(&path)
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> Result<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(newparent, newname)?;
        if flags & RENAME_NOREPLACE != 0 {
            self.engine.rename_noreplace(&from, &to)?;
        } else {
            self.engine.rename(&from, &to)?;
        }
        self.inodes.rename(&from, &to);
        Ok(())
    }

    fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, fuser::FileType, String)>> {
        let path = self.path_of(ino)?;
        let children = self.engine.readdir(&path)?;
        let parent_ino = path
            .parent()
            .map(|p| self.inodes.ino_for(&p))
            .unwrap_or(ROOT_INO);

        let mut entries = vec![
            (ino, fuser::FileType::Directory, ".".to_string()),
            (parent_ino, fuser::FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_ino = self.inodes.ino_for(&path.join(&child.name)?);
            entries.push((child_ino, child.kind.to_fuser_type(), child.name));
        }
        Ok(entries)
    }
}

/// `renameat2(2)` flag refusing to replace an existing target
const RENAME_NOREPLACE: u32 = 1;

/// Attribute changes requested by one `setattr`
struct AttrChanges {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
    fh: Option<u64>,
    flags: Option<u32>,
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Log a failed request and reply with its errno
macro_rules! reply_err {
    ($reply:expr, $op:expr, $err:expr) => {{
        let err: Error = $err;
        if err.is_recoverable() {
            debug!("{} failed: {}", $op, err);
        } else {
            error!("{} failed: {}", $op, err);
        }
        $reply.error(err.errno());
    }};
}

impl Filesystem for MarFs {
    fn destroy(&mut self) {
        let cache = self.engine.archive().cache_stats();
        info!(
            "Unmounting {:?}: {} open handles, {} known inodes, chunk cache {} hits / {} misses",
            self.engine.archive().path(),
            self.engine.open_handles(),
            self.inodes.mapped(),
            cache.hits,
            cache.misses
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.child_path(parent, name).and_then(|p| self.attr_of(&p)) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply_err!(reply, "lookup", e),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        self.inodes.forget(ino);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.path_of(ino).and_then(|p| self.attr_of(&p)) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply_err!(reply, "getattr", e),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={}, size={:?}, mode={:?})", ino, size, mode);

        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
            flags,
        };
        match self.do_setattr(ino, changes) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply_err!(reply, "setattr", e),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);

        match self.do_mkdir(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply_err!(reply, "mkdir", e),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self
            .child_path(parent, name)
            .and_then(|p| self.engine.unlink(&p).map(|()| p));
        match result {
            Ok(path) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply_err!(reply, "unlink", e),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self
            .child_path(parent, name)
            .and_then(|p| self.engine.rmdir(&p).map(|()| p));
        match result {
            Ok(path) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply_err!(reply, "rmdir", e),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        // Exchange and whiteout renames are not offered
        if flags & !RENAME_NOREPLACE != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "rename", e),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        let result = self
            .path_of(ino)
            .and_then(|p| self.engine.open(&p, OpenFlags::from_libc(flags)));
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply_err!(reply, "open", e),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.engine.read(fh, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply_err!(reply, "read", e),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.engine.write(fh, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply_err!(reply, "write", e),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        match self.engine.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "flush", e),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        match self.engine.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "release", e),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={})", ino, fh);

        match self.engine.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply_err!(reply, "fsync", e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.do_readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply_err!(reply, "readdir", e);
                return;
            }
        };

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*child_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match self.engine.statfs() {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply_err!(reply, "statfs", e),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.path_of(ino).and_then(|p| self.engine.getattr(&p)) {
            Ok(_) if mask & libc::W_OK != 0 && self.engine.is_read_only() => {
                reply.error(libc::EROFS)
            }
            Ok(_) => reply.ok(),
            Err(e) => reply_err!(reply, "access", e),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, flags={})", parent, name, flags);

        match self.do_create(parent, name, flags) {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply_err!(reply, "create", e),
        }
    }
}
