//! Path resolution over the archive and the overlay
//!
//! Resolution is a pure function of the two stores' current contents.
//! Nothing is cached between calls, so every lookup reflects the last
//! completed mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::Metadata;

use crate::archive::{ArchiveEntry, ArchiveStore};
use crate::error::Result;
use crate::path::VPath;

use super::store::{is_reserved_name, OverlayEntryKind, OverlayNode, OverlayStore};

/// Which layer answers for a path
#[derive(Debug)]
pub enum Resolved<'a> {
    /// Nothing visible at the path
    Absent,
    /// Served from the archive
    ArchiveOnly(&'a ArchiveEntry),
    /// Served from the overlay; the archive has nothing there
    OverlayOnly(Metadata),
    /// Served from the overlay, shadowing an archive entry
    OverlayOverArchive(Metadata, &'a ArchiveEntry),
}

impl<'a> Resolved<'a> {
    pub fn is_visible(&self) -> bool {
        !matches!(self, Resolved::Absent)
    }

    pub fn is_dir(&self) -> bool {
        match self {
            Resolved::Absent => false,
            Resolved::ArchiveOnly(entry) => entry.is_dir(),
            Resolved::OverlayOnly(meta) | Resolved::OverlayOverArchive(meta, _) => meta.is_dir(),
        }
    }

    /// Overlay metadata, when the overlay serves the path
    pub fn overlay_meta(&self) -> Option<&Metadata> {
        match self {
            Resolved::OverlayOnly(meta) | Resolved::OverlayOverArchive(meta, _) => Some(meta),
            _ => None,
        }
    }

    /// The archive entry at the path, shadowed or not
    pub fn archive_entry(&self) -> Option<&'a ArchiveEntry> {
        match self {
            Resolved::ArchiveOnly(entry) | Resolved::OverlayOverArchive(_, entry) => Some(entry),
            _ => None,
        }
    }
}

/// Kind of a merged directory child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Resolve a path in the merged view. A path whose ancestor is hidden or
/// is not a directory is absent, and so is any reserved marker name.
pub fn resolve<'a>(
    archive: &'a ArchiveStore,
    overlay: Option<&OverlayStore>,
    path: &VPath,
) -> Result<Resolved<'a>> {
    if path.components().any(is_reserved_name) {
        return Ok(Resolved::Absent);
    }
    for ancestor in path.ancestors() {
        if !resolve_one(archive, overlay, &ancestor)?.is_dir() {
            return Ok(Resolved::Absent);
        }
    }
    resolve_one(archive, overlay, path)
}

/// Resolve a single path without looking at its ancestors
fn resolve_one<'a>(
    archive: &'a ArchiveStore,
    overlay: Option<&OverlayStore>,
    path: &VPath,
) -> Result<Resolved<'a>> {
    let node = match overlay {
        Some(overlay) => overlay.node(path)?,
        None => None,
    };

    Ok(match (node, archive.get(path)) {
        (Some(OverlayNode::Regular(meta)), Some(entry)) => Resolved::OverlayOverArchive(meta, entry),
        (Some(OverlayNode::Regular(meta)), None) => Resolved::OverlayOnly(meta),
        (Some(OverlayNode::Whiteout), _) => Resolved::Absent,
        (None, Some(entry)) => Resolved::ArchiveOnly(entry),
        (None, None) => Resolved::Absent,
    })
}

/// Union of the children of a resolved directory. Overlay nodes win over
/// archive entries of the same name; whited-out names are dropped.
pub fn list_dir(
    archive: &ArchiveStore,
    overlay: Option<&OverlayStore>,
    dir: &VPath,
    resolved: &Resolved<'_>,
) -> Result<BTreeMap<String, NodeKind>> {
    let mut children = BTreeMap::new();
    let mut whiteouts = BTreeSet::new();

    if let (Some(overlay), Some(_)) = (overlay, resolved.overlay_meta()) {
        for entry in overlay.list(dir)? {
            match entry.kind {
                OverlayEntryKind::Whiteout => {
                    whiteouts.insert(entry.name);
                }
                OverlayEntryKind::File => {
                    children.insert(entry.name, NodeKind::File);
                }
                OverlayEntryKind::Directory => {
                    children.insert(entry.name, NodeKind::Directory);
                }
            }
        }
    }

    // An overlay file shadowing an archive directory hides its children
    let archive_dir = match resolved {
        Resolved::ArchiveOnly(entry) => entry.is_dir(),
        Resolved::OverlayOverArchive(meta, entry) => meta.is_dir() && entry.is_dir(),
        _ => false,
    };
    if archive_dir {
        for entry in archive.children(dir) {
            let Some(name) = entry.path.file_name() else {
                continue;
            };
            if whiteouts.contains(name) || children.contains_key(name) {
                continue;
            }
            let kind = if entry.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            children.insert(name.to_string(), kind);
        }
    }

    Ok(children)
}
