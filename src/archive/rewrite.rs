//! Load-time rewriting of archive paths
//!
//! A mount can narrow an archive to the paths matching some globs, strip a
//! leading directory from every path and graft the result below another
//! directory. Rewriting happens once when the index is loaded; the archive
//! file itself is never touched.

use regex::Regex;

use crate::error::{Error, Result};
use crate::path::VPath;

/// Glob over `/`-separated paths: `*` and `?` stay within one component,
/// `**` spans any number of them.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_start_matches('/');
        let mut pattern = String::from("^");
        let mut rest = trimmed;

        while let Some(c) = rest.chars().next() {
            if let Some(after) = rest.strip_prefix("**/") {
                pattern.push_str("(?:.*/)?");
                rest = after;
                continue;
            }
            if let Some(after) = rest.strip_prefix("**") {
                pattern.push_str(".*");
                rest = after;
                continue;
            }
            match c {
                '*' => pattern.push_str("[^/]*"),
                '?' => pattern.push_str("[^/]"),
                other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
            rest = &rest[c.len_utf8()..];
        }
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::InvalidConfig(format!("Invalid glob {}: {}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &VPath) -> bool {
        self.regex.is_match(path.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Path filter and prefix rewrite applied to every index entry
#[derive(Debug, Clone, Default)]
pub struct PathRewrite {
    /// Keep only paths matching one of these (all paths when empty)
    pub only_globs: Vec<GlobPattern>,
    /// Removed from the front of paths that start with it
    pub strip_prefix: Option<VPath>,
    /// Prepended to every path
    pub add_prefix: Option<VPath>,
}

impl PathRewrite {
    /// Whether every path maps to itself
    pub fn is_identity(&self) -> bool {
        self.only_globs.is_empty() && self.strip_prefix.is_none() && self.add_prefix.is_none()
    }

    /// Where an archive path lands in the mounted view. `None` drops it,
    /// either because no glob matches or because it became the root.
    pub fn apply(&self, path: &VPath) -> Option<VPath> {
        if !self.only_globs.is_empty() && !self.only_globs.iter().any(|g| g.matches(path)) {
            return None;
        }

        let mut mapped = path.clone();
        if let Some(strip) = &self.strip_prefix {
            if let Some(stripped) = mapped.rebase(strip, &VPath::root()) {
                mapped = stripped;
            }
        }
        if let Some(add) = &self.add_prefix {
            mapped = mapped.rebase(&VPath::root(), add)?;
        }

        if mapped.is_root() {
            None
        } else {
            Some(mapped)
        }
    }
}
