//! Merged-view paths
//!
//! Every layer is addressed by the same relative, `/`-separated path.
//! The empty path is the root directory.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Normalized relative path inside the archive and the overlay
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VPath(String);

impl VPath {
    /// The root directory
    pub fn root() -> Self {
        VPath(String::new())
    }

    /// Parse a path, accepting an optional leading `/` and collapsing
    /// repeated separators. `.` and `..` components are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = Vec::new();
        for part in raw.split('/') {
            match part {
                "" => continue,
                "." | ".." => return Err(Error::InvalidPath(raw.to_string())),
                p if p.contains('\0') => return Err(Error::InvalidPath(raw.to_string())),
                p => parts.push(p),
            }
        }
        Ok(VPath(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Last component, `None` for the root
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        Some(self.0.rsplit('/').next().unwrap_or(&self.0))
    }

    /// Parent directory, `None` for the root
    pub fn parent(&self) -> Option<VPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(idx) => Some(VPath(self.0[..idx].to_string())),
            None => Some(VPath::root()),
        }
    }

    /// Append a single component
    pub fn join(&self, name: &str) -> Result<VPath> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
        {
            return Err(Error::InvalidPath(format!("{}/{}", self.0, name)));
        }
        if self.is_root() {
            Ok(VPath(name.to_string()))
        } else {
            Ok(VPath(format!("{}/{}", self.0, name)))
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|c| !c.is_empty())
    }

    /// Proper ancestors from the outermost down, excluding the root
    pub fn ancestors(&self) -> Vec<VPath> {
        let mut result = Vec::new();
        let mut current = self.parent();
        while let Some(p) = current {
            if p.is_root() {
                break;
            }
            current = p.parent();
            result.push(p);
        }
        result.reverse();
        result
    }

    /// Component-wise prefix test. Every path starts with the root.
    pub fn starts_with(&self, prefix: &VPath) -> bool {
        if prefix.is_root() {
            return true;
        }
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Replace the `from` prefix of this path with `to`
    pub fn rebase(&self, from: &VPath, to: &VPath) -> Option<VPath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = self.0[from.0.len()..].trim_start_matches('/');
        if rest.is_empty() {
            Some(to.clone())
        } else if to.is_root() {
            Some(VPath(rest.to_string()))
        } else {
            Some(VPath(format!("{}/{}", to.0, rest)))
        }
    }

    /// Absolute location of this path below `root`
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in self.components() {
            path.push(component);
        }
        path
    }
}

impl fmt::Display for VPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl TryFrom<String> for VPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        let parsed = VPath::parse(&value)?;
        if parsed.0 != value {
            return Err(Error::InvalidPath(value));
        }
        Ok(parsed)
    }
}

impl From<VPath> for String {
    fn from(value: VPath) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        assert_eq!(VPath::parse("/a//b/").unwrap().as_str(), "a/b");
        assert!(VPath::parse("/").unwrap().is_root());
        assert!(VPath::parse("a/../b").is_err());
        assert!(VPath::parse("./a").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        let p = VPath::parse("dir/sub/file.txt").unwrap();
        assert_eq!(p.file_name(), Some("file.txt"));
        assert_eq!(p.parent().unwrap().as_str(), "dir/sub");
        assert_eq!(VPath::parse("top").unwrap().parent(), Some(VPath::root()));
        assert_eq!(VPath::root().parent(), None);

        let ancestors: Vec<_> = p.ancestors().into_iter().map(|a| a.0).collect();
        assert_eq!(ancestors, vec!["dir".to_string(), "dir/sub".to_string()]);
    }

    #[test]
    fn test_starts_with_is_component_wise() {
        let p = VPath::parse("abc/def").unwrap();
        assert!(p.starts_with(&VPath::parse("abc").unwrap()));
        assert!(!p.starts_with(&VPath::parse("ab").unwrap()));
        assert!(p.starts_with(&VPath::root()));
    }

    #[test]
    fn test_rebase() {
        let p = VPath::parse("old/x/y").unwrap();
        let moved = p
            .rebase(&VPath::parse("old").unwrap(), &VPath::parse("new/dir").unwrap())
            .unwrap();
        assert_eq!(moved.as_str(), "new/dir/x/y");
        assert!(p.rebase(&VPath::parse("other").unwrap(), &VPath::root()).is_none());
    }

    #[test]
    fn test_join_rejects_separators() {
        let root = VPath::root();
        assert_eq!(root.join("a").unwrap().as_str(), "a");
        assert!(root.join("a/b").is_err());
        assert!(root.join("..").is_err());
    }
}
