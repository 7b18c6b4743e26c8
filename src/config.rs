//! Configuration management for marfs

use crate::archive::{GlobPattern, PathRewrite};
use crate::error::{Error, Result};
use crate::path::VPath;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default chunk size: 512 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Largest accepted chunk size: 64 MiB
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Default decoded-chunk cache size: 256 MiB
pub const DEFAULT_CACHE_SIZE: u64 = 256 * 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Archive build configuration
    pub build: BuildConfig,

    /// Decoded chunk cache configuration
    pub cache: CacheConfig,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Archive build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,

    /// Minimum chunk size to attempt compression (bytes)
    pub compression_threshold: usize,

    /// Number of encoding workers
    pub jobs: usize,

    /// Store identical file bodies only once
    pub dedup: bool,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum bytes of decoded chunks kept in memory
    pub max_size: u64,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Attribute and entry cache TTL handed to the kernel
    pub attr_ttl_secs: u64,

    /// Subtrees that refuse writes even with an overlay
    pub readonly_prefixes: Vec<String>,

    /// Mount only archive paths matching one of these globs
    pub only_globs: Vec<String>,

    /// Directory stripped from the front of archive paths
    pub strip_prefix: Option<String>,

    /// Directory every archive path is mounted below
    pub add_prefix: Option<String>,

    /// Filesystem name shown in the mount table
    pub fs_name: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression_threshold: 64,
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            dedup: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            allow_other: false,
            auto_unmount: true,
            attr_ttl_secs: 1,
            readonly_prefixes: Vec::new(),
            only_globs: Vec::new(),
            strip_prefix: None,
            add_prefix: None,
            fs_name: "marfs".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(jobs) = std::env::var("MARFS_JOBS") {
            if let Ok(jobs) = jobs.trim().parse::<usize>() {
                self.build.jobs = jobs;
            }
        }

        if let Ok(chunk_size) = std::env::var("MARFS_CHUNK_SIZE") {
            if let Ok(size) = chunk_size.trim().parse::<usize>() {
                self.build.chunk_size = size;
            }
        }

        if let Ok(cache_size) = std::env::var("MARFS_CACHE_SIZE") {
            if let Ok(size) = cache_size.trim().parse::<u64>() {
                self.cache.max_size = size;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.build.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "Chunk size must be greater than 0".to_string(),
            ));
        }

        if self.build.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Chunk size exceeds {} bytes",
                MAX_CHUNK_SIZE
            )));
        }

        if self.build.jobs == 0 {
            return Err(Error::InvalidConfig(
                "At least one build job is required".to_string(),
            ));
        }

        for prefix in &self.mount.readonly_prefixes {
            VPath::parse(prefix).map_err(|_| {
                Error::InvalidConfig(format!("Invalid read-only prefix: {}", prefix))
            })?;
        }

        self.path_rewrite()?;

        Ok(())
    }

    /// Archive path filter and prefix rewrite for mounting
    pub fn path_rewrite(&self) -> Result<PathRewrite> {
        let prefix = |raw: &Option<String>, what: &str| -> Result<Option<VPath>> {
            raw.as_deref()
                .map(|p| {
                    VPath::parse(p)
                        .map_err(|_| Error::InvalidConfig(format!("Invalid {}: {}", what, p)))
                })
                .transpose()
        };

        Ok(PathRewrite {
            only_globs: self
                .mount
                .only_globs
                .iter()
                .map(|g| GlobPattern::new(g))
                .collect::<Result<_>>()?,
            strip_prefix: prefix(&self.mount.strip_prefix, "strip prefix")?,
            add_prefix: prefix(&self.mount.add_prefix, "add prefix")?,
        })
    }

    /// Parsed read-only prefixes
    pub fn readonly_prefixes(&self) -> Result<Vec<VPath>> {
        self.mount
            .readonly_prefixes
            .iter()
            .map(|p| VPath::parse(p))
            .collect()
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("marfs")
            .join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.build.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.mount.auto_unmount);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.build.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.build.jobs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mount.readonly_prefixes = vec!["a/../b".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_mount_options() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "build": {"dedup": true},
                "mount": {
                    "readonly_prefixes": ["/system"],
                    "only_globs": ["**/*.png"],
                    "strip_prefix": "/game",
                    "add_prefix": "assets"
                }
            }"#,
        )
        .unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.build.dedup);
        assert_eq!(loaded.readonly_prefixes().unwrap()[0].as_str(), "system");

        let rewrite = loaded.path_rewrite().unwrap();
        assert_eq!(rewrite.only_globs[0].as_str(), "**/*.png");
        assert_eq!(
            rewrite.apply(&VPath::parse("game/ui/a.png").unwrap()),
            Some(VPath::parse("assets/ui/a.png").unwrap())
        );
    }

    #[test]
    fn test_invalid_rewrite_is_rejected() {
        let mut config = Config::default();
        config.mount.strip_prefix = Some("a/../b".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cache": {"max_size": 1024}}"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.cache.max_size, 1024);
        assert_eq!(loaded.mount.fs_name, "marfs");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.json")).unwrap();
        assert!(config.validate().is_ok());
    }
}
