//! # httpfs-config
//!
//! Configuration for httpfs.
//!
//! Loads configuration from:
//! 1. `~/.httpfs/config.toml` (global)
//! 2. `.httpfs/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! Command-line flags override all of these; that mapping lives in the
//! binary crate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod logging;

pub use httpfs_cache::{DEFAULT_CHUNK_SIZE, MAX_CHUNKS_PER_CACHE, MIN_CHUNK_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub cache: CacheSection,
    pub mount: MountConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            cache: CacheSection::default(),
            mount: MountConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        let project_path = Path::new(".httpfs/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            config = toml::from_str(&contents)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load config from an explicit file, then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: ~/.httpfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".httpfs/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("HTTPFS_URL") {
            self.remote.url = url;
        }
        if let Ok(path) = std::env::var("HTTPFS_METADATA") {
            self.remote.metadata = path;
        }
        if let Ok(secs) = std::env::var("HTTPFS_INTERVAL") {
            if let Ok(n) = secs.parse() {
                self.remote.reload_interval_secs = n;
            }
        }
        if let Ok(size) = std::env::var("HTTPFS_CHUNK_SIZE") {
            if let Ok(n) = size.parse() {
                self.cache.chunk_size = n;
            }
        }
    }

    /// Reject values the cache layer would silently misbehave on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.chunks == 0 || self.cache.chunks > MAX_CHUNKS_PER_CACHE {
            return Err(ConfigError::Invalid(format!(
                "cache.chunks must be between 1 and {}, got {}",
                MAX_CHUNKS_PER_CACHE, self.cache.chunks
            )));
        }
        if self.cache.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "cache.chunk_size must be at least {} bytes, got {}",
                MIN_CHUNK_SIZE, self.cache.chunk_size
            )));
        }
        if !self.remote.metadata.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "remote.metadata must be a server-relative path, got {:?}",
                self.remote.metadata
            )));
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Remote site configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the exported site
    pub url: String,
    /// Server-relative path of the metadata document
    pub metadata: String,
    /// Minimum seconds between metadata freshness checks
    pub reload_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            metadata: "/description.data".to_string(),
            reload_interval_secs: 60,
        }
    }
}

/// Cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Chunks per file cache (1 to MAX_CHUNKS_PER_CACHE)
    pub chunks: usize,
    /// Chunk size in bytes
    pub chunk_size: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            chunks: 1,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Mount-time behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Report regular files as executable
    pub exec_files: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self { exec_files: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.remote.metadata, "/description.data");
        assert_eq!(config.remote.reload_interval_secs, 60);
        assert_eq!(config.cache.chunks, 1);
        assert_eq!(config.cache.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!config.mount.exec_files);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[remote]
url = "http://example.org/pub"
reload_interval_secs = 5

[cache]
chunks = 4
"#
        )
        .unwrap();
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.remote.url, "http://example.org/pub");
        assert_eq!(config.remote.reload_interval_secs, 5);
        assert_eq!(config.cache.chunks, 4);
        // Unset sections keep their defaults.
        assert_eq!(config.remote.metadata, "/description.data");
        assert_eq!(config.cache.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_validate_rejects_bad_chunks() {
        let mut config = Config::default();
        config.cache.chunks = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));
        config.cache.chunks = MAX_CHUNKS_PER_CACHE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_chunk_size() {
        let mut config = Config::default();
        config.cache.chunk_size = MIN_CHUNK_SIZE - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_metadata_path() {
        let mut config = Config::default();
        config.remote.metadata = "description.data".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = Config::default_toml();
        let config: Config = toml::from_str(&text).unwrap();
        config.validate().unwrap();
    }
}
