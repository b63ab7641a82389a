//! # httpfs CLI
//!
//! Mounts a remote HTTP site as a read-only filesystem: fetches the
//! site's metadata document, builds the tree index and hands the mount
//! over to the FUSE adapter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use httpfs_cache::CacheConfig;
use httpfs_config::logging::{init_logging, LogLevel};
use httpfs_config::Config;
use httpfs_fetch::HttpSource;
use httpfs_fuse::HttpFs;
use httpfs_runtime::{HttpMetadata, Store, StoreOptions};
use httpfs_tree::Tree;

/// Mount a remote HTTP site as a read-only filesystem
#[derive(Parser)]
#[command(name = "httpfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Base URL of the exported site
    #[arg(value_name = "URL")]
    url: String,

    /// Directory to mount the filesystem on
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Server-relative path of the metadata document
    #[arg(short = 'm', long)]
    metadata: Option<String>,

    /// Chunks held per open file (1 to 8)
    #[arg(short = 'c', long)]
    chunks: Option<usize>,

    /// Chunk size in bytes
    #[arg(short = 's', long = "chunk-size")]
    chunk_size: Option<usize>,

    /// Seconds between metadata update checks
    #[arg(short = 'i', long)]
    interval: Option<u64>,

    /// Report regular files as executable
    #[arg(short = 'x', long)]
    execfiles: bool,

    /// Increase log verbosity (-v, -vv, ...)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    /// Fold command-line flags over the file/env configuration.
    fn apply(&self, config: &mut Config) {
        config.remote.url = self.url.clone();
        if let Some(metadata) = &self.metadata {
            config.remote.metadata = metadata.clone();
        }
        if let Some(chunks) = self.chunks {
            config.cache.chunks = chunks;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.cache.chunk_size = chunk_size;
        }
        if let Some(interval) = self.interval {
            config.remote.reload_interval_secs = interval;
        }
        if self.execfiles {
            config.mount.exec_files = true;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let mut config = Config::load().context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("checking configuration")?;

    let source = HttpSource::new(&config.remote.url);
    info!(url = %config.remote.url, metadata = %config.remote.metadata, "fetching metadata");
    let document = source
        .fetch_metadata(&config.remote.metadata)
        .context("fetching the metadata document")?;
    let tree = Tree::parse(document.as_bytes()).context("parsing the metadata document")?;
    info!(
        entries = tree.len(),
        generation = tree.generation(),
        "tree index built"
    );

    let metadata = HttpMetadata::new(source.clone(), &config.remote.metadata);
    let store = Store::new(
        tree,
        Box::new(metadata),
        Box::new(source),
        StoreOptions {
            mount_info: format!("{} on {}", config.remote.url, cli.mountpoint.display()),
            reload_interval: Duration::from_secs(config.remote.reload_interval_secs),
            cache: CacheConfig {
                chunk_size: config.cache.chunk_size,
                chunks_per_cache: config.cache.chunks,
                ..CacheConfig::default()
            },
        },
    );

    let fs = HttpFs::new(Arc::new(store), config.mount.exec_files);
    info!(mountpoint = %cli.mountpoint.display(), "mounting");
    fs.mount(&cli.mountpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_configuration() {
        let cli = Cli::try_parse_from([
            "httpfs",
            "http://example.org/pub",
            "/mnt/site",
            "-m",
            "/meta.data",
            "-c",
            "4",
            "--chunk-size",
            "4096",
            "-i",
            "30",
            "-x",
        ])
        .unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.remote.url, "http://example.org/pub");
        assert_eq!(config.remote.metadata, "/meta.data");
        assert_eq!(config.cache.chunks, 4);
        assert_eq!(config.cache.chunk_size, 4096);
        assert_eq!(config.remote.reload_interval_secs, 30);
        assert!(config.mount.exec_files);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_survive_when_flags_absent() {
        let cli = Cli::try_parse_from(["httpfs", "http://example.org", "/mnt"]).unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.remote.metadata, "/description.data");
        assert_eq!(config.cache.chunks, 1);
        assert!(!config.mount.exec_files);
    }

    #[test]
    fn test_out_of_range_chunks_rejected() {
        let cli = Cli::try_parse_from(["httpfs", "http://example.org", "/mnt", "-c", "9"]).unwrap();
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(config.validate().is_err());
    }
}
