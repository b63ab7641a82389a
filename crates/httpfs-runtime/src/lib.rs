//! # httpfs-runtime
//!
//! The shared state behind the mounted filesystem: the current tree
//! index, the cache pool, the metadata update loop and the virtual
//! status files.
//!
//! [`Store`] is the single object the filesystem adapter talks to. It
//! owns the tree behind a read-write lock so lookups keep serving while
//! a metadata reload swaps in a new generation, and it folds cache and
//! transport failures into errno-shaped errors for the adapter.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use httpfs_cache::{CacheConfig, CacheError, CachePool};
use httpfs_fetch::{HttpSource, RangeSource};
use httpfs_tree::{Node, NodeKind, Tree};

pub mod stats;

use stats::Stats;

/// Virtual-content tags carried by special metadata entries.
pub mod tag {
    /// Current server-side time at each read.
    pub const TIME: u32 = 1;
    /// Outcome of the most recent metadata update check.
    pub const UPDATE_STATUS: u32 = 2;
    /// Remote site this mount exports.
    pub const MOUNT_INFO: u32 = 3;
    /// Version banner.
    pub const VERSION: u32 = 4;
    /// Operation counters.
    pub const STATS: u32 = 5;
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no such path: {0}")]
    NotFound(String),

    #[error("not a readable file: {0}")]
    NotRegular(String),

    #[error("unsupported virtual file tag {0}")]
    Unsupported(u32),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Source of the metadata document for update checks.
pub trait MetadataSource: Send + Sync {
    fn fetch(&self) -> httpfs_fetch::Result<String>;
}

/// The production metadata source: one document at a fixed
/// server-relative path.
pub struct HttpMetadata {
    source: HttpSource,
    rel_path: String,
}

impl HttpMetadata {
    pub fn new(source: HttpSource, rel_path: &str) -> HttpMetadata {
        HttpMetadata {
            source,
            rel_path: rel_path.to_string(),
        }
    }
}

impl MetadataSource for HttpMetadata {
    fn fetch(&self) -> httpfs_fetch::Result<String> {
        self.source.fetch_metadata(&self.rel_path)
    }
}

/// Which step of an update check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailStage {
    /// Fetching the metadata document.
    Connect,
    /// Reading its generation header.
    Metadata,
    /// Rebuilding the tree.
    Tree,
}

impl FailStage {
    fn as_str(self) -> &'static str {
        match self {
            FailStage::Connect => "connect",
            FailStage::Metadata => "metadata",
            FailStage::Tree => "tree rebuild",
        }
    }
}

/// Outcome of the most recent update check, shown by the update-status
/// virtual file.
#[derive(Debug, Clone)]
pub enum UpdateState {
    Never,
    UpToDate { at: DateTime<Utc> },
    Updated { generation: u64, at: DateTime<Utc> },
    Failed { stage: FailStage, error: String, at: DateTime<Utc> },
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateState::Never => write!(f, "no update check yet"),
            UpdateState::UpToDate { at } => write!(f, "up to date, checked {}", at.to_rfc3339()),
            UpdateState::Updated { generation, at } => {
                write!(f, "reloaded generation {} at {}", generation, at.to_rfc3339())
            }
            UpdateState::Failed { stage, error, at } => {
                write!(f, "{} failed at {}: {}", stage.as_str(), at.to_rfc3339(), error)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Line shown by the mount-info virtual file.
    pub mount_info: String,
    /// Minimum spacing between metadata freshness checks.
    pub reload_interval: Duration,
    pub cache: CacheConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            mount_info: String::new(),
            reload_interval: Duration::from_secs(60),
            cache: CacheConfig::default(),
        }
    }
}

/// Shared mount state. All methods take `&self`; internal locking keeps
/// tree swaps, cache churn and status updates consistent.
pub struct Store {
    tree: RwLock<Tree>,
    pool: CachePool,
    metadata: Box<dyn MetadataSource>,
    reload_interval: Duration,
    last_check: Mutex<Instant>,
    status: Mutex<UpdateState>,
    stats: Stats,
    mount_info: String,
}

impl Store {
    pub fn new(
        tree: Tree,
        metadata: Box<dyn MetadataSource>,
        source: Box<dyn RangeSource>,
        options: StoreOptions,
    ) -> Store {
        Store {
            tree: RwLock::new(tree),
            pool: CachePool::new(options.cache, source),
            metadata,
            reload_interval: options.reload_interval,
            last_check: Mutex::new(Instant::now()),
            status: Mutex::new(UpdateState::Never),
            stats: Stats::default(),
            mount_info: options.mount_info,
        }
    }

    /// Run `f` against the current tree under the read lock. Lookups and
    /// directory listings go through here; the closure must not block on
    /// remote fetches.
    pub fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.tree.read().unwrap())
    }

    pub fn generation(&self) -> u64 {
        self.tree.read().unwrap().generation()
    }

    /// Resolve `path` to a snapshot of its entry.
    pub fn lookup(&self, path: &str) -> Option<Node> {
        let tree = self.tree.read().unwrap();
        tree.resolve(path).map(|id| tree.node(id).clone())
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn pool(&self) -> &CachePool {
        &self.pool
    }

    /// Prepare `path` for reading. Directories, special entries and
    /// empty files need no cache; everything else gets its cache (and
    /// bound connection) created now so open reports remote failures
    /// instead of the first read.
    ///
    /// The tree read guard stays held across the pool call: reload
    /// destroys caches and swaps the tree under the write lock, so no
    /// cache can be bound to an outgoing tree's size or path.
    pub fn open(&self, path: &str) -> Result<()> {
        let tree = self.tree.read().unwrap();
        let facts = Self::facts_of(&tree, path)?;
        self.stats.record_open();
        if facts.kind == NodeKind::Directory || facts.special != 0 || facts.size == 0 {
            return Ok(());
        }
        self.pool.ensure(&facts.full_path, facts.size)?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`. Loops over the cache until
    /// the request is filled or end of file; a short result means EOF.
    /// Holds the tree read guard for the whole loop, like [`Store::open`].
    pub fn read_at(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let tree = self.tree.read().unwrap();
        let facts = Self::facts_of(&tree, path)?;
        if facts.kind != NodeKind::RegularFile {
            return Err(StoreError::NotRegular(facts.full_path));
        }
        if facts.special != 0 {
            // Virtual content never touches the pool and the stats
            // rendering takes its own read of the tree.
            drop(tree);
            let data = self.special_read(facts.special, offset, len)?;
            self.stats.record_read(data.len());
            return Ok(data);
        }
        let mut out = Vec::new();
        let mut offset = offset;
        while out.len() < len {
            let part = self
                .pool
                .read(facts.size, &facts.full_path, offset, len - out.len())?;
            if part.is_empty() {
                break;
            }
            offset += part.len() as u64;
            out.extend_from_slice(&part);
        }
        self.stats.record_read(out.len());
        Ok(out)
    }

    /// Drop the cache for `path` and give the metadata document a chance
    /// to refresh. Called on file close.
    pub fn release(&self, path: &str) {
        {
            let tree = self.tree.read().unwrap();
            if let Ok(facts) = Self::facts_of(&tree, path) {
                self.pool.destroy(&facts.full_path);
            }
        }
        // The guard must be gone here: reload takes the write lock.
        self.maybe_reload();
    }

    /// Rate-limited update check: at most one remote fetch per reload
    /// interval. Returns whether a check actually ran. Failures keep the
    /// last good tree and are reported through the status file only.
    pub fn maybe_reload(&self) -> bool {
        {
            let mut last = self.last_check.lock().unwrap();
            if last.elapsed() < self.reload_interval {
                return false;
            }
            *last = Instant::now();
        }
        self.reload();
        true
    }

    fn reload(&self) {
        let doc = match self.metadata.fetch() {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "metadata fetch failed, keeping current tree");
                self.fail_check(FailStage::Connect, e.to_string());
                return;
            }
        };
        let current = self.generation();
        let remote = match Tree::peek_generation(&doc) {
            Ok(generation) => generation,
            Err(e) => {
                warn!(error = %e, "metadata document unreadable, keeping current tree");
                self.fail_check(FailStage::Metadata, e.to_string());
                return;
            }
        };
        // Only a strictly newer document replaces the tree.
        if remote <= current {
            debug!(current, remote, "metadata unchanged");
            *self.status.lock().unwrap() = UpdateState::UpToDate { at: Utc::now() };
            return;
        }

        // Parse outside the lock; a malformed document must not cost
        // the live caches anything.
        let tree = match Tree::parse(doc.as_bytes()) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(error = %e, "metadata document malformed, keeping current tree");
                self.fail_check(FailStage::Tree, e.to_string());
                return;
            }
        };
        {
            let mut current = self.tree.write().unwrap();
            // Re-check under the exclusive lock: a concurrent check may
            // have already swapped in something at least as new.
            if tree.generation() <= current.generation() {
                *self.status.lock().unwrap() = UpdateState::UpToDate { at: Utc::now() };
                return;
            }
            info!(
                generation = tree.generation(),
                entries = tree.len(),
                "tree reloaded"
            );
            // In-flight serves hold the read lock, so between here and
            // the swap no read can bind a cache to the outgoing tree.
            // Cached sizes and paths belong to that tree; drop them
            // before it goes.
            self.pool.destroy_all();
            *current = tree;
        }
        *self.status.lock().unwrap() = UpdateState::Updated {
            generation: remote,
            at: Utc::now(),
        };
        self.stats.record_reload();
    }

    fn fail_check(&self, stage: FailStage, error: String) {
        self.stats.record_failed_check();
        *self.status.lock().unwrap() = UpdateState::Failed {
            stage,
            error,
            at: Utc::now(),
        };
    }

    /// Render a virtual file. These are one-shot reads: any nonzero
    /// offset means the content was already delivered, so EOF.
    fn special_read(&self, tag: u32, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset > 0 {
            return Ok(Vec::new());
        }
        let text = match tag {
            tag::TIME => format!("{}\n", Utc::now().to_rfc2822()),
            tag::UPDATE_STATUS => format!("{}\n", *self.status.lock().unwrap()),
            tag::MOUNT_INFO => format!("{}\n", self.mount_info),
            tag::VERSION => format!("httpfs version {}\n", env!("CARGO_PKG_VERSION")),
            tag::STATS => self.render_stats(),
            other => {
                warn!(tag = other, "unknown special tag");
                return Err(StoreError::Unsupported(other));
            }
        };
        let mut data = text.into_bytes();
        data.truncate(len);
        Ok(data)
    }

    fn render_stats(&self) -> String {
        format!(
            "getattrs: {}\nreads: {}\nreaddirs: {}\nbytes served: {}\nopens: {}\nlive caches: {}\ntree reloads: {}\nfailed checks: {}\ngeneration: {}\n",
            self.stats.getattrs(),
            self.stats.reads(),
            self.stats.readdirs(),
            self.stats.bytes_served(),
            self.stats.opens(),
            self.pool.live(),
            self.stats.reloads(),
            self.stats.failed_checks(),
            self.generation(),
        )
    }

    fn facts_of(tree: &Tree, path: &str) -> Result<Facts> {
        let id = tree
            .resolve(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let node = tree.node(id);
        Ok(Facts {
            full_path: node.full_path.clone(),
            size: node.size,
            special: node.special,
            kind: node.kind,
        })
    }
}

/// Snapshot of the node fields a serve operation needs. The caller keeps
/// the tree read guard held while acting on it, so the fields cannot go
/// stale against a concurrent reload.
struct Facts {
    full_path: String,
    size: u64,
    special: u32,
    kind: NodeKind,
}
