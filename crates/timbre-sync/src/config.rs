use anyhow::{Context, Result};
use confyg::{env, Confygery};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use timbre_core::{AssetCatalog, BlobStore, ContentCache, FsBlobStore};
use timbre_search::{BusyPolicy, EmbeddingIndex, IndexConfig, Metric};

use crate::coordinator::ConsistencyCoordinator;

/// Configuration for timbre.
///
/// Configuration is loaded from multiple sources with the following priority:
/// 1. CLI arguments (highest priority)
/// 2. Environment variables (TIMBRE_* prefix)
/// 3. Config file (~/.config/timbre/config.toml)
/// 4. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite asset catalog.
    ///
    /// Can be set via:
    /// - CLI: --db /path/to/db
    /// - ENV: TIMBRE_DATABASE_PATH
    /// - Default: ~/.local/share/timbre/timbre.db
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,

    /// Where the embedding index snapshot is kept between runs.
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Root directory of the filesystem blob store.
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,

    #[serde(default = "default_dimension")]
    pub embedding_dimension: usize,

    #[serde(default)]
    pub metric: Metric,

    /// Behaviour of index operations while a rebuild is running.
    #[serde(default)]
    pub busy_policy: BusyPolicy,

    /// Upper bound on a single index rebuild, in seconds. Unset means no limit.
    #[serde(default)]
    pub rebuild_timeout_secs: Option<u64>,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub logging: twyg::Opts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            index_path: default_index_path(),
            blob_root: default_blob_root(),
            embedding_dimension: default_dimension(),
            metric: Metric::default(),
            busy_policy: BusyPolicy::default(),
            rebuild_timeout_secs: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            logging: twyg::Opts::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        let mut builder = Confygery::new().context("Failed to create config builder")?;

        if config_path.exists() {
            let path_str = config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?;
            builder
                .add_file(path_str)
                .context("Failed to load config file")?;
        }

        builder
            .add_env(env::Options::with_top_level("timbre"))
            .context("Failed to load environment variables")?;

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?;

        Ok(config)
    }

    /// Load configuration, overriding the catalog path (the --db flag).
    pub fn load_with_db_path(db_path: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::load()?;
        if let Some(db_path) = db_path {
            config.database_path = db_path;
        }
        Ok(config)
    }

    pub fn index_config(&self) -> IndexConfig {
        let config = IndexConfig::new(self.embedding_dimension)
            .with_metric(self.metric)
            .with_busy_policy(self.busy_policy);
        match self.rebuild_timeout_secs {
            Some(secs) => config.with_rebuild_timeout(Duration::from_secs(secs)),
            None => config,
        }
    }

    /// Open every store named by this configuration.
    pub fn open_coordinator(&self) -> Result<ConsistencyCoordinator> {
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let catalog = AssetCatalog::open(&self.database_path).with_context(|| {
            format!("Failed to open catalog {}", self.database_path.display())
        })?;
        let index = EmbeddingIndex::load_or_new(&self.index_path, self.index_config())
            .with_context(|| format!("Failed to load index {}", self.index_path.display()))?;
        let cache = ContentCache::new(Duration::from_secs(self.cache_ttl_secs));
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&self.blob_root));

        Ok(ConsistencyCoordinator::new(
            Arc::new(catalog),
            Arc::new(index),
            Arc::new(cache),
            blobs,
        ))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("timbre")
}

fn default_db_path() -> PathBuf {
    data_dir().join("timbre.db")
}

fn default_index_path() -> PathBuf {
    data_dir().join("embeddings.idx.gz")
}

fn default_blob_root() -> PathBuf {
    data_dir().join("blobs")
}

fn default_dimension() -> usize {
    384
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// Returns:
/// - Linux: ~/.config/timbre/config.toml
/// - macOS: ~/Library/Application Support/timbre/config.toml
/// - Windows: %APPDATA%\timbre\config.toml
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("timbre")
        .join("config.toml")
}

pub fn example_config() -> &'static str {
    r#"# Timbre Configuration File
#
# Configuration is loaded from multiple sources with the following priority:
# 1. CLI arguments (highest priority)
# 2. Environment variables (TIMBRE_* prefix)
# 3. This config file
# 4. Built-in defaults (lowest priority)

# Path to the SQLite asset catalog
#
# Can also be set via:
# - CLI: timbre --db /custom/path.db status
# - Environment: TIMBRE_DATABASE_PATH=/custom/path.db
#database_path = "/path/to/timbre.db"

# Embedding index snapshot, rewritten after every mutating command
#index_path = "/path/to/embeddings.idx.gz"

# Root directory that asset locations are resolved against
#blob_root = "/path/to/blobs"

# Every admitted vector must have exactly this many components
embedding_dimension = 384

# "cosine" or "euclidean"
metric = "cosine"

# While the index rebuilds, "wait" queues callers and "fail_fast" rejects them
busy_policy = "wait"

# Abort an index rebuild that takes longer than this many seconds
#rebuild_timeout_secs = 300

# How long cached payloads stay valid, in seconds
cache_ttl_secs = 86400
"#
}

/// Create default config file if it doesn't exist.
///
/// Returns true if a new file was created, false if it already existed.
pub fn ensure_config_file() -> Result<bool> {
    let config_path = config_file_path();

    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    std::fs::write(&config_path, example_config()).context("Failed to write config file")?;

    Ok(true)
}
