//! Retriever and store configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::{DEFAULT_CHUNK_SIZE, DEFAULT_COST_PER_UNIT};
use crate::error::{FeedError, Result};

// ============================================================================
// Store Read Policy
// ============================================================================

/// What a bulk read does when a requested key is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    /// Any miss fails the whole batch with `FeedError::DataLoss`.
    FailBatch,
    /// Misses are recorded and the record is treated as absent.
    Skip,
}

/// Byte order used to encode example IDs into store keys.
///
/// Stores built on little-endian hosts by reinterpreting the in-memory `u32`
/// use `Little`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyByteOrder {
    #[default]
    Little,
    Big,
}

// ============================================================================
// Store Options
// ============================================================================

/// RocksDB tuning used when opening a store read-only. None of these change
/// what a read returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Uncompressed block cache size in bytes.
    pub block_cache_bytes: usize,
    /// Bloom filter bits per key.
    pub bloom_bits_per_key: f64,
    /// Block size in bytes.
    pub block_size: usize,
    /// Keep index and filter blocks in the block cache.
    pub cache_index_and_filter_blocks: bool,
    /// `-1` keeps every table file open.
    pub max_open_files: i32,
    /// Period for dumping RocksDB statistics to its LOG, `0` disables.
    pub stats_dump_period_sec: u32,
    /// Verify block checksums on every read.
    pub verify_checksums: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_cache_bytes: 1024 * 1024 * 1024,
            bloom_bits_per_key: 10.0,
            block_size: 4 * 1024,
            cache_index_and_filter_blocks: true,
            max_open_files: -1,
            stats_dump_period_sec: 10,
            verify_checksums: true,
        }
    }
}

// ============================================================================
// Retriever Config
// ============================================================================

/// Construction-time parameters of a retriever instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Path to the examples store (keyed by encoded example ID).
    pub examples_db: PathBuf,
    /// Path to the common-features store (keyed by common reference).
    pub comm_feats_db: PathBuf,
    /// Path to the vocabulary file.
    pub vocab: PathBuf,
    /// Feature slots per output row.
    pub max_feats: usize,
    /// Examples per parallel work unit.
    pub chunk_size: usize,
    /// Estimated cost of one work unit, used to group units into tasks.
    pub cost_per_unit: u64,
    /// Size of a dedicated worker pool. `None` uses the global rayon pool.
    pub num_threads: Option<usize>,
    pub key_byte_order: KeyByteOrder,
    pub examples_miss_policy: MissPolicy,
    pub comm_feats_miss_policy: MissPolicy,
    pub store: StoreOptions,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            examples_db: PathBuf::new(),
            comm_feats_db: PathBuf::new(),
            vocab: PathBuf::new(),
            max_feats: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cost_per_unit: DEFAULT_COST_PER_UNIT,
            num_threads: None,
            key_byte_order: KeyByteOrder::Little,
            examples_miss_policy: MissPolicy::FailBatch,
            comm_feats_miss_policy: MissPolicy::Skip,
            store: StoreOptions::default(),
        }
    }
}

impl RetrieverConfig {
    pub fn new(
        examples_db: impl Into<PathBuf>,
        comm_feats_db: impl Into<PathBuf>,
        max_feats: usize,
        vocab: impl Into<PathBuf>,
    ) -> Self {
        Self {
            examples_db: examples_db.into(),
            comm_feats_db: comm_feats_db.into(),
            vocab: vocab.into(),
            max_feats,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: RetrieverConfig = serde_json::from_slice(&bytes).map_err(|e| {
            FeedError::Configuration(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every required parameter. Store paths and the vocabulary path
    /// are only checked for presence here; opening them happens later.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("examples_db", &self.examples_db),
            ("comm_feats_db", &self.comm_feats_db),
            ("vocab", &self.vocab),
        ] {
            if path.as_os_str().is_empty() {
                return Err(FeedError::Configuration(format!("{name} is required")));
            }
        }
        self.validate_dispatch()
    }

    /// Checks that only concern the materializer.
    pub(crate) fn validate_dispatch(&self) -> Result<()> {
        if self.max_feats == 0 {
            return Err(FeedError::Configuration(
                "max_feats must be positive".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(FeedError::Configuration(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.cost_per_unit == 0 {
            return Err(FeedError::Configuration(
                "cost_per_unit must be positive".to_string(),
            ));
        }
        if self.num_threads == Some(0) {
            return Err(FeedError::Configuration(
                "num_threads must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}
