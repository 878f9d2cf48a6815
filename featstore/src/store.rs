//! Key-value store access: read-only RocksDB handles, an in-memory store with
//! the same contract, and the bulk reader that applies a [`MissPolicy`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rocksdb::{BlockBasedOptions, Cache, DB, DBCompressionType, Options, ReadOptions, WriteBatch};
use tracing::{debug, info};

use crate::config::{MissPolicy, StoreOptions};
use crate::error::{FeedError, Result, StoreRole, hex_key};

// ============================================================================
// Store Contract
// ============================================================================

/// Point-lookup contract of a backing store.
///
/// `multi_get` returns exactly one result per key, in key order. `Ok(None)`
/// is a miss; `Err` is a store failure for that key.
pub trait KvStore: Send + Sync {
    fn multi_get(&self, keys: &[&[u8]]) -> Vec<Result<Option<Vec<u8>>>>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// RocksDB
// ============================================================================

/// A RocksDB database opened read-only for the lifetime of the handle.
///
/// Reads never mutate the handle, so one instance is shared across
/// concurrent batch calls without locking.
pub struct RocksStore {
    db: DB,
    path: PathBuf,
    verify_checksums: bool,
}

impl RocksStore {
    pub fn open_read_only(path: &Path, options: &StoreOptions) -> Result<Self> {
        let opts = db_options(options, false);
        let db = DB::open_for_read_only(&opts, path, false).map_err(|e| {
            FeedError::Configuration(format!("failed to open store {}: {e}", path.display()))
        })?;
        info!("Opened store {} (read-only)", path.display());
        Ok(Self {
            db,
            path: path.to_path_buf(),
            verify_checksums: options.verify_checksums,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KvStore for RocksStore {
    fn multi_get(&self, keys: &[&[u8]]) -> Vec<Result<Option<Vec<u8>>>> {
        let mut read_opts = ReadOptions::default();
        read_opts.set_verify_checksums(self.verify_checksums);
        self.db
            .multi_get_opt(keys.iter().copied(), &read_opts)
            .into_iter()
            .map(|r| r.map_err(FeedError::from))
            .collect()
    }

    fn describe(&self) -> String {
        format!("rocksdb:{}", self.path.display())
    }
}

fn db_options(options: &StoreOptions, writable: bool) -> Options {
    let cache = Cache::new_lru_cache(options.block_cache_bytes);
    let mut table_opts = BlockBasedOptions::default();
    table_opts.set_block_cache(&cache);
    table_opts.set_cache_index_and_filter_blocks(options.cache_index_and_filter_blocks);
    table_opts.set_bloom_filter(options.bloom_bits_per_key, false);
    table_opts.set_block_size(options.block_size);

    let mut opts = Options::default();
    opts.create_if_missing(writable);
    opts.set_max_open_files(options.max_open_files);
    opts.set_compression_type(DBCompressionType::Zlib);
    if options.stats_dump_period_sec > 0 {
        opts.enable_statistics();
        opts.set_stats_dump_period_sec(options.stats_dump_period_sec);
    }
    opts.set_block_based_table_factory(&table_opts);
    opts
}

/// Buffered writer used by the offline builder and by tests that need a real
/// store on disk.
pub struct StoreWriter {
    db: DB,
    batch: WriteBatch,
    batch_size: usize,
    written: u64,
    bytes: u64,
}

impl StoreWriter {
    /// Open (creating if needed) a store for writing. Records are flushed
    /// every `batch_size` puts.
    pub fn create(path: &Path, options: &StoreOptions, batch_size: usize) -> Result<Self> {
        let mut opts = db_options(options, true);
        opts.set_max_write_buffer_number(3);
        opts.set_target_file_size_base(64 * 1024 * 1024);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            batch: WriteBatch::default(),
            batch_size: batch_size.max(1),
            written: 0,
            bytes: 0,
        })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.batch.put(key, value);
        self.written += 1;
        self.bytes += (key.len() + value.len()) as u64;
        if self.batch.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.batch.is_empty() {
            let batch = std::mem::take(&mut self.batch);
            self.db.write(batch)?;
        }
        Ok(())
    }

    /// Records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Key plus value bytes written so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(mut self) -> Result<u64> {
        self.flush()?;
        self.db.flush()?;
        Ok(self.written)
    }
}

// ============================================================================
// In-memory Store
// ============================================================================

/// Ordered in-memory store with the same contract as [`RocksStore`].
#[derive(Default)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    bulk_reads: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of `multi_get` calls served.
    pub fn bulk_reads(&self) -> usize {
        self.bulk_reads.load(Ordering::Relaxed)
    }
}

impl KvStore for MemStore {
    fn multi_get(&self, keys: &[&[u8]]) -> Vec<Result<Option<Vec<u8>>>> {
        self.bulk_reads.fetch_add(1, Ordering::Relaxed);
        keys.iter()
            .map(|k| Ok(self.entries.get(*k).cloned()))
            .collect()
    }

    fn describe(&self) -> String {
        format!("memory:{} entries", self.entries.len())
    }
}

// ============================================================================
// Bulk Reader
// ============================================================================

/// Outcome of one bulk read: one slot per requested key, in request order.
#[derive(Debug)]
pub struct BulkRead {
    values: Vec<Option<Vec<u8>>>,
    misses: usize,
}

impl BulkRead {
    pub fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    pub fn get(&self, i: usize) -> Option<&[u8]> {
        self.values.get(i).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys that were absent and skipped.
    pub fn misses(&self) -> usize {
        self.misses
    }
}

/// Resolve `keys` against `store` with a single bulk get.
///
/// A store error on any key fails the read regardless of `policy`; there is
/// no retry. A miss fails the read with [`FeedError::DataLoss`] under
/// [`MissPolicy::FailBatch`] and leaves an empty slot under [`MissPolicy::Skip`].
pub fn bulk_get(
    store: &dyn KvStore,
    role: StoreRole,
    keys: &[&[u8]],
    policy: MissPolicy,
) -> Result<BulkRead> {
    if keys.is_empty() {
        return Ok(BulkRead {
            values: Vec::new(),
            misses: 0,
        });
    }

    let start = Instant::now();
    let results = store.multi_get(keys);
    if results.len() != keys.len() {
        return Err(FeedError::corrupt(format!(
            "{role} store returned {} results for {} keys",
            results.len(),
            keys.len()
        )));
    }

    let mut values = Vec::with_capacity(keys.len());
    let mut misses = 0usize;
    for (key, result) in keys.iter().zip(results) {
        match result? {
            Some(bytes) => values.push(Some(bytes)),
            None => match policy {
                MissPolicy::FailBatch => {
                    return Err(FeedError::DataLoss {
                        store: role,
                        key: hex_key(key),
                    });
                }
                MissPolicy::Skip => {
                    debug!("{role} store miss: key = {}", hex_key(key));
                    misses += 1;
                    values.push(None);
                }
            },
        }
    }

    debug!(
        "bulk_get {role}: {} keys, {} misses in {} us",
        keys.len(),
        misses,
        start.elapsed().as_micros()
    );
    Ok(BulkRead { values, misses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FeedErrorKind;

    fn store_with(keys: &[&str]) -> MemStore {
        let mut store = MemStore::new();
        for k in keys {
            store.insert(k.as_bytes(), format!("v:{k}"));
        }
        store
    }

    fn key_list<'a>(keys: &[&'a str]) -> Vec<&'a [u8]> {
        keys.iter().map(|k| k.as_bytes()).collect()
    }

    #[test]
    fn test_bulk_get_preserves_order() {
        let store = store_with(&["a", "b", "c"]);
        let keys = key_list(&["c", "a", "b"]);
        let read = bulk_get(&store, StoreRole::Examples, &keys, MissPolicy::FailBatch).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read.get(0), Some(&b"v:c"[..]));
        assert_eq!(read.get(1), Some(&b"v:a"[..]));
        assert_eq!(read.get(2), Some(&b"v:b"[..]));
        assert_eq!(read.misses(), 0);
        assert_eq!(store.bulk_reads(), 1);
    }

    #[test]
    fn test_fail_batch_names_missing_key() {
        let store = store_with(&["a"]);
        let missing = 42u32.to_le_bytes();
        let keys: Vec<&[u8]> = vec![&b"a"[..], &missing[..]];
        let err = bulk_get(&store, StoreRole::Examples, &keys, MissPolicy::FailBatch).unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::DataLoss);
        match err {
            FeedError::DataLoss { store, key } => {
                assert_eq!(store, StoreRole::Examples);
                assert_eq!(key, "2a000000");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_skip_records_misses() {
        let store = store_with(&["a", "c"]);
        let keys = key_list(&["a", "b", "c", "d"]);
        let read = bulk_get(&store, StoreRole::CommFeats, &keys, MissPolicy::Skip).unwrap();
        assert_eq!(read.len(), 4);
        assert!(read.get(0).is_some());
        assert!(read.get(1).is_none());
        assert!(read.get(2).is_some());
        assert!(read.get(3).is_none());
        assert_eq!(read.misses(), 2);
    }

    #[test]
    fn test_empty_key_set_skips_store() {
        let store = MemStore::new();
        let read = bulk_get(&store, StoreRole::CommFeats, &[], MissPolicy::FailBatch).unwrap();
        assert!(read.is_empty());
        assert_eq!(store.bulk_reads(), 0);
    }

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn multi_get(&self, keys: &[&[u8]]) -> Vec<Result<Option<Vec<u8>>>> {
            keys.iter()
                .map(|_| {
                    Err(FeedError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "disk stalled",
                    )))
                })
                .collect()
        }

        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[test]
    fn test_store_error_fails_even_when_skipping() {
        let keys = key_list(&["a"]);
        let err = bulk_get(&BrokenStore, StoreRole::CommFeats, &keys, MissPolicy::Skip).unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::Io);
    }

    #[test]
    fn test_rocks_store_policies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let options = StoreOptions {
            block_cache_bytes: 8 * 1024 * 1024,
            stats_dump_period_sec: 0,
            ..StoreOptions::default()
        };

        let mut writer = StoreWriter::create(&path, &options, 2).unwrap();
        writer.put(&7u32.to_le_bytes(), b"seven").unwrap();
        writer.put(&42u32.to_le_bytes(), b"forty-two").unwrap();
        writer.put(&9u32.to_le_bytes(), b"nine").unwrap();
        assert_eq!(writer.finish().unwrap(), 3);

        let store = RocksStore::open_read_only(&path, &options).unwrap();
        let k42 = 42u32.to_le_bytes();
        let k7 = 7u32.to_le_bytes();
        let k8 = 8u32.to_le_bytes();

        let keys: Vec<&[u8]> = vec![&k42[..], &k7[..]];
        let read = bulk_get(&store, StoreRole::Examples, &keys, MissPolicy::FailBatch).unwrap();
        assert_eq!(read.get(0), Some(&b"forty-two"[..]));
        assert_eq!(read.get(1), Some(&b"seven"[..]));

        let keys: Vec<&[u8]> = vec![&k7[..], &k8[..]];
        let err = bulk_get(&store, StoreRole::Examples, &keys, MissPolicy::FailBatch).unwrap_err();
        assert!(err.to_string().contains("08000000"));

        let read = bulk_get(&store, StoreRole::Examples, &keys, MissPolicy::Skip).unwrap();
        assert_eq!(read.get(0), Some(&b"seven"[..]));
        assert!(read.get(1).is_none());
        assert_eq!(read.misses(), 1);
    }

    #[test]
    fn test_open_missing_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = RocksStore::open_read_only(&dir.path().join("absent"), &StoreOptions::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), FeedErrorKind::Configuration);
    }
}
