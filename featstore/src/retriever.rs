//! Batched retrieval: example IDs in, dense feature batch out.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexSet;
use ndarray::ArrayViewD;
use tracing::{debug, info, warn};

use crate::common::ExampleId;
use crate::config::RetrieverConfig;
use crate::error::{FeedError, Result, StoreRole};
use crate::keys::KeyEncoder;
use crate::materialize::{FeatureBatch, Materializer, MergeJob};
use crate::record::{CommFeatureView, ExampleView, parse_comm_feature, parse_example};
use crate::store::{KvStore, RocksStore, bulk_get};
use crate::vocab::{FieldInfoColumns, Vocabulary};

/// Long-lived retrieval instance: the vocabulary, both store handles and the
/// worker pool are created once and shared read-only by every batch call.
pub struct FeatureRetriever {
    config: RetrieverConfig,
    keys: KeyEncoder,
    vocab: Vocabulary,
    examples: Arc<dyn KvStore>,
    comm_feats: Arc<dyn KvStore>,
    materializer: Materializer,
}

impl FeatureRetriever {
    /// Validate `config`, load the vocabulary and open both stores read-only.
    /// Any failure aborts construction.
    pub fn open(config: RetrieverConfig) -> Result<Self> {
        config.validate()?;
        let vocab = Vocabulary::load(&config.vocab)?;
        let examples = RocksStore::open_read_only(&config.examples_db, &config.store)?;
        let comm_feats = RocksStore::open_read_only(&config.comm_feats_db, &config.store)?;
        Self::from_parts(config, vocab, Arc::new(examples), Arc::new(comm_feats))
    }

    /// Assemble a retriever from already-open collaborators. Store and
    /// vocabulary paths in `config` are not consulted.
    pub fn from_parts(
        config: RetrieverConfig,
        vocab: Vocabulary,
        examples: Arc<dyn KvStore>,
        comm_feats: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let materializer = Materializer::new(&config)?;
        info!(
            "Retriever ready: examples={}, comm_feats={}, max_feats={}, chunk_size={}",
            examples.describe(),
            comm_feats.describe(),
            config.max_feats,
            config.chunk_size
        );
        Ok(Self {
            keys: KeyEncoder::new(config.key_byte_order),
            config,
            vocab,
            examples,
            comm_feats,
            materializer,
        })
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn max_feats(&self) -> usize {
        self.config.max_feats
    }

    /// Host step entry point. `ids` must be one-dimensional and every value
    /// must fit in a `u32`.
    pub fn compute(&self, ids: ArrayViewD<'_, i64>) -> Result<FeatureBatch> {
        if ids.ndim() != 1 {
            return Err(FeedError::InvalidInput(format!(
                "example_ids must be 1-D, got shape {:?}",
                ids.shape()
            )));
        }
        let ids = ids
            .iter()
            .map(|&v| {
                u32::try_from(v)
                    .map(ExampleId)
                    .map_err(|_| FeedError::InvalidInput(format!("example id {v} out of range")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.retrieve(&ids)
    }

    /// Fetch, merge and materialize one batch. Row `i` of the result belongs
    /// to `ids[i]`. Nothing is cached between calls.
    pub fn retrieve(&self, ids: &[ExampleId]) -> Result<FeatureBatch> {
        let start = Instant::now();

        // Phase 1: examples
        let example_keys: Vec<_> = ids.iter().map(|&id| self.keys.example_key(id)).collect();
        let example_key_refs: Vec<&[u8]> = example_keys.iter().map(|k| &k[..]).collect();
        let example_read = bulk_get(
            self.examples.as_ref(),
            StoreRole::Examples,
            &example_key_refs,
            self.config.examples_miss_policy,
        )?;
        let examples = example_read
            .values()
            .iter()
            .zip(ids)
            .map(|(bytes, &id)| {
                let Some(bytes) = bytes else {
                    return Ok(None);
                };
                let view = parse_example(bytes)?;
                if view.example_id() != id {
                    warn!(
                        "example record for id {} carries id {}",
                        id.0,
                        view.example_id().0
                    );
                }
                Ok(Some(view))
            })
            .collect::<Result<Vec<Option<ExampleView<'_>>>>>()?;
        let examples_us = start.elapsed().as_micros();

        // Phase 2: common features, one read per distinct reference
        let comm_start = Instant::now();
        let comm_refs: IndexSet<&str> = examples
            .iter()
            .flatten()
            .map(|ex| ex.comm_ref())
            .filter(|r| !r.is_empty())
            .collect();
        let comm_keys: Vec<&[u8]> = comm_refs.iter().map(|r| self.keys.common_key(r)).collect();
        let comm_read = bulk_get(
            self.comm_feats.as_ref(),
            StoreRole::CommFeats,
            &comm_keys,
            self.config.comm_feats_miss_policy,
        )?;
        let commons = comm_read
            .values()
            .iter()
            .zip(&comm_refs)
            .map(|(bytes, &requested)| {
                let Some(bytes) = bytes else {
                    return Ok(None);
                };
                let view = parse_comm_feature(bytes)?;
                if view.comm_ref() != requested {
                    warn!(
                        "common record requested as {requested:?} carries reference {:?}",
                        view.comm_ref()
                    );
                }
                Ok(Some(view))
            })
            .collect::<Result<Vec<Option<CommFeatureView<'_>>>>>()?;
        let comm_us = comm_start.elapsed().as_micros();

        // Phase 3: merge and materialize
        let jobs: Vec<MergeJob<'_>> = examples
            .iter()
            .map(|ex| {
                let example = ex.as_ref();
                let common = example
                    .and_then(|e| comm_refs.get_index_of(e.comm_ref()))
                    .and_then(|i| commons[i].as_ref());
                MergeJob { example, common }
            })
            .collect();
        let batch = self.materializer.materialize(&jobs, &self.vocab)?;

        debug!(
            "retrieve: {} ids ({} skipped), {} common refs ({} missing); \
             examples {examples_us} us, comm_feats {comm_us} us, total {} us",
            ids.len(),
            example_read.misses(),
            comm_refs.len(),
            comm_read.misses(),
            start.elapsed().as_micros()
        );
        Ok(batch)
    }
}

/// Diagnostic columns for every field in the vocabulary at `vocab_path`.
pub fn field_info(vocab_path: &Path) -> Result<FieldInfoColumns> {
    Ok(Vocabulary::load(vocab_path)?.field_info_columns())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FeatKey, Feature, FieldKey, VocabId};
    use crate::config::MissPolicy;
    use crate::error::FeedErrorKind;
    use crate::record::{CommFeatureRecord, ExampleRecord, RecordFeatures};
    use crate::store::MemStore;
    use crate::vocab::{FieldInfo, VocabEntry, write_vocabulary};
    use ndarray::{Array, IxDyn};

    struct Fixture {
        examples: Arc<MemStore>,
        comm_feats: Arc<MemStore>,
    }

    fn vocab() -> Vocabulary {
        let entries = (1..=20).map(|feat| VocabEntry {
            field: FieldKey(10100),
            feat: FeatKey(feat),
            vocab_id: VocabId(feat * 10),
            counts: 1,
        });
        let infos = [FieldInfo {
            field: FieldKey(10100),
            slots: 20,
            counts: 20,
        }];
        Vocabulary::from_parts(entries, infos)
    }

    fn put_example(store: &mut MemStore, id: u32, y: u16, comm_ref: &str, feats: &[u32]) {
        let record = ExampleRecord {
            example_id: ExampleId(id),
            y,
            z: 1 - y,
            comm_ref: comm_ref.to_string(),
            feat_num: feats.len() as u16,
            features: RecordFeatures::Numeric(
                feats.iter().map(|&f| Feature::new(10100, f, f as f32)).collect(),
            ),
        };
        store.insert(id.to_le_bytes(), record.encode().unwrap());
    }

    fn put_common(store: &mut MemStore, comm_ref: &str, feats: &[u32]) {
        let record = CommFeatureRecord {
            comm_ref: comm_ref.to_string(),
            feat_num: feats.len() as u16,
            features: RecordFeatures::Numeric(
                feats.iter().map(|&f| Feature::new(10100, f, -(f as f32))).collect(),
            ),
        };
        store.insert(comm_ref.as_bytes(), record.encode().unwrap());
    }

    fn fixture() -> Fixture {
        let mut examples = MemStore::new();
        let mut comm_feats = MemStore::new();
        put_example(&mut examples, 7, 0, "no-such-ref", &[1, 2, 3]);
        put_example(&mut examples, 42, 1, "c42", &[4, 5]);
        put_example(&mut examples, 43, 1, "c42", &[6]);
        put_example(&mut examples, 44, 0, "", &[7]);
        put_common(&mut comm_feats, "c42", &[11, 12, 13, 14]);
        Fixture {
            examples: Arc::new(examples),
            comm_feats: Arc::new(comm_feats),
        }
    }

    fn retriever(fx: &Fixture, config: RetrieverConfig) -> FeatureRetriever {
        FeatureRetriever::from_parts(config, vocab(), fx.examples.clone(), fx.comm_feats.clone())
            .unwrap()
    }

    fn config(max_feats: usize) -> RetrieverConfig {
        RetrieverConfig {
            max_feats,
            ..RetrieverConfig::default()
        }
    }

    fn ids(raw: &[u32]) -> Vec<ExampleId> {
        raw.iter().copied().map(ExampleId).collect()
    }

    #[test]
    fn test_two_example_scenario() {
        let fx = fixture();
        let r = retriever(&fx, config(5));
        let batch = r.retrieve(&ids(&[7, 42])).unwrap();

        assert_eq!(batch.lens, vec![3, 5]);
        // row 0: own features only, slots 3..5 zero
        assert_eq!(&batch.feat_ids[0..5], &[10, 20, 30, 0, 0]);
        assert_eq!(&batch.values[3..5], &[0.0, 0.0]);
        // row 1: 2 own, then first 3 of 4 common
        assert_eq!(&batch.feat_ids[5..10], &[40, 50, 110, 120, 130]);
        assert_eq!(&batch.values[5..10], &[4.0, 5.0, -11.0, -12.0, -13.0]);
        assert_eq!(&batch.field_ids[5..10], &[10100; 5]);
        assert_eq!(batch.y, vec![0, 1]);
        assert_eq!(batch.z, vec![1, 0]);
    }

    #[test]
    fn test_common_refs_deduplicated() {
        let fx = fixture();
        let r = retriever(&fx, config(8));
        let batch = r.retrieve(&ids(&[42, 43, 44, 42])).unwrap();
        assert_eq!(batch.lens, vec![6, 5, 1, 6]);
        assert_eq!(fx.examples.bulk_reads(), 1);
        assert_eq!(fx.comm_feats.bulk_reads(), 1);
    }

    #[test]
    fn test_idempotent() {
        let fx = fixture();
        let r = retriever(&fx, config(4));
        let batch = ids(&[44, 7, 42, 43, 42]);
        let first = r.retrieve(&batch).unwrap();
        let second = r.retrieve(&batch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_batches_share_handles() {
        let fx = fixture();
        let r = retriever(&fx, config(5));
        let a = ids(&[7, 42]);
        let b = ids(&[44, 43, 42]);
        let expected_a = r.retrieve(&a).unwrap();
        let expected_b = r.retrieve(&b).unwrap();

        std::thread::scope(|s| {
            for t in 0..8 {
                let (r, a, b) = (&r, &a, &b);
                let (expected_a, expected_b) = (&expected_a, &expected_b);
                s.spawn(move || {
                    for _ in 0..50 {
                        if t % 2 == 0 {
                            assert_eq!(&r.retrieve(a).unwrap(), expected_a);
                        } else {
                            assert_eq!(&r.retrieve(b).unwrap(), expected_b);
                        }
                    }
                });
            }
        });
        assert_eq!(fx.examples.bulk_reads(), 2 + 8 * 50);
    }

    #[test]
    fn test_order_follows_input() {
        let fx = fixture();
        let r = retriever(&fx, config(4));
        let forward = r.retrieve(&ids(&[7, 44])).unwrap();
        let reverse = r.retrieve(&ids(&[44, 7])).unwrap();
        assert_eq!(forward.lens, vec![3, 1]);
        assert_eq!(reverse.lens, vec![1, 3]);
        assert_eq!(&forward.feat_ids[0..4], &reverse.feat_ids[4..8]);
    }

    #[test]
    fn test_missing_example_fails_batch() {
        let fx = fixture();
        let r = retriever(&fx, config(4));
        let err = r.retrieve(&ids(&[7, 99])).unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::DataLoss);
        assert!(err.to_string().contains("63000000"), "{err}");
        // failure happens before the common store is touched
        assert_eq!(fx.comm_feats.bulk_reads(), 0);
    }

    #[test]
    fn test_missing_example_skipped() {
        let fx = fixture();
        let r = retriever(
            &fx,
            RetrieverConfig {
                examples_miss_policy: MissPolicy::Skip,
                ..config(4)
            },
        );
        let batch = r.retrieve(&ids(&[99, 44])).unwrap();
        assert_eq!(batch.lens, vec![0, 1]);
        assert_eq!(batch.y, vec![0, 0]);
        assert_eq!(batch.z, vec![0, 1]);
        assert!(batch.feat_ids[0..4].iter().all(|&v| v == 0));
    }

    #[test]
    fn test_missing_common_fails_when_strict() {
        let fx = fixture();
        let r = retriever(
            &fx,
            RetrieverConfig {
                comm_feats_miss_policy: MissPolicy::FailBatch,
                ..config(4)
            },
        );
        let err = r.retrieve(&ids(&[7])).unwrap_err();
        match err {
            FeedError::DataLoss { store, key } => {
                assert_eq!(store, StoreRole::CommFeats);
                assert_eq!(key, crate::error::hex_key(b"no-such-ref"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_corrupt_record_fails_batch() {
        let mut examples = MemStore::new();
        examples.insert(5u32.to_le_bytes(), b"garbage".to_vec());
        let r = FeatureRetriever::from_parts(
            config(4),
            vocab(),
            Arc::new(examples),
            Arc::new(MemStore::new()),
        )
        .unwrap();
        let err = r.retrieve(&ids(&[5])).unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::DataCorruption);
    }

    #[test]
    fn test_empty_batch() {
        let fx = fixture();
        let r = retriever(&fx, config(5));
        let batch = r.retrieve(&[]).unwrap();
        assert_eq!(batch.num_examples, 0);
        assert_eq!(batch.field_id_matrix().unwrap().shape(), &[0, 5]);
        assert_eq!(fx.examples.bulk_reads(), 0);
    }

    #[test]
    fn test_compute_rejects_non_1d() {
        let fx = fixture();
        let r = retriever(&fx, config(5));
        let ids = Array::from_shape_vec(IxDyn(&[1, 2]), vec![7i64, 42]).unwrap();
        let err = r.compute(ids.view()).unwrap_err();
        assert_eq!(err.kind(), FeedErrorKind::InvalidInput);
        assert_eq!(fx.examples.bulk_reads(), 0);
    }

    #[test]
    fn test_compute_rejects_out_of_range() {
        let fx = fixture();
        let r = retriever(&fx, config(5));
        for bad in [-1i64, i64::from(u32::MAX) + 1] {
            let ids = Array::from_shape_vec(IxDyn(&[1]), vec![bad]).unwrap();
            assert_eq!(
                r.compute(ids.view()).unwrap_err().kind(),
                FeedErrorKind::InvalidInput
            );
        }
    }

    #[test]
    fn test_compute_matches_retrieve() {
        let fx = fixture();
        let r = retriever(&fx, config(5));
        let ids_arr = Array::from_shape_vec(IxDyn(&[2]), vec![7i64, 42]).unwrap();
        let via_compute = r.compute(ids_arr.view()).unwrap();
        let via_retrieve = r.retrieve(&ids(&[7, 42])).unwrap();
        assert_eq!(via_compute, via_retrieve);
    }

    #[test]
    fn test_open_rejects_bad_vocab() {
        let dir = tempfile::tempdir().unwrap();
        let config = RetrieverConfig::new(
            dir.path().join("examples"),
            dir.path().join("comm"),
            5,
            dir.path().join("missing.vocab"),
        );
        let err = FeatureRetriever::open(config).err().unwrap();
        assert_eq!(err.kind(), FeedErrorKind::DataCorruption);
    }

    #[test]
    fn test_field_info_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.bin");
        let entries = [VocabEntry {
            field: FieldKey(20500),
            feat: FeatKey(3),
            vocab_id: VocabId(1),
            counts: 9,
        }];
        let infos = [
            FieldInfo {
                field: FieldKey(20500),
                slots: 1,
                counts: 9,
            },
            FieldInfo {
                field: FieldKey(10100),
                slots: 4,
                counts: 30,
            },
        ];
        write_vocabulary(&path, &entries, &infos).unwrap();
        let cols = field_info(&path).unwrap();
        assert_eq!(cols.field_ids, vec![10100, 20500]);
        assert_eq!(cols.slots, vec![4, 1]);
        assert_eq!(cols.counts, vec![30, 9]);
    }
}
