//! Parallel dense materialization of a merged batch.
//!
//! The batch is split into contiguous chunks of `chunk_size` rows. Each chunk
//! owns disjoint slices of every output buffer, so workers never share a
//! writable row and output order is fixed by position alone.

use std::time::Instant;

use ndarray::ArrayView2;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::config::RetrieverConfig;
use crate::error::{FeedError, Result};
use crate::merge::{RowSlots, clear_row, merge_into};
use crate::record::{CommFeatureView, ExampleView};
use crate::vocab::Vocabulary;

/// Scheduler cost below which chunks are grouped into one rayon task.
pub const MIN_TASK_COST: u64 = 1_000_000;

// ============================================================================
// Output Batch
// ============================================================================

/// Dense outputs of one batch call, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    pub num_examples: usize,
    pub max_feats: usize,

    // [N, max_feats]
    pub field_ids: Vec<i64>,
    pub feat_ids: Vec<i64>,
    pub values: Vec<f32>,

    // [N]
    pub y: Vec<i64>,
    pub z: Vec<i64>,
    pub lens: Vec<i64>,
}

impl FeatureBatch {
    /// Allocate zeroed buffers for `num_examples` rows, failing with
    /// [`FeedError::ResourceExhausted`] instead of aborting.
    pub fn zeroed(num_examples: usize, max_feats: usize) -> Result<Self> {
        let cells = num_examples.checked_mul(max_feats).ok_or_else(|| {
            FeedError::ResourceExhausted(format!(
                "output shape [{num_examples}, {max_feats}] overflows"
            ))
        })?;
        Ok(Self {
            num_examples,
            max_feats,
            field_ids: zeroed_vec(cells)?,
            feat_ids: zeroed_vec(cells)?,
            values: zeroed_vec(cells)?,
            y: zeroed_vec(num_examples)?,
            z: zeroed_vec(num_examples)?,
            lens: zeroed_vec(num_examples)?,
        })
    }

    pub fn field_id_matrix(&self) -> Result<ArrayView2<'_, i64>> {
        matrix(&self.field_ids, self.num_examples, self.max_feats)
    }

    pub fn feat_id_matrix(&self) -> Result<ArrayView2<'_, i64>> {
        matrix(&self.feat_ids, self.num_examples, self.max_feats)
    }

    pub fn value_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        matrix(&self.values, self.num_examples, self.max_feats)
    }
}

fn zeroed_vec<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        FeedError::ResourceExhausted(format!("failed to allocate {len} output cells: {e}"))
    })?;
    v.resize(len, T::default());
    Ok(v)
}

fn matrix<T>(data: &[T], rows: usize, cols: usize) -> Result<ArrayView2<'_, T>> {
    ArrayView2::from_shape((rows, cols), data).map_err(|e| {
        FeedError::InvalidInput(format!(
            "buffer of {} cells is not [{rows}, {cols}]: {e}",
            data.len()
        ))
    })
}

// ============================================================================
// Work Units
// ============================================================================

/// Inputs for one output row. `example == None` marks a skipped example.
#[derive(Debug, Clone, Copy)]
pub struct MergeJob<'a> {
    pub example: Option<&'a ExampleView<'a>>,
    pub common: Option<&'a CommFeatureView<'a>>,
}

struct Chunk<'b, 'a> {
    jobs: &'b [MergeJob<'a>],
    field_ids: &'b mut [i64],
    feat_ids: &'b mut [i64],
    values: &'b mut [f32],
    y: &'b mut [i64],
    z: &'b mut [i64],
    lens: &'b mut [i64],
}

impl Chunk<'_, '_> {
    fn run(self, vocab: &Vocabulary, max_feats: usize) {
        let rows = self
            .field_ids
            .chunks_mut(max_feats)
            .zip(self.feat_ids.chunks_mut(max_feats))
            .zip(self.values.chunks_mut(max_feats));
        for (i, ((field_ids, feat_ids), values)) in rows.enumerate() {
            let job = &self.jobs[i];
            let row = RowSlots::new(field_ids, feat_ids, values);
            match job.example {
                Some(example) => {
                    let len = merge_into(example, job.common, vocab, row);
                    self.y[i] = i64::from(example.y());
                    self.z[i] = i64::from(example.z());
                    self.lens[i] = len as i64;
                }
                None => {
                    clear_row(row);
                    self.y[i] = 0;
                    self.z[i] = 0;
                    self.lens[i] = 0;
                }
            }
        }
    }
}

// ============================================================================
// Materializer
// ============================================================================

/// Chunked parallel writer of [`FeatureBatch`]es.
pub struct Materializer {
    max_feats: usize,
    chunk_size: usize,
    min_chunks_per_task: usize,
    pool: Option<ThreadPool>,
}

impl Materializer {
    pub fn new(config: &RetrieverConfig) -> Result<Self> {
        config.validate_dispatch()?;
        let pool = match config.num_threads {
            Some(n) => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("featstore-{i}"))
                    .build()
                    .map_err(|e| {
                        FeedError::Configuration(format!("failed to build worker pool: {e}"))
                    })?;
                info!("Materializer using dedicated pool of {n} threads");
                Some(pool)
            }
            None => None,
        };
        Ok(Self {
            max_feats: config.max_feats,
            chunk_size: config.chunk_size,
            min_chunks_per_task: min_chunks_per_task(config.cost_per_unit),
            pool,
        })
    }

    pub fn max_feats(&self) -> usize {
        self.max_feats
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Merge every job into its row. Row `i` of the result corresponds to
    /// `jobs[i]` regardless of how chunks are scheduled.
    pub fn materialize(&self, jobs: &[MergeJob<'_>], vocab: &Vocabulary) -> Result<FeatureBatch> {
        let start = Instant::now();
        let n = jobs.len();
        let max_feats = self.max_feats;
        let mut batch = FeatureBatch::zeroed(n, max_feats)?;

        let cells = self.chunk_size.saturating_mul(max_feats);
        let FeatureBatch {
            field_ids,
            feat_ids,
            values,
            y,
            z,
            lens,
            ..
        } = &mut batch;

        let chunks: Vec<Chunk<'_, '_>> = jobs
            .chunks(self.chunk_size)
            .zip(field_ids.chunks_mut(cells))
            .zip(feat_ids.chunks_mut(cells))
            .zip(values.chunks_mut(cells))
            .zip(y.chunks_mut(self.chunk_size))
            .zip(z.chunks_mut(self.chunk_size))
            .zip(lens.chunks_mut(self.chunk_size))
            .map(
                |((((((jobs, field_ids), feat_ids), values), y), z), lens)| Chunk {
                    jobs,
                    field_ids,
                    feat_ids,
                    values,
                    y,
                    z,
                    lens,
                },
            )
            .collect();
        let num_chunks = chunks.len();

        let min_len = self.min_chunks_per_task;
        let run = move || {
            chunks
                .into_par_iter()
                .with_min_len(min_len)
                .for_each(|chunk| chunk.run(vocab, max_feats));
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }

        debug!(
            "materialized {n} examples in {num_chunks} chunks in {} us",
            start.elapsed().as_micros()
        );
        Ok(batch)
    }
}

/// Chunks grouped into one rayon task, from the per-chunk cost estimate.
fn min_chunks_per_task(cost_per_unit: u64) -> usize {
    let per_task = MIN_TASK_COST.div_ceil(cost_per_unit.max(1)).max(1);
    usize::try_from(per_task).unwrap_or(usize::MAX)
}
