//! Worker sharding and batched streaming of partitions
//!
//! Each committed partition is split among `num_workers` data-loader workers
//! into contiguous, balanced ranges: shard sizes differ by at most one and the
//! first `len % num_workers` workers get the larger ones. A worker's shard is
//! then streamed as batches of at most `sample_batch_size` pairs.
//!
//! Shards are zero-copy slices of the partition batch, so restarting a stream
//! (cloning the iterator) never re-reads the store.

use crate::{Error, Result};
use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::{DataType, Float32Type, Int64Type};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Range of `0..len` owned by `worker_id` out of `num_workers`.
///
/// Callers validate `worker_id < num_workers`.
///
/// ```
/// use trueno_select::partition::shard_range;
///
/// assert_eq!(shard_range(5, 0, 2), 0..3);
/// assert_eq!(shard_range(5, 1, 2), 3..5);
/// ```
#[must_use]
pub fn shard_range(len: usize, worker_id: usize, num_workers: usize) -> Range<usize> {
    if num_workers == 0 || worker_id >= num_workers {
        return len..len;
    }
    let base = len / num_workers;
    let extra = len % num_workers;
    let start = worker_id * base + worker_id.min(extra);
    let size = base + usize::from(worker_id < extra);
    start..start + size
}

/// The slice of `items` owned by `worker_id`
#[must_use]
pub fn shard<T>(items: &[T], worker_id: usize, num_workers: usize) -> &[T] {
    &items[shard_range(items.len(), worker_id, num_workers)]
}

/// One streamed response batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyWeightBatch {
    /// Sample keys
    pub keys: Vec<i64>,
    /// Weights, index-aligned with `keys`
    pub weights: Vec<f32>,
}

impl KeyWeightBatch {
    /// Number of pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when the batch holds no pairs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Restartable stream of a worker's shard of one partition
#[derive(Debug, Clone)]
pub struct ShardBatches {
    shard: RecordBatch,
    offset: usize,
    batch_size: usize,
}

impl ShardBatches {
    /// Shard a (`sample_key`, `weight`) partition batch
    ///
    /// # Errors
    /// Returns `OutOfRange` if `worker_id >= num_workers`,
    /// `InvalidConfiguration` for a zero `batch_size`, and `StorageError` if
    /// the batch does not have the partition layout
    pub fn new(
        partition: RecordBatch,
        worker_id: usize,
        num_workers: usize,
        batch_size: usize,
    ) -> Result<Self> {
        if worker_id >= num_workers {
            return Err(Error::OutOfRange {
                field: "worker_id",
                value: worker_id,
                bound: num_workers,
            });
        }
        if batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "sample_batch_size must be at least 1".to_string(),
            ));
        }
        Self::check_layout(&partition)?;

        let range = shard_range(partition.num_rows(), worker_id, num_workers);
        Ok(Self {
            shard: partition.slice(range.start, range.len()),
            offset: 0,
            batch_size,
        })
    }

    fn check_layout(batch: &RecordBatch) -> Result<()> {
        let layout_ok = batch.num_columns() == 2
            && batch.column(0).data_type() == &DataType::Int64
            && batch.column(1).data_type() == &DataType::Float32;
        if layout_ok {
            Ok(())
        } else {
            Err(Error::StorageError(format!(
                "Partition batch must be (Int64 key, Float32 weight), got {:?}",
                batch.schema()
            )))
        }
    }

    /// Number of pairs in this worker's shard
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.shard.num_rows()
    }
}

impl Iterator for ShardBatches {
    type Item = KeyWeightBatch;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.shard.num_rows() - self.offset;
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(self.batch_size);

        let keys = self.shard.column(0).as_primitive::<Int64Type>();
        let weights = self.shard.column(1).as_primitive::<Float32Type>();
        let batch = KeyWeightBatch {
            keys: keys.values()[self.offset..self.offset + len].to_vec(),
            weights: weights.values()[self.offset..self.offset + len].to_vec(),
        };

        self.offset += len;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.shard.num_rows() - self.offset).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ShardBatches {}
