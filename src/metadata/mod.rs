//! Metadata store for informed samples and finalized triggers
//!
//! **Append-Only Write Pattern**:
//! - Samples arrive as whole inform batches and are appended as Arrow
//!   `RecordBatch`es (one batch per insert call)
//! - The only in-place change is the `used` flag, flipped when a
//!   reset-after-trigger strategy commits a trigger
//! - Trigger partitions are written once (staged, then committed) and never
//!   mutated afterwards
//!
//! Every trigger reads through an [`EligibleFilter`] bounded by the insertion
//! high-watermark captured at trigger start, so inserts racing with a trigger
//! are only visible to the next one.
//!
//! # Example
//!
//! ```rust
//! use trueno_select::metadata::{EligibleFilter, MemoryMetadataStore, MetadataStore};
//!
//! # async fn example() -> trueno_select::Result<()> {
//! let store = MemoryMetadataStore::new();
//! let pipeline_id = store.allocate_pipeline_id().await?;
//!
//! store.insert_many(pipeline_id, vec![10, 11], vec![1, 2], vec![0, 1]).await?;
//! let high_watermark = store.snapshot(pipeline_id).await?;
//!
//! let filter = EligibleFilter::all(high_watermark);
//! assert_eq!(store.count(pipeline_id, filter).await?, 2);
//! # Ok(())
//! # }
//! ```

mod memory;
mod schema;
mod trigger_samples;

pub use memory::MemoryMetadataStore;
pub use schema::{partition_batch, partition_schema, sample_schema, SAMPLE_TABLE};
pub use trigger_samples::TriggerSampleStorage;

use crate::Result;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Pipeline identifier, assigned monotonically on registration
pub type PipelineId = u64;

/// Trigger identifier, strictly increasing per pipeline
pub type TriggerId = u64;

/// One informed data point as read back from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Insertion sequence number (strictly increasing per pipeline, starts at 0)
    pub seq: u64,
    /// Externally meaningful sample key
    pub key: i64,
    /// Logical ordering key
    pub timestamp: i64,
    /// Opaque label
    pub label: i64,
}

/// Predicate describing which records a trigger may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibleFilter {
    /// Skip records already consumed by a reset-after-trigger strategy
    pub only_unused: bool,
    /// Exclusive upper bound on the insertion sequence number
    pub high_watermark: u64,
}

impl EligibleFilter {
    /// Every record inserted before `high_watermark`
    #[must_use]
    pub const fn all(high_watermark: u64) -> Self {
        Self {
            only_unused: false,
            high_watermark,
        }
    }

    /// Only records not yet marked used, inserted before `high_watermark`
    #[must_use]
    pub const fn unused(high_watermark: u64) -> Self {
        Self {
            only_unused: true,
            high_watermark,
        }
    }

    /// Whether a record with the given sequence number and flag passes
    #[must_use]
    pub const fn matches(&self, seq: u64, used: bool) -> bool {
        seq < self.high_watermark && !(self.only_unused && used)
    }
}

/// Capabilities a backend advertises to the selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCapabilities {
    /// Backend can evaluate `ORDER BY RANDOM() LIMIT n` sampling statements
    pub sql_pushdown: bool,
}

/// Summary of a finalized trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Trigger id
    pub trigger_id: TriggerId,
    /// Total number of selected keys
    pub num_keys: usize,
    /// Number of keys in each partition, in partition order
    pub partition_sizes: Vec<usize>,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

impl TriggerInfo {
    /// Number of partitions of this trigger
    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.partition_sizes.len()
    }
}

/// Persistence interface consumed by the selector.
///
/// Sequence numbers are strictly increasing per pipeline and define insertion
/// order; all scans return records ordered by them.
///
/// Large informs go through a reservation: [`MetadataStore::reserve_samples`]
/// validates every key and claims a contiguous block of sequence numbers,
/// writers fill the block with [`MetadataStore::insert_reserved`] in any order,
/// and [`MetadataStore::publish_reserved`] makes it visible at once. Records
/// behind an open reservation stay invisible until it is published or
/// released.
pub trait MetadataStore: Send + Sync {
    /// Capabilities of this backend.
    fn capabilities(&self) -> StoreCapabilities;

    /// Transactionally allocate the next pipeline id and create its tables.
    fn allocate_pipeline_id(&self) -> impl Future<Output = Result<PipelineId>> + Send;

    /// Append one record per element, `used = false`.
    ///
    /// Fails with `DuplicateKey` when a key is already live in the pipeline
    /// (or repeated within the call); nothing is inserted in that case.
    fn insert_many(
        &self,
        pipeline_id: PipelineId,
        keys: Vec<i64>,
        timestamps: Vec<i64>,
        labels: Vec<i64>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Validate `keys` and reserve a contiguous block of sequence numbers.
    ///
    /// Fails with `DuplicateKey` when a key is already live or repeated; no
    /// reservation is made in that case. The keys count as live until the
    /// reservation is released. Returns the first reserved sequence number.
    fn reserve_samples(
        &self,
        pipeline_id: PipelineId,
        keys: &[i64],
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Write one slice of an open reservation starting at `first_seq`.
    ///
    /// The keys must be exactly the reserved keys at those positions.
    fn insert_reserved(
        &self,
        pipeline_id: PipelineId,
        first_seq: u64,
        keys: Vec<i64>,
        timestamps: Vec<i64>,
        labels: Vec<i64>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Make a fully written reservation visible to readers.
    fn publish_reserved(
        &self,
        pipeline_id: PipelineId,
        first_seq: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop a reservation and whatever was written into it.
    fn release_reserved(
        &self,
        pipeline_id: PipelineId,
        first_seq: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Current insertion high-watermark: every visible record has a lower
    /// sequence number.
    fn snapshot(&self, pipeline_id: PipelineId) -> impl Future<Output = Result<u64>> + Send;

    /// Number of records matching `filter`.
    fn count(
        &self,
        pipeline_id: PipelineId,
        filter: EligibleFilter,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Up to `limit` records matching `filter` with `seq >= from_seq`, in
    /// insertion order. Keyset pagination: pass `last.seq + 1` to continue.
    fn scan(
        &self,
        pipeline_id: PipelineId,
        filter: EligibleFilter,
        from_seq: u64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<SampleRecord>>> + Send;

    /// Execute a sampling statement built by [`crate::query::SampleStatement`].
    ///
    /// Only available when [`StoreCapabilities::sql_pushdown`] is set.
    fn execute_sample_query(
        &self,
        sql: &str,
    ) -> impl Future<Output = Result<Vec<SampleRecord>>> + Send;

    /// Transactionally allocate the next trigger id of a pipeline.
    fn allocate_trigger_id(
        &self,
        pipeline_id: PipelineId,
    ) -> impl Future<Output = Result<TriggerId>> + Send;

    /// Stage the next partition of an uncommitted trigger.
    ///
    /// Returns the partition id assigned to it.
    fn stage_partition(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        keys: Vec<i64>,
        weights: Vec<f32>,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Atomically publish the staged partitions and, if `mark_used` is set,
    /// flag every record matching it as used.
    fn commit_trigger(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        mark_used: Option<EligibleFilter>,
    ) -> impl Future<Output = Result<TriggerInfo>> + Send;

    /// Discard everything staged for an uncommitted trigger.
    fn abort_trigger(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Summary of a committed trigger; `UnknownTrigger` otherwise.
    fn trigger_info(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
    ) -> impl Future<Output = Result<TriggerInfo>> + Send;

    /// One committed partition as a (`sample_key`, `weight`) batch.
    fn partition(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        partition_id: usize,
    ) -> impl Future<Output = Result<RecordBatch>> + Send;

    /// Distinct labels informed so far, sorted ascending.
    fn labels(&self, pipeline_id: PipelineId) -> impl Future<Output = Result<Vec<i64>>> + Send;
}
