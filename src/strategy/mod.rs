//! Selection strategies
//!
//! A strategy decides, at trigger time, which informed records enter the new
//! training set and with which weight. Every trigger follows the same steps:
//!
//! 1. Capture the insertion high-watermark (snapshot-then-sample)
//! 2. Allocate the trigger id
//! 3. Stream the selection into partitions of at most
//!    `maximum_keys_in_memory` keys, staged in the store
//! 4. Commit (publishing partitions and flipping `used` flags) or abort
//!
//! Steps 3 and 4 never leave a half-applied trigger behind: any error aborts
//! and discards what was staged.

mod downsampling;
mod full_history;
mod new_data;

pub use downsampling::DownsamplingStrategy;
pub use full_history::FullHistoryStrategy;
pub use new_data::NewDataStrategy;

use crate::config::{LimitReset, StrategyConfig, StrategyKind};
use crate::metadata::{EligibleFilter, MetadataStore, PipelineId, SampleRecord, TriggerId};
use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Result of one trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    /// Newly issued trigger id
    pub trigger_id: TriggerId,
    /// Total number of selected keys
    pub num_keys: usize,
    /// Number of partitions holding them
    pub num_partitions: usize,
}

/// Tagged variant over the known strategy kinds
#[derive(Debug, Clone)]
pub enum SelectionStrategy {
    /// Replay the whole history
    FullHistory(FullHistoryStrategy),
    /// Train on newly informed data
    NewData(NewDataStrategy),
    /// Presampling with inverse-probability weights
    Downsampling(DownsamplingStrategy),
}

impl SelectionStrategy {
    /// Instantiate the strategy of `pipeline_id` described by `config`
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if the configuration is out of range
    pub fn new(pipeline_id: PipelineId, config: &StrategyConfig) -> Result<Self> {
        config.validate()?;
        let max_keys = config.maximum_keys_in_memory;
        Ok(match config.kind {
            StrategyKind::FullHistory(c) => {
                Self::FullHistory(FullHistoryStrategy::new(pipeline_id, c, max_keys))
            }
            StrategyKind::NewData(c) => Self::NewData(NewDataStrategy::new(pipeline_id, c, max_keys)),
            StrategyKind::Downsampling(c) => {
                Self::Downsampling(DownsamplingStrategy::new(pipeline_id, c, max_keys)?)
            }
        })
    }

    /// Pipeline this strategy selects for
    #[must_use]
    pub const fn pipeline_id(&self) -> PipelineId {
        match self {
            Self::FullHistory(s) => s.pipeline_id(),
            Self::NewData(s) => s.pipeline_id(),
            Self::Downsampling(s) => s.pipeline_id(),
        }
    }

    /// Upper bound on keys per partition
    #[must_use]
    pub const fn maximum_keys_in_memory(&self) -> usize {
        match self {
            Self::FullHistory(s) => s.maximum_keys_in_memory(),
            Self::NewData(s) => s.maximum_keys_in_memory(),
            Self::Downsampling(s) => s.maximum_keys_in_memory(),
        }
    }

    /// Whether a trigger consumes (marks used) the records it saw
    #[must_use]
    pub const fn reset_after_trigger(&self) -> bool {
        match self {
            Self::FullHistory(_) => false,
            Self::NewData(s) => s.reset_after_trigger(),
            Self::Downsampling(s) => s.reset_after_trigger(),
        }
    }

    /// Whether selected keys may carry weights other than 1.0
    #[must_use]
    pub const fn uses_weights(&self) -> bool {
        matches!(self, Self::Downsampling(_))
    }

    /// The downsampling engine, if this is a downsampling strategy
    #[must_use]
    pub const fn as_downsampling(&self) -> Option<&DownsamplingStrategy> {
        match self {
            Self::Downsampling(s) => Some(s),
            _ => None,
        }
    }

    /// Append informed samples to the store
    ///
    /// # Errors
    /// Propagates store failures (`LengthMismatch`, `DuplicateKey`, ...)
    pub async fn inform_data<S: MetadataStore>(
        &self,
        store: &S,
        keys: Vec<i64>,
        timestamps: Vec<i64>,
        labels: Vec<i64>,
    ) -> Result<()> {
        store
            .insert_many(self.pipeline_id(), keys, timestamps, labels)
            .await
    }

    /// Select, partition and commit a new training set.
    ///
    /// Callers must serialize triggers of the same pipeline.
    ///
    /// # Errors
    /// Propagates store failures; the trigger is aborted in that case
    pub async fn trigger<S: MetadataStore>(&self, store: &S) -> Result<TriggerOutcome> {
        let pipeline_id = self.pipeline_id();
        let high_watermark = store.snapshot(pipeline_id).await?;
        let filter = EligibleFilter {
            only_unused: self.reset_after_trigger(),
            high_watermark,
        };
        let trigger_id = store.allocate_trigger_id(pipeline_id).await?;

        match self.select_and_commit(store, trigger_id, filter).await {
            Ok(outcome) => {
                info!(
                    pipeline_id,
                    trigger_id,
                    num_keys = outcome.num_keys,
                    num_partitions = outcome.num_partitions,
                    "trigger committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(pipeline_id, trigger_id, error = %e, "trigger failed, aborting");
                if let Err(abort_err) = store.abort_trigger(pipeline_id, trigger_id).await {
                    warn!(pipeline_id, trigger_id, error = %abort_err, "abort failed");
                }
                Err(e)
            }
        }
    }

    async fn select_and_commit<S: MetadataStore>(
        &self,
        store: &S,
        trigger_id: TriggerId,
        filter: EligibleFilter,
    ) -> Result<TriggerOutcome> {
        let pipeline_id = self.pipeline_id();
        let mut writer =
            PartitionWriter::new(store, pipeline_id, trigger_id, self.maximum_keys_in_memory());

        match self {
            Self::FullHistory(s) => s.select(store, filter, &mut writer).await?,
            Self::NewData(s) => s.select(store, filter, &mut writer).await?,
            Self::Downsampling(s) => s.select(store, filter, &mut writer).await?,
        }
        writer.finish().await?;

        let mark_used = self.reset_after_trigger().then_some(filter);
        let info = store.commit_trigger(pipeline_id, trigger_id, mark_used).await?;
        Ok(TriggerOutcome {
            trigger_id,
            num_keys: info.num_keys,
            num_partitions: info.num_partitions(),
        })
    }
}

/// Streams selected (key, weight) pairs into staged partitions.
///
/// Partitions are flushed as soon as they reach the size bound; the last one
/// may be smaller and an empty selection stages nothing.
pub(crate) struct PartitionWriter<'a, S> {
    store: &'a S,
    pipeline_id: PipelineId,
    trigger_id: TriggerId,
    max_keys: usize,
    keys: Vec<i64>,
    weights: Vec<f32>,
}

impl<'a, S: MetadataStore> PartitionWriter<'a, S> {
    pub(crate) fn new(
        store: &'a S,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        max_keys: usize,
    ) -> Self {
        Self {
            store,
            pipeline_id,
            trigger_id,
            max_keys,
            keys: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub(crate) async fn push(&mut self, key: i64, weight: f32) -> Result<()> {
        self.keys.push(key);
        self.weights.push(weight);
        if self.keys.len() >= self.max_keys {
            self.flush().await?;
        }
        Ok(())
    }

    pub(crate) async fn push_all(&mut self, records: &[SampleRecord], weight: f32) -> Result<()> {
        for record in records {
            self.push(record.key, weight).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let keys = std::mem::take(&mut self.keys);
        let weights = std::mem::take(&mut self.weights);
        self.store
            .stage_partition(self.pipeline_id, self.trigger_id, keys, weights)
            .await?;
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> Result<()> {
        self.flush().await
    }
}

/// Write every record matching `filter` with `seq >= from_seq`, skipping the
/// first `skip` of them, at weight 1.0.
pub(crate) async fn write_eligible<S: MetadataStore>(
    store: &S,
    pipeline_id: PipelineId,
    filter: EligibleFilter,
    mut skip: usize,
    writer: &mut PartitionWriter<'_, S>,
) -> Result<()> {
    let page_size = writer.max_keys;
    let mut from_seq = 0;
    loop {
        let page = store.scan(pipeline_id, filter, from_seq, page_size).await?;
        let Some(last) = page.last() else {
            return Ok(());
        };
        from_seq = last.seq + 1;

        let dropped = skip.min(page.len());
        skip -= dropped;
        writer.push_all(&page[dropped..], 1.0).await?;

        if page.len() < page_size {
            return Ok(());
        }
    }
}

/// Uniform sample of `size` records matching `filter`, drawn in the engine
/// with reservoir sampling over a paged scan. Returned in insertion order.
pub(crate) async fn reservoir_sample<S: MetadataStore>(
    store: &S,
    pipeline_id: PipelineId,
    filter: EligibleFilter,
    size: usize,
    page_size: usize,
) -> Result<Vec<SampleRecord>> {
    let mut rng = StdRng::from_entropy();
    let mut reservoir: Vec<SampleRecord> = Vec::with_capacity(size);
    let mut seen = 0usize;
    let mut from_seq = 0;

    if size == 0 {
        return Ok(reservoir);
    }

    loop {
        let page = store.scan(pipeline_id, filter, from_seq, page_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        from_seq = last.seq + 1;

        for record in &page {
            seen += 1;
            if reservoir.len() < size {
                reservoir.push(*record);
            } else {
                let slot = rng.gen_range(0..seen);
                if slot < size {
                    reservoir[slot] = *record;
                }
            }
        }

        if page.len() < page_size {
            break;
        }
    }

    reservoir.sort_unstable_by_key(|r| r.seq);
    Ok(reservoir)
}

/// Selection shared by FullHistory and NewData: everything matching
/// `filter`, shrunk to `limit` keys by `limit_reset` when it bites.
pub(crate) async fn limited_selection<S: MetadataStore>(
    store: &S,
    pipeline_id: PipelineId,
    filter: EligibleFilter,
    limit: Option<usize>,
    limit_reset: LimitReset,
    writer: &mut PartitionWriter<'_, S>,
) -> Result<()> {
    let eligible = store.count(pipeline_id, filter).await?;
    match limit {
        Some(limit) if eligible > limit => match limit_reset {
            LimitReset::LastX => {
                write_eligible(store, pipeline_id, filter, eligible - limit, writer).await
            }
            LimitReset::SampleUar => {
                let page_size = writer.max_keys;
                let sample = reservoir_sample(store, pipeline_id, filter, limit, page_size).await?;
                writer.push_all(&sample, 1.0).await
            }
        },
        _ => write_eligible(store, pipeline_id, filter, 0, writer).await,
    }
}

/// Convert a configured limit (`-1` = unbounded) into an optional bound
pub(crate) fn limit_bound(limit: i64) -> Option<usize> {
    usize::try_from(limit).ok()
}
