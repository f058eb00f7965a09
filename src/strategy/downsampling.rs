//! Downsampling: ratio-based presampling with importance weights.
//!
//! A trigger draws `T` records uniformly without replacement from the `D`
//! eligible ones, where `T = min(floor(D * ratio / 100), limit)`. Every
//! selected key carries weight `D / T` so weighted losses stay unbiased.
//!
//! The draw runs inside the store when it accepts sampling statements and
//! falls back to reservoir sampling over a paged scan otherwise. Either way
//! the sample is emitted in insertion order.

use super::{reservoir_sample, write_eligible, PartitionWriter};
use crate::config::DownsamplingConfig;
use crate::metadata::{EligibleFilter, MetadataStore, PipelineId};
use crate::query::SampleStatement;
use crate::{Error, Result};
use tracing::debug;

/// Presampling engine
#[derive(Debug, Clone)]
pub struct DownsamplingStrategy {
    pipeline_id: PipelineId,
    maximum_keys_in_memory: usize,
    presampling_ratio: usize,
    limit: Option<usize>,
    reset_after_trigger: bool,
}

impl DownsamplingStrategy {
    /// Create the strategy
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if `presampling_ratio` is outside
    /// `(0, 100]` or `limit < -1`
    pub fn new(
        pipeline_id: PipelineId,
        config: DownsamplingConfig,
        maximum_keys_in_memory: usize,
    ) -> Result<Self> {
        let presampling_ratio = usize::try_from(config.presampling_ratio)
            .ok()
            .filter(|r| (1..=100).contains(r))
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "presampling_ratio must be in (0, 100], got {}",
                    config.presampling_ratio
                ))
            })?;
        if config.limit < -1 {
            return Err(Error::InvalidConfiguration(format!(
                "limit must be -1 (unbounded) or non-negative, got {}",
                config.limit
            )));
        }

        Ok(Self {
            pipeline_id,
            maximum_keys_in_memory,
            presampling_ratio,
            limit: super::limit_bound(config.limit),
            reset_after_trigger: config.reset_after_trigger,
        })
    }

    /// Owning pipeline
    #[must_use]
    pub const fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Upper bound on keys per partition
    #[must_use]
    pub const fn maximum_keys_in_memory(&self) -> usize {
        self.maximum_keys_in_memory
    }

    /// Whether a trigger consumes its eligible pool
    #[must_use]
    pub const fn reset_after_trigger(&self) -> bool {
        self.reset_after_trigger
    }

    /// Configured ratio in percent
    #[must_use]
    pub const fn presampling_ratio(&self) -> usize {
        self.presampling_ratio
    }

    /// Sample size for an eligible set of `dataset_size` records.
    ///
    /// ```
    /// use trueno_select::config::DownsamplingConfig;
    /// use trueno_select::strategy::DownsamplingStrategy;
    ///
    /// let config = DownsamplingConfig { presampling_ratio: 40, ..DownsamplingConfig::default() };
    /// let strategy = DownsamplingStrategy::new(0, config, 100).unwrap();
    /// assert_eq!(strategy.target_size(6), 2);
    /// ```
    #[must_use]
    pub fn target_size(&self, dataset_size: usize) -> usize {
        // floor(D * ratio / 100) without overflowing on large D
        let ratio = self.presampling_ratio;
        let target = dataset_size / 100 * ratio + dataset_size % 100 * ratio / 100;
        self.limit.map_or(target, |limit| target.min(limit))
    }

    /// Sample size a trigger started now would draw
    ///
    /// # Errors
    /// Propagates store failures
    pub async fn get_presampling_target_size<S: MetadataStore>(&self, store: &S) -> Result<usize> {
        let high_watermark = store.snapshot(self.pipeline_id).await?;
        let filter = EligibleFilter {
            only_unused: self.reset_after_trigger,
            high_watermark,
        };
        let dataset_size = store.count(self.pipeline_id, filter).await?;
        Ok(self.target_size(dataset_size))
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) async fn select<S: MetadataStore>(
        &self,
        store: &S,
        filter: EligibleFilter,
        writer: &mut PartitionWriter<'_, S>,
    ) -> Result<()> {
        let dataset_size = store.count(self.pipeline_id, filter).await?;
        let target = self.target_size(dataset_size);
        debug!(
            pipeline_id = self.pipeline_id,
            dataset_size, target, "presampling"
        );

        if target == 0 {
            return Ok(());
        }
        if target == dataset_size {
            return write_eligible(store, self.pipeline_id, filter, 0, writer).await;
        }

        let mut sample = if store.capabilities().sql_pushdown {
            let sql = SampleStatement::new(self.pipeline_id, filter)
                .limit(target)
                .to_string();
            store.execute_sample_query(&sql).await?
        } else {
            reservoir_sample(
                store,
                self.pipeline_id,
                filter,
                target,
                self.maximum_keys_in_memory,
            )
            .await?
        };
        sample.sort_unstable_by_key(|r| r.seq);

        let weight = dataset_size as f32 / sample.len().max(1) as f32;
        writer.push_all(&sample, weight).await
    }
}
