//! FullHistory: every informed record, every trigger.

use super::{limit_bound, limited_selection, PartitionWriter};
use crate::config::{FullHistoryConfig, LimitReset};
use crate::metadata::{EligibleFilter, MetadataStore, PipelineId};
use crate::Result;

/// Replays the full history of a pipeline, optionally capped by `limit`
#[derive(Debug, Clone)]
pub struct FullHistoryStrategy {
    pipeline_id: PipelineId,
    maximum_keys_in_memory: usize,
    limit: Option<usize>,
    limit_reset: LimitReset,
}

impl FullHistoryStrategy {
    /// Create the strategy from validated parameters
    #[must_use]
    pub fn new(pipeline_id: PipelineId, config: FullHistoryConfig, maximum_keys_in_memory: usize) -> Self {
        Self {
            pipeline_id,
            maximum_keys_in_memory,
            limit: limit_bound(config.limit),
            limit_reset: config.limit_reset,
        }
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

    pub(crate) async fn select<S: MetadataStore>(
        &self,
        store: &S,
        filter: EligibleFilter,
        writer: &mut PartitionWriter<'_, S>,
    ) -> Result<()> {
        // Never consumes records, so the used flag is irrelevant
        let filter = EligibleFilter::all(filter.high_watermark);
        limited_selection(store, self.pipeline_id, filter, self.limit, self.limit_reset, writer).await
    }
}
