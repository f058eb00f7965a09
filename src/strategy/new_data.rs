//! NewData: train on what arrived since the last trigger.
//!
//! With `reset_after_trigger` the records a trigger saw are consumed and the
//! next trigger only sees data informed afterwards. Without it every trigger
//! selects the full informed set, so an empty trigger replays the previous
//! training set.

use super::{limit_bound, limited_selection, PartitionWriter};
use crate::config::{LimitReset, NewDataConfig};
use crate::metadata::{EligibleFilter, MetadataStore, PipelineId};
use crate::Result;

/// Selects newly informed data
#[derive(Debug, Clone)]
pub struct NewDataStrategy {
    pipeline_id: PipelineId,
    maximum_keys_in_memory: usize,
    limit: Option<usize>,
    limit_reset: LimitReset,
    reset_after_trigger: bool,
}

impl NewDataStrategy {
    /// Create the strategy from validated parameters
    #[must_use]
    pub fn new(pipeline_id: PipelineId, config: NewDataConfig, maximum_keys_in_memory: usize) -> Self {
        Self {
            pipeline_id,
            maximum_keys_in_memory,
            limit: limit_bound(config.limit),
            limit_reset: config.limit_reset,
            reset_after_trigger: config.reset_after_trigger,
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

    /// Whether a trigger consumes the records it saw
    #[must_use]
    pub const fn reset_after_trigger(&self) -> bool {
        self.reset_after_trigger
    }

    pub(crate) async fn select<S: MetadataStore>(
        &self,
        store: &S,
        filter: EligibleFilter,
        writer: &mut PartitionWriter<'_, S>,
    ) -> Result<()> {
        limited_selection(store, self.pipeline_id, filter, self.limit, self.limit_reset, writer).await
    }
}
