//! Pipeline/trigger state manager
//!
//! The [`Selector`] owns the registered pipelines and their strategies and is
//! the only entry point callers need:
//!
//! ```rust
//! use trueno_select::config::StrategyConfig;
//! use trueno_select::metadata::MemoryMetadataStore;
//! use trueno_select::Selector;
//!
//! # async fn example() -> trueno_select::Result<()> {
//! let selector = Selector::builder()
//!     .insertion_threads(4)
//!     .build(MemoryMetadataStore::new())?;
//!
//! let strategy: StrategyConfig = r#"{"name": "NewDataStrategy", "maximum_keys_in_memory": 2,
//!     "config": {"reset_after_trigger": true}}"#.parse()?;
//! let pipeline_id = selector.register_pipeline(2, &strategy).await?;
//!
//! let response = selector
//!     .inform_and_trigger(pipeline_id, vec![1, 2, 3], vec![0, 1, 2], vec![0, 0, 1])
//!     .await?;
//! assert_eq!(response.num_partitions, 2);
//!
//! for batch in selector.get_sample_keys_and_weights(pipeline_id, response.trigger_id, 0, 0).await? {
//!     assert_eq!(batch.keys, vec![1]);
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::{SelectorConfig, StrategyConfig};
use crate::metadata::{MetadataStore, PipelineId, TriggerId, TriggerInfo};
use crate::partition::ShardBatches;
use crate::strategy::{SelectionStrategy, TriggerOutcome};
use crate::{Error, Result};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Below this many rows per writer task an `inform` is not split further.
const MIN_ROWS_PER_WRITER: usize = 1024;

/// Result of `inform_and_trigger`
pub type TriggerResponse = TriggerOutcome;

/// One registered pipeline
struct Pipeline {
    num_workers: usize,
    strategy: SelectionStrategy,
    /// Serializes triggers of this pipeline
    trigger_lock: Mutex<()>,
}

/// Selection and triggering engine over a metadata store
pub struct Selector<S> {
    store: Arc<S>,
    config: SelectorConfig,
    pipelines: DashMap<PipelineId, Arc<Pipeline>>,
}

/// Builder for [`Selector`]
#[derive(Debug, Default)]
pub struct SelectorBuilder {
    config: SelectorConfig,
}

impl SelectorBuilder {
    /// Maximum number of concurrent writer tasks per `inform`
    #[must_use]
    pub const fn insertion_threads(mut self, threads: usize) -> Self {
        self.config.insertion_threads = threads;
        self
    }

    /// Maximum number of (key, weight) pairs per streamed batch
    #[must_use]
    pub const fn sample_batch_size(mut self, size: usize) -> Self {
        self.config.sample_batch_size = size;
        self
    }

    /// Directory finalized trigger partitions are spilled to.
    ///
    /// Only recorded in the configuration; the store decides whether it
    /// honours it (see [`crate::metadata::MemoryMetadataStore::from_config`]).
    #[must_use]
    pub fn trigger_sample_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.trigger_sample_directory = Some(directory.into());
        self
    }

    /// The configuration built so far
    #[must_use]
    pub const fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Build the selector over `store`
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a setting is out of range
    pub fn build<S: MetadataStore + 'static>(self, store: S) -> Result<Selector<S>> {
        Selector::new(store, self.config)
    }
}

impl Selector<()> {
    /// Create a new selector builder
    #[must_use]
    pub fn builder() -> SelectorBuilder {
        SelectorBuilder::default()
    }
}

impl<S: MetadataStore + 'static> Selector<S> {
    /// Create a selector over `store`
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if a setting is out of range
    pub fn new(store: S, config: SelectorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(store),
            config,
            pipelines: DashMap::new(),
        })
    }

    /// Engine settings
    #[must_use]
    pub const fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// The underlying metadata store
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of registered pipelines
    #[must_use]
    pub fn num_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    fn pipeline(&self, pipeline_id: PipelineId) -> Result<Arc<Pipeline>> {
        self.pipelines
            .get(&pipeline_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::UnknownPipeline(pipeline_id))
    }

    /// Register a pipeline served by `num_workers` training workers
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for zero workers or an invalid strategy
    #[instrument(skip(self, strategy), fields(strategy_kind = strategy.kind.name()))]
    pub async fn register_pipeline(
        &self,
        num_workers: usize,
        strategy: &StrategyConfig,
    ) -> Result<PipelineId> {
        if num_workers == 0 {
            return Err(Error::InvalidConfiguration(
                "num_workers must be at least 1".to_string(),
            ));
        }
        strategy.validate()?;

        let pipeline_id = self.store.allocate_pipeline_id().await?;
        let pipeline = Pipeline {
            num_workers,
            strategy: SelectionStrategy::new(pipeline_id, strategy)?,
            trigger_lock: Mutex::new(()),
        };
        self.pipelines.insert(pipeline_id, Arc::new(pipeline));

        info!(pipeline_id, num_workers, "registered pipeline");
        Ok(pipeline_id)
    }

    /// Register a pipeline from a JSON strategy blob
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for malformed or unknown strategies
    pub async fn register_pipeline_json(
        &self,
        num_workers: usize,
        strategy_json: &str,
    ) -> Result<PipelineId> {
        let strategy = StrategyConfig::from_json(strategy_json)?;
        self.register_pipeline(num_workers, &strategy).await
    }

    /// Append samples to a pipeline. No selection happens here.
    ///
    /// Large inputs are split into up to `insertion_threads` contiguous
    /// slices written concurrently into one reserved block. The call is
    /// all or nothing: on any failure nothing becomes visible and the keys
    /// stay free for a retry.
    ///
    /// # Errors
    /// Returns `LengthMismatch`, `UnknownPipeline`, `DuplicateKey` or any
    /// store failure
    #[instrument(skip(self, keys, timestamps, labels), fields(num_keys = keys.len()))]
    pub async fn inform(
        &self,
        pipeline_id: PipelineId,
        keys: Vec<i64>,
        timestamps: Vec<i64>,
        labels: Vec<i64>,
    ) -> Result<()> {
        if keys.len() != timestamps.len() || keys.len() != labels.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                timestamps: timestamps.len(),
                labels: labels.len(),
            });
        }
        let pipeline = self.pipeline(pipeline_id)?;
        if keys.is_empty() {
            return Ok(());
        }

        let num_slices = self
            .config
            .insertion_threads
            .min(keys.len().div_ceil(MIN_ROWS_PER_WRITER));
        if num_slices <= 1 {
            return pipeline
                .strategy
                .inform_data(self.store.as_ref(), keys, timestamps, labels)
                .await;
        }

        // The whole call is validated and given one block of sequence
        // numbers before any slice writes, so slices keep the caller's order
        // and the block becomes visible all at once.
        let first_seq = self.store.reserve_samples(pipeline_id, &keys).await?;

        let mut tasks = JoinSet::new();
        for slice in 0..num_slices {
            let range = crate::partition::shard_range(keys.len(), slice, num_slices);
            let slice_seq = first_seq + range.start as u64;
            let store = Arc::clone(&self.store);
            let keys = keys[range.clone()].to_vec();
            let timestamps = timestamps[range.clone()].to_vec();
            let labels = labels[range].to_vec();
            tasks.spawn(async move {
                store
                    .insert_reserved(pipeline_id, slice_seq, keys, timestamps, labels)
                    .await
            });
        }
        debug!(pipeline_id, num_slices, first_seq, "parallel insert");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| Error::TaskFailed(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        let result = match first_error {
            Some(e) => Err(e),
            None => self.store.publish_reserved(pipeline_id, first_seq).await,
        };
        if result.is_err() {
            if let Err(e) = self.store.release_reserved(pipeline_id, first_seq).await {
                warn!(pipeline_id, first_seq, error = %e, "failed to release sample block");
            }
        }
        result
    }

    /// Run the pipeline's strategy on everything informed so far
    ///
    /// # Errors
    /// Returns `UnknownPipeline` or any store failure (the trigger is then
    /// rolled back)
    #[instrument(skip(self))]
    pub async fn trigger(&self, pipeline_id: PipelineId) -> Result<TriggerResponse> {
        let pipeline = self.pipeline(pipeline_id)?;
        let _guard = pipeline.trigger_lock.lock().await;
        pipeline.strategy.trigger(self.store.as_ref()).await
    }

    /// Inform (possibly nothing) and trigger
    ///
    /// # Errors
    /// Same as [`Selector::inform`] and [`Selector::trigger`]
    pub async fn inform_and_trigger(
        &self,
        pipeline_id: PipelineId,
        keys: Vec<i64>,
        timestamps: Vec<i64>,
        labels: Vec<i64>,
    ) -> Result<TriggerResponse> {
        self.inform(pipeline_id, keys, timestamps, labels).await?;
        self.trigger(pipeline_id).await
    }

    /// Partition count of a committed trigger
    ///
    /// # Errors
    /// Returns `UnknownPipeline` or `UnknownTrigger`
    pub async fn get_number_of_partitions(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
    ) -> Result<usize> {
        Ok(self.get_trigger_info(pipeline_id, trigger_id).await?.num_partitions())
    }

    /// Summary of a committed trigger
    ///
    /// # Errors
    /// Returns `UnknownPipeline` or `UnknownTrigger`
    pub async fn get_trigger_info(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
    ) -> Result<TriggerInfo> {
        self.pipeline(pipeline_id)?;
        self.store.trigger_info(pipeline_id, trigger_id).await
    }

    /// A worker's shard of one partition, streamed in batches of at most
    /// `sample_batch_size` pairs. The returned stream can be cloned to
    /// restart it.
    ///
    /// # Errors
    /// Returns `UnknownPipeline`, `UnknownTrigger`, or `OutOfRange` for a
    /// worker or partition id outside the trigger's bounds
    #[instrument(skip(self))]
    pub async fn get_sample_keys_and_weights(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        worker_id: usize,
        partition_id: usize,
    ) -> Result<ShardBatches> {
        let pipeline = self.pipeline(pipeline_id)?;
        if worker_id >= pipeline.num_workers {
            return Err(Error::OutOfRange {
                field: "worker_id",
                value: worker_id,
                bound: pipeline.num_workers,
            });
        }

        let batch = self
            .store
            .partition(pipeline_id, trigger_id, partition_id)
            .await?;
        ShardBatches::new(
            batch,
            worker_id,
            pipeline.num_workers,
            self.config.sample_batch_size,
        )
    }

    /// Distinct labels informed to a pipeline, sorted ascending
    ///
    /// # Errors
    /// Returns `UnknownPipeline`
    pub async fn get_available_labels(&self, pipeline_id: PipelineId) -> Result<Vec<i64>> {
        self.pipeline(pipeline_id)?;
        self.store.labels(pipeline_id).await
    }

    /// Whether the pipeline's strategy produces non-unit weights
    ///
    /// # Errors
    /// Returns `UnknownPipeline`
    pub fn uses_weights(&self, pipeline_id: PipelineId) -> Result<bool> {
        Ok(self.pipeline(pipeline_id)?.strategy.uses_weights())
    }

    /// Number of workers a pipeline was registered with
    ///
    /// # Errors
    /// Returns `UnknownPipeline`
    pub fn num_workers(&self, pipeline_id: PipelineId) -> Result<usize> {
        Ok(self.pipeline(pipeline_id)?.num_workers)
    }

    /// Sample size the next trigger of a downsampling pipeline would draw
    ///
    /// # Errors
    /// Returns `UnknownPipeline`, or `Unsupported` for other strategy kinds
    pub async fn get_presampling_target_size(&self, pipeline_id: PipelineId) -> Result<usize> {
        let pipeline = self.pipeline(pipeline_id)?;
        let engine = pipeline.strategy.as_downsampling().ok_or_else(|| {
            Error::Unsupported(format!(
                "pipeline {pipeline_id} does not use a downsampling strategy"
            ))
        })?;
        engine.get_presampling_target_size(self.store.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitReset, NewDataConfig, StrategyKind};
    use crate::metadata::MemoryMetadataStore;

    fn new_data(reset: bool, max_keys: usize) -> StrategyConfig {
        StrategyConfig::new(
            StrategyKind::NewData(NewDataConfig {
                reset_after_trigger: reset,
                ..NewDataConfig::default()
            }),
            max_keys,
        )
        .unwrap()
    }

    fn selector() -> Selector<MemoryMetadataStore> {
        Selector::builder().build(MemoryMetadataStore::new()).unwrap()
    }

    #[test]
    fn test_builder_validates() {
        let result = Selector::builder()
            .insertion_threads(0)
            .build(MemoryMetadataStore::new());
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));

        let builder = Selector::builder()
            .sample_batch_size(5)
            .trigger_sample_directory("/tmp/samples");
        assert_eq!(builder.config().sample_batch_size, 5);
        assert!(builder.config().trigger_sample_directory.is_some());
    }

    #[tokio::test]
    async fn test_register_assigns_increasing_ids() {
        let selector = selector();
        let first = selector.register_pipeline(1, &new_data(false, 10)).await.unwrap();
        let second = selector.register_pipeline(1, &new_data(false, 10)).await.unwrap();
        assert!(second > first);
        assert_eq!(selector.num_pipelines(), 2);
    }

    #[tokio::test]
    async fn test_register_rejects_zero_workers() {
        let result = selector().register_pipeline(0, &new_data(false, 10)).await;
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_register_json_rejects_unknown_strategy() {
        let result = selector()
            .register_pipeline_json(1, r#"{"name": "Nope", "maximum_keys_in_memory": 1}"#)
            .await;
        assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_inform_length_mismatch() {
        let selector = selector();
        let pipeline_id = selector.register_pipeline(1, &new_data(false, 10)).await.unwrap();
        let err = selector
            .inform(pipeline_id, vec![1, 2], vec![0], vec![0, 0])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::LengthMismatch {
                keys: 2,
                timestamps: 1,
                labels: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let selector = selector();
        assert!(matches!(
            selector.inform(9, vec![], vec![], vec![]).await,
            Err(Error::UnknownPipeline(9))
        ));
        assert!(matches!(selector.trigger(9).await, Err(Error::UnknownPipeline(9))));
        assert!(matches!(selector.uses_weights(9), Err(Error::UnknownPipeline(9))));
    }

    #[tokio::test]
    async fn test_parallel_inform_inserts_everything() {
        let selector = Selector::builder()
            .insertion_threads(4)
            .build(MemoryMetadataStore::new())
            .unwrap();
        let pipeline_id = selector.register_pipeline(1, &new_data(false, 100_000)).await.unwrap();

        let n = 5 * MIN_ROWS_PER_WRITER;
        let keys: Vec<i64> = (0..n as i64).collect();
        selector
            .inform(pipeline_id, keys, vec![0; n], vec![0; n])
            .await
            .unwrap();

        let response = selector.trigger(pipeline_id).await.unwrap();
        assert_eq!(response.num_keys, n);
    }

    #[tokio::test]
    async fn test_parallel_inform_rejects_repeated_key() {
        let selector = selector();
        let pipeline_id = selector.register_pipeline(1, &new_data(false, 10)).await.unwrap();

        let n = 3 * MIN_ROWS_PER_WRITER;
        let mut keys: Vec<i64> = (0..n as i64).collect();
        keys[n - 1] = 0;
        let err = selector
            .inform(pipeline_id, keys, vec![0; n], vec![0; n])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { key: 0, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_inform_keeps_caller_order() {
        let strategy = StrategyConfig::new(
            StrategyKind::NewData(NewDataConfig {
                limit: 1024,
                limit_reset: LimitReset::LastX,
                ..NewDataConfig::default()
            }),
            100_000,
        )
        .unwrap();
        let n = 8 * MIN_ROWS_PER_WRITER;

        for _ in 0..20 {
            let selector = Selector::builder()
                .insertion_threads(4)
                .build(MemoryMetadataStore::new())
                .unwrap();
            let pipeline_id = selector.register_pipeline(1, &strategy).await.unwrap();
            let keys: Vec<i64> = (0..n as i64).collect();
            selector
                .inform(pipeline_id, keys.clone(), keys, vec![0; n])
                .await
                .unwrap();

            let response = selector.trigger(pipeline_id).await.unwrap();
            let selected: Vec<i64> = selector
                .get_sample_keys_and_weights(pipeline_id, response.trigger_id, 0, 0)
                .await
                .unwrap()
                .flat_map(|batch| batch.keys)
                .collect();
            assert_eq!(selected, (7 * 1024..8 * 1024).collect::<Vec<i64>>());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_parallel_inform_writes_nothing() {
        let selector = Selector::builder()
            .insertion_threads(2)
            .build(MemoryMetadataStore::new())
            .unwrap();
        let pipeline_id = selector.register_pipeline(1, &new_data(false, 100_000)).await.unwrap();
        selector
            .inform(pipeline_id, vec![4000], vec![0], vec![0])
            .await
            .unwrap();

        let n = 4 * MIN_ROWS_PER_WRITER;
        let keys: Vec<i64> = (0..n as i64).collect();
        let err = selector
            .inform(pipeline_id, keys.clone(), vec![0; n], vec![0; n])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { key: 4000, .. }));
        assert_eq!(selector.trigger(pipeline_id).await.unwrap().num_keys, 1);

        // Dropping the offending key is enough for the retry to succeed
        let keys: Vec<i64> = keys.into_iter().filter(|&k| k != 4000).collect();
        let m = keys.len();
        selector
            .inform(pipeline_id, keys, vec![0; m], vec![0; m])
            .await
            .unwrap();
        assert_eq!(selector.trigger(pipeline_id).await.unwrap().num_keys, n);
    }

    #[tokio::test]
    async fn test_worker_out_of_range() {
        let selector = selector();
        let pipeline_id = selector.register_pipeline(2, &new_data(false, 10)).await.unwrap();
        let response = selector
            .inform_and_trigger(pipeline_id, vec![1], vec![0], vec![0])
            .await
            .unwrap();

        let err = selector
            .get_sample_keys_and_weights(pipeline_id, response.trigger_id, 2, 0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfRange {
                field: "worker_id",
                value: 2,
                bound: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_presampling_target_size_requires_downsampling() {
        let selector = selector();
        let pipeline_id = selector.register_pipeline(1, &new_data(false, 10)).await.unwrap();
        let result = selector.get_presampling_target_size(pipeline_id).await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
