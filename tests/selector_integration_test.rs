//! End-to-end selector scenarios against the in-memory metadata store

use std::collections::BTreeSet;
use std::sync::Arc;
use trueno_select::config::{
    DownsamplingConfig, NewDataConfig, SelectorConfig, StrategyConfig, StrategyKind,
};
use trueno_select::metadata::MemoryMetadataStore;
use trueno_select::{Error, Selector};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

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
    init_tracing();
    Selector::builder().build(MemoryMetadataStore::new()).unwrap()
}

/// Every key a trigger hands out, gathered over all partitions and workers
async fn collect_keys(
    selector: &Selector<MemoryMetadataStore>,
    pipeline_id: u64,
    trigger_id: u64,
) -> Vec<i64> {
    let partitions = selector
        .get_number_of_partitions(pipeline_id, trigger_id)
        .await
        .unwrap();
    let workers = selector.num_workers(pipeline_id).unwrap();

    let mut keys = Vec::new();
    for partition_id in 0..partitions {
        for worker_id in 0..workers {
            let stream = selector
                .get_sample_keys_and_weights(pipeline_id, trigger_id, worker_id, partition_id)
                .await
                .unwrap();
            keys.extend(stream.flat_map(|batch| batch.keys));
        }
    }
    keys
}

#[tokio::test]
async fn test_new_data_scenario_two_workers() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(2, &new_data(true, 2)).await.unwrap();

    let empty = selector
        .inform_and_trigger(pipeline_id, vec![], vec![], vec![])
        .await
        .unwrap();
    assert_eq!(empty.num_keys, 0);
    assert_eq!(empty.num_partitions, 0);

    selector
        .inform(pipeline_id, vec![0, 1, 2], vec![0, 1, 2], vec![0, 0, 1])
        .await
        .unwrap();
    let response = selector
        .inform_and_trigger(pipeline_id, vec![3, 4, 5], vec![3, 4, 5], vec![1, 2, 2])
        .await
        .unwrap();
    assert!(response.trigger_id > empty.trigger_id);
    assert_eq!(response.num_keys, 6);
    assert_eq!(response.num_partitions, 3);

    for partition_id in 0..3 {
        for worker_id in 0..2 {
            let keys: Vec<i64> = selector
                .get_sample_keys_and_weights(pipeline_id, response.trigger_id, worker_id, partition_id)
                .await
                .unwrap()
                .flat_map(|batch| batch.keys)
                .collect();
            let expected = i64::try_from(partition_id * 2 + worker_id).unwrap();
            assert_eq!(keys, vec![expected]);
        }
    }
}

#[tokio::test]
async fn test_large_single_partition_split_between_workers() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(2, &new_data(true, 50_000)).await.unwrap();

    let keys: Vec<i64> = (0..10_000).collect();
    let response = selector
        .inform_and_trigger(pipeline_id, keys, vec![0; 10_000], vec![0; 10_000])
        .await
        .unwrap();
    assert_eq!(response.num_partitions, 1);

    for worker_id in 0..2 {
        let stream = selector
            .get_sample_keys_and_weights(pipeline_id, response.trigger_id, worker_id, 0)
            .await
            .unwrap();
        assert_eq!(stream.num_keys(), 5_000);
    }

    let mut all = collect_keys(&selector, pipeline_id, response.trigger_id).await;
    all.sort_unstable();
    assert_eq!(all, (0..10_000).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_reset_triggers_return_exactly_new_keys() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(3, &new_data(true, 4)).await.unwrap();

    let rounds: [&[i64]; 3] = [&[1, 2, 3, 4, 5], &[6, 7], &[8, 9, 10, 11, 12, 13, 14]];
    for round in rounds {
        let n = round.len();
        let response = selector
            .inform_and_trigger(pipeline_id, round.to_vec(), vec![0; n], vec![0; n])
            .await
            .unwrap();

        let keys = collect_keys(&selector, pipeline_id, response.trigger_id).await;
        assert_eq!(keys.len(), n, "no duplicates");
        let keys: BTreeSet<i64> = keys.into_iter().collect();
        assert_eq!(keys, round.iter().copied().collect());
    }
}

#[tokio::test]
async fn test_replay_without_reset_is_identical() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(2, &new_data(false, 3)).await.unwrap();
    selector
        .inform(pipeline_id, vec![5, 6, 7, 8], vec![0, 1, 2, 3], vec![0; 4])
        .await
        .unwrap();

    let first = selector.trigger(pipeline_id).await.unwrap();
    let second = selector
        .inform_and_trigger(pipeline_id, vec![], vec![], vec![])
        .await
        .unwrap();
    assert_eq!(
        collect_keys(&selector, pipeline_id, first.trigger_id).await,
        collect_keys(&selector, pipeline_id, second.trigger_id).await
    );
}

#[tokio::test]
async fn test_downsampling_weights_estimate_dataset_size() {
    let selector = selector();
    let config = StrategyConfig::new(
        StrategyKind::Downsampling(DownsamplingConfig {
            presampling_ratio: 25,
            ..DownsamplingConfig::default()
        }),
        64,
    )
    .unwrap();
    let pipeline_id = selector.register_pipeline(2, &config).await.unwrap();
    assert!(selector.uses_weights(pipeline_id).unwrap());

    let keys: Vec<i64> = (0..1_000).collect();
    selector
        .inform(pipeline_id, keys, vec![0; 1_000], vec![0; 1_000])
        .await
        .unwrap();
    assert_eq!(selector.get_presampling_target_size(pipeline_id).await.unwrap(), 250);

    let response = selector.trigger(pipeline_id).await.unwrap();
    assert_eq!(response.num_keys, 250);

    let info = selector
        .get_trigger_info(pipeline_id, response.trigger_id)
        .await
        .unwrap();
    assert!(info.partition_sizes.iter().all(|&size| size <= 64));
    assert_eq!(info.partition_sizes.iter().sum::<usize>(), 250);

    let mut weight_sum = 0.0_f64;
    for partition_id in 0..response.num_partitions {
        for worker_id in 0..2 {
            for batch in selector
                .get_sample_keys_and_weights(pipeline_id, response.trigger_id, worker_id, partition_id)
                .await
                .unwrap()
            {
                weight_sum += batch.weights.iter().map(|&w| f64::from(w)).sum::<f64>();
            }
        }
    }
    assert!((weight_sum - 1_000.0).abs() < 1e-2, "weight sum {weight_sum}");
}

#[tokio::test]
async fn test_zero_partition_trigger_rejects_partition_zero() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(1, &new_data(true, 2)).await.unwrap();
    let response = selector.trigger(pipeline_id).await.unwrap();

    let err = selector
        .get_sample_keys_and_weights(pipeline_id, response.trigger_id, 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::OutOfRange {
            field: "partition_id",
            value: 0,
            bound: 0
        }
    ));
}

#[tokio::test]
async fn test_unknown_trigger() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(1, &new_data(true, 2)).await.unwrap();

    let err = selector.get_number_of_partitions(pipeline_id, 42).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnknownTrigger {
            trigger_id: 42,
            ..
        }
    ));
}

#[tokio::test]
async fn test_streams_are_bounded_and_restartable() {
    init_tracing();
    let selector = Selector::builder()
        .sample_batch_size(3)
        .build(MemoryMetadataStore::new())
        .unwrap();
    let pipeline_id = selector.register_pipeline(1, &new_data(false, 100)).await.unwrap();
    let keys: Vec<i64> = (0..10).collect();
    let response = selector
        .inform_and_trigger(pipeline_id, keys, vec![0; 10], vec![0; 10])
        .await
        .unwrap();

    let stream = selector
        .get_sample_keys_and_weights(pipeline_id, response.trigger_id, 0, 0)
        .await
        .unwrap();
    let sizes: Vec<usize> = stream.clone().map(|batch| batch.len()).collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);

    let again = selector
        .get_sample_keys_and_weights(pipeline_id, response.trigger_id, 0, 0)
        .await
        .unwrap();
    assert_eq!(stream.collect::<Vec<_>>(), again.collect::<Vec<_>>());
}

#[tokio::test]
async fn test_labels_and_duplicate_keys() {
    let selector = selector();
    let pipeline_id = selector.register_pipeline(1, &new_data(false, 10)).await.unwrap();
    selector
        .inform(pipeline_id, vec![1, 2, 3], vec![0, 1, 2], vec![9, 3, 9])
        .await
        .unwrap();
    assert_eq!(selector.get_available_labels(pipeline_id).await.unwrap(), vec![3, 9]);

    let err = selector
        .inform(pipeline_id, vec![4, 2], vec![3, 4], vec![0, 0])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { key: 2, .. }));
}

#[tokio::test]
async fn test_concurrent_triggers_on_one_pipeline_serialize() {
    let selector = Arc::new(selector());
    let pipeline_id = selector.register_pipeline(1, &new_data(true, 5)).await.unwrap();
    let keys: Vec<i64> = (0..40).collect();
    selector
        .inform(pipeline_id, keys, vec![0; 40], vec![0; 40])
        .await
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let selector = Arc::clone(&selector);
            tokio::spawn(async move { selector.trigger(pipeline_id).await })
        })
        .collect();

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    let ids: BTreeSet<u64> = responses.iter().map(|r| r.trigger_id).collect();
    assert_eq!(ids.len(), 4);
    // Exactly one trigger consumed the pool
    let totals: Vec<usize> = responses.iter().map(|r| r.num_keys).collect();
    assert_eq!(totals.iter().sum::<usize>(), 40);
    assert_eq!(totals.iter().filter(|&&n| n == 40).count(), 1);
}

#[tokio::test]
async fn test_pipelines_are_independent() {
    let selector = selector();
    let a = selector.register_pipeline(1, &new_data(true, 10)).await.unwrap();
    let b = selector.register_pipeline(1, &new_data(true, 10)).await.unwrap();

    selector.inform(a, vec![1, 2], vec![0, 0], vec![0, 0]).await.unwrap();
    selector.inform(b, vec![1], vec![0], vec![0]).await.unwrap();

    assert_eq!(selector.trigger(a).await.unwrap().num_keys, 2);
    assert_eq!(selector.trigger(b).await.unwrap().num_keys, 1);
}

#[tokio::test]
async fn test_spilled_triggers_served_from_parquet() {
    init_tracing();
    let dir = std::env::temp_dir().join(format!("trueno_select_it_{}", std::process::id()));
    let config = SelectorConfig {
        trigger_sample_directory: Some(dir.clone()),
        ..SelectorConfig::default()
    };
    let store = MemoryMetadataStore::from_config(&config).unwrap();
    let selector = Selector::new(store, config).unwrap();

    let pipeline_id = selector.register_pipeline(2, &new_data(true, 2)).await.unwrap();
    let response = selector
        .inform_and_trigger(pipeline_id, vec![0, 1, 2, 3, 4], vec![0; 5], vec![0; 5])
        .await
        .unwrap();
    assert_eq!(response.num_partitions, 3);
    assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 3);

    let mut keys = collect_keys(&selector, pipeline_id, response.trigger_id).await;
    keys.sort_unstable();
    assert_eq!(keys, vec![0, 1, 2, 3, 4]);

    std::fs::remove_dir_all(&dir).unwrap();
}
