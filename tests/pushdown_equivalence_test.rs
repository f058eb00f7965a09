//! Pushdown vs in-engine sampling: same statistical contract
//!
//! Stores that evaluate sampling statements and stores that don't must both
//! draw uniform samples without replacement of the same size with the same
//! weights. Compared distributionally, never bit for bit.

use quickcheck::{QuickCheck, TestResult};
use trueno_select::config::{DownsamplingConfig, StrategyConfig, StrategyKind};
use trueno_select::metadata::MemoryMetadataStore;
use trueno_select::Selector;

const NUM_KEYS: usize = 20;
const TRIALS: usize = 400;

fn downsampling(ratio: i64, limit: i64) -> StrategyConfig {
    StrategyConfig::new(
        StrategyKind::Downsampling(DownsamplingConfig {
            presampling_ratio: ratio,
            limit,
            reset_after_trigger: false,
        }),
        8,
    )
    .unwrap()
}

/// Per-key inclusion frequency over `TRIALS` triggers, plus the weights seen
async fn inclusion_frequencies(store: MemoryMetadataStore, ratio: i64) -> (Vec<f64>, Vec<f32>) {
    let selector = Selector::builder().build(store).unwrap();
    let pipeline_id = selector
        .register_pipeline(1, &downsampling(ratio, -1))
        .await
        .unwrap();
    let keys: Vec<i64> = (0..NUM_KEYS as i64).collect();
    selector
        .inform(pipeline_id, keys, vec![0; NUM_KEYS], vec![0; NUM_KEYS])
        .await
        .unwrap();

    let mut hits = vec![0usize; NUM_KEYS];
    let mut weights = Vec::new();
    for _ in 0..TRIALS {
        let response = selector.trigger(pipeline_id).await.unwrap();
        for partition_id in 0..response.num_partitions {
            let stream = selector
                .get_sample_keys_and_weights(pipeline_id, response.trigger_id, 0, partition_id)
                .await
                .unwrap();
            for batch in stream {
                for key in batch.keys {
                    hits[usize::try_from(key).unwrap()] += 1;
                }
                weights.extend(batch.weights);
            }
        }
    }

    let frequencies = hits
        .into_iter()
        .map(|h| h as f64 / TRIALS as f64)
        .collect();
    (frequencies, weights)
}

#[tokio::test]
async fn test_both_paths_sample_uniformly() {
    let (pushdown, pushdown_weights) = inclusion_frequencies(MemoryMetadataStore::new(), 50).await;
    let (fallback, fallback_weights) =
        inclusion_frequencies(MemoryMetadataStore::new().with_sql_pushdown(false), 50).await;

    // p = 0.5, 400 trials: std dev 0.025, tolerance is six of them
    for (key, (a, b)) in pushdown.iter().zip(&fallback).enumerate() {
        assert!((a - 0.5).abs() < 0.15, "pushdown key {key}: {a}");
        assert!((b - 0.5).abs() < 0.15, "fallback key {key}: {b}");
    }

    assert_eq!(pushdown_weights.len(), TRIALS * NUM_KEYS / 2);
    assert_eq!(fallback_weights.len(), pushdown_weights.len());
    assert!(pushdown_weights.iter().all(|&w| (w - 2.0).abs() < 1e-6));
    assert!(fallback_weights.iter().all(|&w| (w - 2.0).abs() < 1e-6));
}

#[test]
fn quickcheck_both_paths_agree_on_sample_size() {
    fn prop(dataset: u8, ratio: u8, limit: u8) -> TestResult {
        let ratio = i64::from(ratio % 100) + 1;
        let dataset = usize::from(dataset);
        let limit = i64::from(limit) - 1;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let sizes = runtime.block_on(async {
            let mut sizes = Vec::new();
            for pushdown in [true, false] {
                let store = MemoryMetadataStore::new().with_sql_pushdown(pushdown);
                let selector = Selector::builder().build(store).unwrap();
                let pipeline_id = selector
                    .register_pipeline(1, &downsampling(ratio, limit))
                    .await
                    .unwrap();
                let keys: Vec<i64> = (0..dataset as i64).collect();
                selector
                    .inform(pipeline_id, keys, vec![0; dataset], vec![0; dataset])
                    .await
                    .unwrap();
                sizes.push(selector.trigger(pipeline_id).await.unwrap().num_keys);
            }
            sizes
        });

        let mut expected = dataset * usize::try_from(ratio).unwrap() / 100;
        if let Ok(limit) = usize::try_from(limit) {
            expected = expected.min(limit);
        }
        TestResult::from_bool(sizes == vec![expected, expected])
    }

    QuickCheck::new()
        .tests(50)
        .quickcheck(prop as fn(u8, u8, u8) -> TestResult);
}
