//! # Trueno-Select: Selection & Triggering Engine for Continual Learning
//!
//! **Version**: 0.1.0
//!
//! Trueno-Select records a stream of labeled sample keys per training
//! pipeline and, at operator-chosen triggers, carves a bounded-memory,
//! reproducible training set out of the accumulated history. Each trigger is
//! split into partitions of at most `maximum_keys_in_memory` keys, and each
//! partition into one deterministic shard per training worker.
//!
//! ## Design Principles
//!
//! - **Append-only storage**: samples are Arrow record batches, never updated
//!   in place; only the `used` flag flips on reset-type triggers
//! - **Snapshot-then-sample**: a trigger sees exactly the records informed
//!   before it started
//! - **Atomic triggers**: partitions are staged and published together, or
//!   discarded together on failure
//! - **Pushdown when possible**: random sampling runs as a SQL statement in
//!   stores that support it, in the engine otherwise
//!
//! ## Example Usage
//!
//! ```rust
//! use trueno_select::metadata::MemoryMetadataStore;
//! use trueno_select::Selector;
//!
//! # async fn example() -> trueno_select::Result<()> {
//! let selector = Selector::builder().build(MemoryMetadataStore::new())?;
//! let pipeline_id = selector
//!     .register_pipeline_json(
//!         1,
//!         r#"{"name": "DownsamplingStrategy", "maximum_keys_in_memory": 1000,
//!             "config": {"presampling_ratio": 50}}"#,
//!     )
//!     .await?;
//!
//! let keys: Vec<i64> = (0..100).collect();
//! let response = selector
//!     .inform_and_trigger(pipeline_id, keys, vec![0; 100], vec![0; 100])
//!     .await?;
//! assert_eq!(response.num_keys, 50);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod drift;
pub mod error;
pub mod metadata;
pub mod partition;
pub mod query;
pub mod selector;
pub mod strategy;

pub use config::{SelectorConfig, StrategyConfig};
pub use error::{Error, Result};
pub use partition::{KeyWeightBatch, ShardBatches};
pub use selector::{Selector, SelectorBuilder, TriggerResponse};
