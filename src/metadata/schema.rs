//! Arrow schemas of the sample and partition tables

use crate::Result;
use arrow::array::{Float32Array, Int64Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::sync::{Arc, OnceLock};

/// Table name used in sampling statements
pub const SAMPLE_TABLE: &str = "selector_state_metadata";

/// Schema of the per-pipeline sample table.
///
/// `used` is not part of the stored batches; it lives in a separate flag
/// vector and is attached as a column only when a query needs it.
#[must_use]
pub fn sample_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new("pipeline_id", DataType::UInt64, false),
                Field::new("seq", DataType::UInt64, false),
                Field::new("sample_key", DataType::Int64, false),
                Field::new("timestamp", DataType::Int64, false),
                Field::new("label", DataType::Int64, false),
            ]))
        })
        .clone()
}

/// Schema of a finalized trigger partition
#[must_use]
pub fn partition_schema() -> SchemaRef {
    static SCHEMA: OnceLock<SchemaRef> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            Arc::new(Schema::new(vec![
                Field::new("sample_key", DataType::Int64, false),
                Field::new("weight", DataType::Float32, false),
            ]))
        })
        .clone()
}

/// Build one sample batch; `first_seq` is the sequence number of row 0.
pub(crate) fn sample_batch(
    pipeline_id: u64,
    first_seq: u64,
    keys: Vec<i64>,
    timestamps: Vec<i64>,
    labels: Vec<i64>,
) -> Result<RecordBatch> {
    let rows = keys.len() as u64;
    let batch = RecordBatch::try_new(
        sample_schema(),
        vec![
            Arc::new(UInt64Array::from(vec![pipeline_id; keys.len()])),
            Arc::new(UInt64Array::from_iter_values(first_seq..first_seq + rows)),
            Arc::new(Int64Array::from(keys)),
            Arc::new(Int64Array::from(timestamps)),
            Arc::new(Int64Array::from(labels)),
        ],
    )?;
    Ok(batch)
}

/// Build a partition batch from parallel key/weight vectors.
///
/// # Errors
/// Returns error if the vectors differ in length
pub fn partition_batch(keys: Vec<i64>, weights: Vec<f32>) -> Result<RecordBatch> {
    let batch = RecordBatch::try_new(
        partition_schema(),
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(Float32Array::from(weights)),
        ],
    )?;
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::AsArray;
    use arrow::datatypes::UInt64Type;

    #[test]
    fn test_sample_batch_assigns_dense_seq() {
        let batch = sample_batch(7, 40, vec![1, 2, 3], vec![0, 0, 0], vec![5, 5, 5]).unwrap();
        assert_eq!(batch.num_rows(), 3);

        let seq = batch.column(1).as_primitive::<UInt64Type>();
        assert_eq!(seq.values().to_vec(), vec![40, 41, 42]);
    }

    #[test]
    fn test_partition_batch_length_mismatch() {
        let result = partition_batch(vec![1, 2], vec![1.0]);
        assert!(result.is_err());
    }
}
