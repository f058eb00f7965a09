//! Query execution engine
//!
//! Evaluates parsed sampling plans against Arrow batches: predicates become
//! boolean masks, `ORDER BY RANDOM() LIMIT n` becomes a uniform draw of `n`
//! row indices without replacement.

use super::{Literal, Predicate, QueryPlan};
use crate::{Error, Result};
use arrow::array::{Array, AsArray, BooleanArray, RecordBatch, UInt32Array};
use arrow::compute;
use arrow::datatypes::{DataType, Int64Type, Schema, SchemaRef, UInt64Type};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;

/// Query executor for parsed sampling plans
pub struct QueryExecutor {
    rng: StdRng,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryExecutor {
    /// Create a new executor seeded from OS entropy
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create an executor with a fixed seed (reproducible random ordering)
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Execute a query plan against `batches` (all of `schema`)
    ///
    /// # Errors
    /// Returns error if:
    /// - A column referenced by the plan is not in the schema
    /// - A predicate compares a column with a literal of the wrong type
    /// - Arrow kernels fail
    pub fn execute(
        &mut self,
        plan: &QueryPlan,
        schema: &SchemaRef,
        batches: &[RecordBatch],
    ) -> Result<RecordBatch> {
        let mut filtered = Vec::with_capacity(batches.len());
        for batch in batches {
            let batch = Self::apply_predicates(batch, &plan.predicates)?;
            if batch.num_rows() > 0 {
                filtered.push(batch);
            }
        }
        let combined = compute::concat_batches(schema, &filtered)
            .map_err(|e| Error::StorageError(format!("Failed to combine batches: {e}")))?;

        let sampled = self.random_sample(&combined, plan.limit)?;
        Self::project_columns(&sampled, &plan.columns)
    }

    fn column_index(schema: &Schema, name: &str) -> Result<usize> {
        schema
            .fields()
            .iter()
            .position(|f| f.name() == name)
            .ok_or_else(|| Error::ParseError(format!("Column not found: {name}")))
    }

    fn apply_predicates(batch: &RecordBatch, predicates: &[Predicate]) -> Result<RecordBatch> {
        if predicates.is_empty() {
            return Ok(batch.clone());
        }

        let mut mask: Option<BooleanArray> = None;
        for predicate in predicates {
            let next = Self::build_mask(batch, predicate)?;
            mask = Some(match mask {
                Some(acc) => compute::and(&acc, &next)?,
                None => next,
            });
        }

        match mask {
            Some(mask) => compute::filter_record_batch(batch, &mask)
                .map_err(|e| Error::StorageError(format!("Failed to apply filter: {e}"))),
            None => Ok(batch.clone()),
        }
    }

    fn build_mask(batch: &RecordBatch, predicate: &Predicate) -> Result<BooleanArray> {
        let index = Self::column_index(&batch.schema(), &predicate.column)?;
        let column = batch.column(index);
        let op = predicate.op;

        let mask = match (column.data_type(), predicate.value) {
            (DataType::Int64, Literal::Int(value)) => {
                let array = column.as_primitive::<Int64Type>();
                Self::compare(array.len(), |i| !array.is_null(i) && op.eval(&array.value(i), &value))
            }
            (DataType::UInt64, Literal::Int(value)) => {
                let array = column.as_primitive::<UInt64Type>();
                let value = i128::from(value);
                Self::compare(array.len(), |i| {
                    !array.is_null(i) && op.eval(&i128::from(array.value(i)), &value)
                })
            }
            (DataType::Boolean, Literal::Bool(value)) => {
                let array = column.as_boolean();
                Self::compare(array.len(), |i| !array.is_null(i) && op.eval(&array.value(i), &value))
            }
            (dt, literal) => {
                return Err(Error::ParseError(format!(
                    "Cannot compare column {} of type {dt:?} with {literal:?}",
                    predicate.column
                )))
            }
        };
        Ok(mask)
    }

    fn compare(len: usize, keep: impl Fn(usize) -> bool) -> BooleanArray {
        (0..len).map(|i| Some(keep(i))).collect()
    }

    /// Uniform sample of `limit` rows without replacement, in random order
    fn random_sample(&mut self, batch: &RecordBatch, limit: Option<usize>) -> Result<RecordBatch> {
        let num_rows = batch.num_rows();
        let amount = limit.map_or(num_rows, |limit| limit.min(num_rows));

        let indices = rand::seq::index::sample(&mut self.rng, num_rows, amount);
        let indices = indices
            .iter()
            .map(|i| {
                u32::try_from(i)
                    .map_err(|_| Error::StorageError(format!("Row index {i} exceeds u32")))
            })
            .collect::<Result<Vec<u32>>>()?;

        Ok(compute::take_record_batch(batch, &UInt32Array::from(indices))?)
    }

    /// Project columns from batch
    fn project_columns(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch> {
        if columns.len() == 1 && columns[0] == "*" {
            return Ok(batch.clone());
        }

        let schema = batch.schema();
        let indices = columns
            .iter()
            .map(|name| Self::column_index(&schema, name))
            .collect::<Result<Vec<_>>>()?;

        let fields: Vec<_> = indices.iter().map(|&i| schema.field(i).clone()).collect();
        let arrays = indices.iter().map(|&i| batch.column(i).clone()).collect();

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
            .map_err(|e| Error::StorageError(format!("Failed to project columns: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryEngine;
    use arrow::array::Int64Array;
    use arrow::datatypes::Field;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("seq", DataType::UInt64, false),
            Field::new("sample_key", DataType::Int64, false),
            Field::new("used", DataType::Boolean, false),
        ]))
    }

    fn create_test_batch(first: u64, rows: u64, used_every: u64) -> RecordBatch {
        let seq: Vec<u64> = (first..first + rows).collect();
        let keys: Vec<i64> = seq.iter().map(|&s| i64::try_from(s).unwrap() * 10).collect();
        let used: Vec<bool> = seq.iter().map(|&s| s % used_every == 0).collect();
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(arrow::array::UInt64Array::from(seq)),
                Arc::new(Int64Array::from(keys)),
                Arc::new(BooleanArray::from(used)),
            ],
        )
        .unwrap()
    }

    fn run(sql: &str, batches: &[RecordBatch]) -> RecordBatch {
        let plan = QueryEngine::new().parse(sql).unwrap();
        QueryExecutor::with_seed(7)
            .execute(&plan, &test_schema(), batches)
            .unwrap()
    }

    #[test]
    fn test_filter_across_batches() {
        let batches = vec![create_test_batch(0, 5, 2), create_test_batch(5, 5, 2)];
        let result = run(
            "SELECT sample_key FROM t WHERE used = false AND seq < 8 ORDER BY RANDOM()",
            &batches,
        );

        let mut keys = result.column(0).as_primitive::<Int64Type>().values().to_vec();
        keys.sort_unstable();
        assert_eq!(keys, vec![10, 30, 50, 70]);
    }

    #[test]
    fn test_random_sample_respects_limit_and_filter() {
        let batches = vec![create_test_batch(0, 100, 3)];
        let result = run(
            "SELECT * FROM t WHERE used = false ORDER BY RANDOM() LIMIT 10",
            &batches,
        );

        assert_eq!(result.num_rows(), 10);
        let used = result.column(2).as_boolean();
        assert!((0..used.len()).all(|i| !used.value(i)));

        let mut seqs = result.column(0).as_primitive::<UInt64Type>().values().to_vec();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 10, "sample must be without replacement");
    }

    #[test]
    fn test_random_sample_limit_larger_than_rows() {
        let batches = vec![create_test_batch(0, 4, 100)];
        let result = run("SELECT * FROM t ORDER BY RANDOM() LIMIT 50", &batches);
        assert_eq!(result.num_rows(), 4);
    }

    #[test]
    fn test_sample_order_varies_with_seed() {
        let batches = vec![create_test_batch(0, 50, 100)];
        let plan = QueryEngine::new()
            .parse("SELECT seq FROM t ORDER BY RANDOM()")
            .unwrap();
        let draw = |seed| {
            let result = QueryExecutor::with_seed(seed)
                .execute(&plan, &test_schema(), &batches)
                .unwrap();
            result.column(0).as_primitive::<UInt64Type>().values().to_vec()
        };

        let first = draw(1);
        assert_eq!(first.len(), 50);
        assert_eq!(first, draw(1));
        assert_ne!(first, draw(2));
    }

    #[test]
    fn test_empty_input_yields_empty_result() {
        let result = run("SELECT * FROM t WHERE seq < 3 ORDER BY RANDOM() LIMIT 2", &[]);
        assert_eq!(result.num_rows(), 0);
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let plan = QueryEngine::new()
            .parse("SELECT * FROM t WHERE used = 1 ORDER BY RANDOM()")
            .unwrap();
        let result =
            QueryExecutor::new().execute(&plan, &test_schema(), &[create_test_batch(0, 3, 2)]);
        assert!(result.unwrap_err().to_string().contains("Cannot compare"));
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let plan = QueryEngine::new()
            .parse("SELECT * FROM t WHERE missing = 1 ORDER BY RANDOM()")
            .unwrap();
        let result =
            QueryExecutor::new().execute(&plan, &test_schema(), &[create_test_batch(0, 3, 2)]);
        assert!(result.unwrap_err().to_string().contains("Column not found"));
    }
}
