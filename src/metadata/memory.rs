//! In-memory metadata store using `DashMap` and Arrow record batches.
//!
//! This is the default backend - data is lost on process restart, except for
//! trigger partitions spilled to a [`TriggerSampleStorage`] directory.

use super::schema::sample_batch;
use super::{
    partition_batch, sample_schema, EligibleFilter, MetadataStore, PipelineId, SampleRecord,
    StoreCapabilities, TriggerId, TriggerInfo, TriggerSampleStorage, SAMPLE_TABLE,
};
use crate::config::SelectorConfig;
use crate::query::{CompareOp, Literal, QueryEngine, QueryExecutor};
use crate::{Error, Result};
use arrow::array::{AsArray, BooleanArray, RecordBatch};
use arrow::datatypes::{DataType, Field, Int64Type, Schema, SchemaRef, UInt64Type};
use chrono::Utc;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

enum StoredPartition {
    Memory(RecordBatch),
    Spilled { path: PathBuf, rows: usize },
}

impl StoredPartition {
    fn num_rows(&self) -> usize {
        match self {
            Self::Memory(batch) => batch.num_rows(),
            Self::Spilled { rows, .. } => *rows,
        }
    }

    fn discard(self) {
        if let Self::Spilled { path, .. } = self {
            TriggerSampleStorage::remove(&path);
        }
    }
}

struct CommittedTrigger {
    info: TriggerInfo,
    partitions: Vec<StoredPartition>,
}

/// Sequence block claimed by one inform, filled slice by slice
struct Reservation {
    keys: Vec<i64>,
    /// Written slices keyed by the sequence number of their first row
    slices: BTreeMap<u64, RecordBatch>,
    published: bool,
}

impl Reservation {
    /// End of the contiguous written prefix starting at `first_seq`
    fn filled_until(&self, first_seq: u64) -> u64 {
        let mut next = first_seq;
        for (&start, batch) in &self.slices {
            if start != next {
                break;
            }
            next += batch.num_rows() as u64;
        }
        next
    }
}

/// Columnar sample table plus trigger bookkeeping of one pipeline
#[derive(Default)]
struct PipelineTable {
    /// Visible batches, in sequence order
    batches: Vec<RecordBatch>,
    /// Sequence number of row 0 of each batch
    batch_offsets: Vec<u64>,
    /// `used` flag per visible sequence number
    used: Vec<bool>,
    /// Next sequence number to hand out
    next_seq: u64,
    /// Every record below this sequence number is visible
    visible_seq: u64,
    /// Open reservations keyed by their first sequence number
    reservations: BTreeMap<u64, Reservation>,
    live_keys: FxHashSet<i64>,
    labels: BTreeSet<i64>,
    next_trigger_id: TriggerId,
    staged: FxHashMap<TriggerId, Vec<StoredPartition>>,
    triggers: BTreeMap<TriggerId, CommittedTrigger>,
}

impl PipelineTable {
    fn is_used(&self, seq: u64) -> bool {
        usize::try_from(seq)
            .ok()
            .and_then(|i| self.used.get(i).copied())
            .unwrap_or(false)
    }

    /// Check the whole call against live keys and claim its sequence block
    fn reserve(&mut self, pipeline_id: PipelineId, keys: &[i64]) -> Result<u64> {
        let mut seen = FxHashSet::default();
        for &key in keys {
            if self.live_keys.contains(&key) || !seen.insert(key) {
                return Err(Error::DuplicateKey { pipeline_id, key });
            }
        }

        let first_seq = self.next_seq;
        self.next_seq += keys.len() as u64;
        self.live_keys.extend(seen);
        self.reservations.insert(
            first_seq,
            Reservation {
                keys: keys.to_vec(),
                slices: BTreeMap::new(),
                published: false,
            },
        );
        Ok(first_seq)
    }

    fn fill(&mut self, first_seq: u64, batch: RecordBatch) -> Result<()> {
        let rows = batch.num_rows() as u64;
        let out_of_reservation = || {
            Error::StorageError(format!(
                "No open reservation covers sequence numbers {first_seq}..{}",
                first_seq + rows
            ))
        };

        let (&start, reservation) = self
            .reservations
            .range_mut(..=first_seq)
            .next_back()
            .ok_or_else(out_of_reservation)?;
        let offset = usize::try_from(first_seq - start).map_err(|_| out_of_reservation())?;
        let expected = reservation
            .keys
            .get(offset..offset + batch.num_rows())
            .ok_or_else(out_of_reservation)?;
        if reservation.published || reservation.slices.contains_key(&first_seq) {
            return Err(out_of_reservation());
        }
        if batch.column(2).as_primitive::<Int64Type>().values()[..] != *expected {
            return Err(Error::StorageError(format!(
                "Keys written at sequence number {first_seq} differ from the reserved keys"
            )));
        }

        reservation.slices.insert(first_seq, batch);
        Ok(())
    }

    fn publish(&mut self, first_seq: u64) -> Result<()> {
        let reservation = self.reservations.get_mut(&first_seq).ok_or_else(|| {
            Error::StorageError(format!("No open reservation at sequence number {first_seq}"))
        })?;

        let end = first_seq + reservation.keys.len() as u64;
        let filled = reservation.filled_until(first_seq);
        if filled != end {
            return Err(Error::StorageError(format!(
                "Reservation at {first_seq} is missing sequence numbers {filled}..{end}"
            )));
        }

        reservation.published = true;
        self.advance();
        Ok(())
    }

    fn release(&mut self, first_seq: u64) {
        if let Some(reservation) = self.reservations.remove(&first_seq) {
            for key in &reservation.keys {
                self.live_keys.remove(key);
            }
            self.advance();
        }
    }

    /// Move published reservations at the front into the visible table
    fn advance(&mut self) {
        while let Some(entry) = self.reservations.first_entry() {
            if !entry.get().published {
                break;
            }
            for (start, batch) in entry.remove().slices {
                let labels = batch.column(4).as_primitive::<Int64Type>();
                self.labels.extend(labels.values().iter().copied());
                self.batches.push(batch);
                self.batch_offsets.push(start);
            }
        }

        self.visible_seq = self
            .reservations
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_seq);
        #[allow(clippy::cast_possible_truncation)]
        let visible = self.visible_seq as usize;
        self.used.resize(visible, false);
    }

    /// Visit records with `seq >= from_seq` matching `filter`, in order,
    /// until `visit` returns false.
    fn for_each_matching(
        &self,
        filter: EligibleFilter,
        from_seq: u64,
        mut visit: impl FnMut(SampleRecord) -> bool,
    ) {
        let start = self
            .batch_offsets
            .partition_point(|&offset| offset <= from_seq)
            .saturating_sub(1);

        for (batch, &offset) in self.batches.iter().zip(&self.batch_offsets).skip(start) {
            if offset >= filter.high_watermark {
                return;
            }
            let seqs = batch.column(1).as_primitive::<UInt64Type>();
            let keys = batch.column(2).as_primitive::<Int64Type>();
            let timestamps = batch.column(3).as_primitive::<Int64Type>();
            let labels = batch.column(4).as_primitive::<Int64Type>();

            for row in 0..batch.num_rows() {
                let seq = seqs.value(row);
                if seq < from_seq || !filter.matches(seq, self.is_used(seq)) {
                    continue;
                }
                let record = SampleRecord {
                    seq,
                    key: keys.value(row),
                    timestamp: timestamps.value(row),
                    label: labels.value(row),
                };
                if !visit(record) {
                    return;
                }
            }
        }
    }

    /// Sample batches with the `used` flags attached as a column
    fn batches_with_used(&self, schema: &SchemaRef) -> Result<Vec<RecordBatch>> {
        self.batches
            .iter()
            .zip(&self.batch_offsets)
            .map(|(batch, &offset)| {
                let flags: BooleanArray = (offset..offset + batch.num_rows() as u64)
                    .map(|seq| Some(self.is_used(seq)))
                    .collect();
                let mut columns = batch.columns().to_vec();
                columns.push(Arc::new(flags));
                Ok(RecordBatch::try_new(schema.clone(), columns)?)
            })
            .collect()
    }
}

/// In-memory metadata store.
///
/// Thread-safe: pipelines live in a `DashMap`, each pipeline table behind its
/// own async `RwLock`, so pipelines never contend with each other.
///
/// # Example
///
/// ```rust
/// use trueno_select::metadata::{MemoryMetadataStore, MetadataStore};
///
/// # async fn example() -> trueno_select::Result<()> {
/// let store = MemoryMetadataStore::new().with_sql_pushdown(false);
/// assert!(!store.capabilities().sql_pushdown);
///
/// let pipeline_id = store.allocate_pipeline_id().await?;
/// store.insert_many(pipeline_id, vec![1, 2, 3], vec![0, 1, 2], vec![7, 7, 8]).await?;
/// assert_eq!(store.labels(pipeline_id).await?, vec![7, 8]);
/// # Ok(())
/// # }
/// ```
pub struct MemoryMetadataStore {
    next_pipeline_id: AtomicU64,
    tables: DashMap<PipelineId, Arc<RwLock<PipelineTable>>>,
    sql_pushdown: bool,
    spill: Option<TriggerSampleStorage>,
}

impl MemoryMetadataStore {
    /// Create a new in-memory store with sampling pushdown enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_pipeline_id: AtomicU64::new(0),
            tables: DashMap::new(),
            sql_pushdown: true,
            spill: None,
        }
    }

    /// Create a store honouring the selector's spill directory, if any.
    ///
    /// # Errors
    /// Returns error if the spill directory cannot be created
    pub fn from_config(config: &SelectorConfig) -> Result<Self> {
        let store = Self::new();
        match &config.trigger_sample_directory {
            Some(directory) => {
                Ok(store.with_trigger_sample_storage(TriggerSampleStorage::new(directory)?))
            }
            None => Ok(store),
        }
    }

    /// Enable or disable evaluation of sampling statements.
    ///
    /// With pushdown disabled the store behaves like a backend without
    /// server-side random sampling and strategies sample in the engine.
    #[must_use]
    pub fn with_sql_pushdown(mut self, enabled: bool) -> Self {
        self.sql_pushdown = enabled;
        self
    }

    /// Write committed trigger partitions to Parquet files instead of memory.
    #[must_use]
    pub fn with_trigger_sample_storage(mut self, storage: TriggerSampleStorage) -> Self {
        self.spill = Some(storage);
        self
    }

    /// Number of pipelines with a table in this store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Check if no pipeline has been allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    fn table(&self, pipeline_id: PipelineId) -> Result<Arc<RwLock<PipelineTable>>> {
        self.tables
            .get(&pipeline_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::UnknownPipeline(pipeline_id))
    }

    fn query_schema() -> SchemaRef {
        let mut fields: Vec<Field> = sample_schema()
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();
        fields.push(Field::new("used", DataType::Boolean, false));
        Arc::new(Schema::new(fields))
    }

    fn records_from_batch(batch: &RecordBatch) -> Result<Vec<SampleRecord>> {
        let schema = batch.schema();
        let column = |name: &str| {
            schema
                .index_of(name)
                .map(|i| batch.column(i).clone())
                .map_err(|_| Error::ParseError(format!("Sampling statement must select {name}")))
        };
        let seqs = column("seq")?;
        let keys = column("sample_key")?;
        let timestamps = column("timestamp")?;
        let labels = column("label")?;

        let seqs = seqs.as_primitive::<UInt64Type>();
        let keys = keys.as_primitive::<Int64Type>();
        let timestamps = timestamps.as_primitive::<Int64Type>();
        let labels = labels.as_primitive::<Int64Type>();

        Ok((0..batch.num_rows())
            .map(|row| SampleRecord {
                seq: seqs.value(row),
                key: keys.value(row),
                timestamp: timestamps.value(row),
                label: labels.value(row),
            })
            .collect())
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            sql_pushdown: self.sql_pushdown,
        }
    }

    async fn allocate_pipeline_id(&self) -> Result<PipelineId> {
        let pipeline_id = self.next_pipeline_id.fetch_add(1, Ordering::SeqCst);
        self.tables
            .insert(pipeline_id, Arc::new(RwLock::new(PipelineTable::default())));
        Ok(pipeline_id)
    }

    async fn insert_many(
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
        if keys.is_empty() {
            return Ok(());
        }

        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;

        let first_seq = table.reserve(pipeline_id, &keys)?;
        let rows = keys.len();
        let inserted = sample_batch(pipeline_id, first_seq, keys, timestamps, labels)
            .and_then(|batch| table.fill(first_seq, batch))
            .and_then(|()| table.publish(first_seq));
        if inserted.is_err() {
            table.release(first_seq);
        }

        debug!(pipeline_id, first_seq, rows, "appended sample batch");
        inserted
    }

    async fn reserve_samples(&self, pipeline_id: PipelineId, keys: &[i64]) -> Result<u64> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;
        let first_seq = table.reserve(pipeline_id, keys)?;
        debug!(pipeline_id, first_seq, rows = keys.len(), "reserved sample block");
        Ok(first_seq)
    }

    async fn insert_reserved(
        &self,
        pipeline_id: PipelineId,
        first_seq: u64,
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

        let table = self.table(pipeline_id)?;
        // Build outside the lock so slices of one inform proceed in parallel
        let batch = sample_batch(pipeline_id, first_seq, keys, timestamps, labels)?;
        let mut table = table.write().await;
        table.fill(first_seq, batch)
    }

    async fn publish_reserved(&self, pipeline_id: PipelineId, first_seq: u64) -> Result<()> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;
        table.publish(first_seq)
    }

    async fn release_reserved(&self, pipeline_id: PipelineId, first_seq: u64) -> Result<()> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;
        table.release(first_seq);
        debug!(pipeline_id, first_seq, "released sample block");
        Ok(())
    }

    async fn snapshot(&self, pipeline_id: PipelineId) -> Result<u64> {
        let table = self.table(pipeline_id)?;
        let table = table.read().await;
        Ok(table.visible_seq)
    }

    async fn count(&self, pipeline_id: PipelineId, filter: EligibleFilter) -> Result<usize> {
        let table = self.table(pipeline_id)?;
        let table = table.read().await;

        if !filter.only_unused {
            let rows: u64 = table
                .batches
                .iter()
                .zip(&table.batch_offsets)
                .take_while(|(_, offset)| **offset < filter.high_watermark)
                .map(|(batch, &offset)| (batch.num_rows() as u64).min(filter.high_watermark - offset))
                .sum();
            return usize::try_from(rows)
                .map_err(|_| Error::StorageError(format!("Row count {rows} exceeds usize")));
        }

        let mut count = 0;
        table.for_each_matching(filter, 0, |_| {
            count += 1;
            true
        });
        Ok(count)
    }

    async fn scan(
        &self,
        pipeline_id: PipelineId,
        filter: EligibleFilter,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<SampleRecord>> {
        let table = self.table(pipeline_id)?;
        let table = table.read().await;

        let mut records = Vec::with_capacity(limit.min(4096));
        if limit > 0 {
            table.for_each_matching(filter, from_seq, |record| {
                records.push(record);
                records.len() < limit
            });
        }
        Ok(records)
    }

    async fn execute_sample_query(&self, sql: &str) -> Result<Vec<SampleRecord>> {
        if !self.sql_pushdown {
            return Err(Error::Unsupported(
                "sampling statements are disabled on this store".to_string(),
            ));
        }

        let plan = QueryEngine::new().parse(sql)?;
        if plan.table != SAMPLE_TABLE {
            return Err(Error::ParseError(format!("Unknown table: {}", plan.table)));
        }

        let pipeline_id = plan
            .predicates
            .iter()
            .find_map(|p| match (p.column.as_str(), p.op, p.value) {
                ("pipeline_id", CompareOp::Eq, Literal::Int(id)) => PipelineId::try_from(id).ok(),
                _ => None,
            })
            .ok_or_else(|| {
                Error::ParseError("Sampling statement must filter on pipeline_id".to_string())
            })?;

        let table = self.table(pipeline_id)?;
        let table = table.read().await;

        let schema = Self::query_schema();
        let batches = table.batches_with_used(&schema)?;
        let result = QueryExecutor::new().execute(&plan, &schema, &batches)?;

        debug!(pipeline_id, rows = result.num_rows(), "executed sampling statement");
        Self::records_from_batch(&result)
    }

    async fn allocate_trigger_id(&self, pipeline_id: PipelineId) -> Result<TriggerId> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;

        let trigger_id = table.next_trigger_id;
        table.next_trigger_id += 1;
        table.staged.insert(trigger_id, Vec::new());
        Ok(trigger_id)
    }

    async fn stage_partition(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        keys: Vec<i64>,
        weights: Vec<f32>,
    ) -> Result<usize> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;

        let staged = table.staged.get_mut(&trigger_id).ok_or(Error::UnknownTrigger {
            pipeline_id,
            trigger_id,
        })?;
        let partition_id = staged.len();
        let batch = partition_batch(keys, weights)?;

        let stored = match &self.spill {
            Some(storage) => StoredPartition::Spilled {
                rows: batch.num_rows(),
                path: storage.write(pipeline_id, trigger_id, partition_id, &batch)?,
            },
            None => StoredPartition::Memory(batch),
        };
        staged.push(stored);
        Ok(partition_id)
    }

    async fn commit_trigger(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        mark_used: Option<EligibleFilter>,
    ) -> Result<TriggerInfo> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;

        let partitions = table.staged.remove(&trigger_id).ok_or(Error::UnknownTrigger {
            pipeline_id,
            trigger_id,
        })?;

        if let Some(filter) = mark_used {
            let mut consumed = Vec::new();
            table.for_each_matching(filter, 0, |record| {
                consumed.push(record);
                true
            });
            for record in &consumed {
                if let Ok(seq) = usize::try_from(record.seq) {
                    table.used[seq] = true;
                }
                table.live_keys.remove(&record.key);
            }
            debug!(pipeline_id, trigger_id, consumed = consumed.len(), "marked samples used");
        }

        let partition_sizes: Vec<usize> = partitions.iter().map(StoredPartition::num_rows).collect();
        let info = TriggerInfo {
            trigger_id,
            num_keys: partition_sizes.iter().sum(),
            partition_sizes,
            created_at: Utc::now(),
        };
        table.triggers.insert(
            trigger_id,
            CommittedTrigger {
                info: info.clone(),
                partitions,
            },
        );
        Ok(info)
    }

    async fn abort_trigger(&self, pipeline_id: PipelineId, trigger_id: TriggerId) -> Result<()> {
        let table = self.table(pipeline_id)?;
        let mut table = table.write().await;

        if let Some(partitions) = table.staged.remove(&trigger_id) {
            for partition in partitions {
                partition.discard();
            }
        }
        Ok(())
    }

    async fn trigger_info(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
    ) -> Result<TriggerInfo> {
        let table = self.table(pipeline_id)?;
        let table = table.read().await;

        table
            .triggers
            .get(&trigger_id)
            .map(|trigger| trigger.info.clone())
            .ok_or(Error::UnknownTrigger {
                pipeline_id,
                trigger_id,
            })
    }

    async fn partition(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        partition_id: usize,
    ) -> Result<RecordBatch> {
        let table = self.table(pipeline_id)?;
        let table = table.read().await;

        let trigger = table.triggers.get(&trigger_id).ok_or(Error::UnknownTrigger {
            pipeline_id,
            trigger_id,
        })?;
        let partition = trigger
            .partitions
            .get(partition_id)
            .ok_or(Error::OutOfRange {
                field: "partition_id",
                value: partition_id,
                bound: trigger.partitions.len(),
            })?;

        match partition {
            StoredPartition::Memory(batch) => Ok(batch.clone()),
            StoredPartition::Spilled { path, .. } => TriggerSampleStorage::read(path),
        }
    }

    async fn labels(&self, pipeline_id: PipelineId) -> Result<Vec<i64>> {
        let table = self.table(pipeline_id)?;
        let table = table.read().await;
        Ok(table.labels.iter().copied().collect())
    }
}
