//! On-disk Parquet spill for trigger partitions
//!
//! One file per (pipeline, trigger, partition). Files are written while the
//! trigger is staged and removed again if it aborts, so a committed trigger
//! always finds all of its partitions on disk.

use super::{partition_schema, PipelineId, TriggerId};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Directory-backed storage for finalized trigger partitions
#[derive(Debug, Clone)]
pub struct TriggerSampleStorage {
    directory: PathBuf,
}

impl TriggerSampleStorage {
    /// Use `directory` for partition files, creating it if needed.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory).map_err(|e| {
            Error::StorageError(format!(
                "Failed to create trigger sample directory {}: {e}",
                directory.display()
            ))
        })?;
        Ok(Self { directory })
    }

    /// Root directory of the partition files
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, pipeline_id: PipelineId, trigger_id: TriggerId, partition_id: usize) -> PathBuf {
        self.directory
            .join(format!("{pipeline_id}_{trigger_id}_{partition_id}.parquet"))
    }

    /// Write one partition, returning the file it landed in.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written
    pub fn write(
        &self,
        pipeline_id: PipelineId,
        trigger_id: TriggerId,
        partition_id: usize,
        batch: &RecordBatch,
    ) -> Result<PathBuf> {
        let path = self.path(pipeline_id, trigger_id, partition_id);
        let file = File::create(&path).map_err(|e| {
            Error::StorageError(format!("Failed to create {}: {e}", path.display()))
        })?;

        let mut writer = ArrowWriter::try_new(file, partition_schema(), None)?;
        writer.write(batch)?;
        writer.close()?;
        Ok(path)
    }

    /// Read a partition file back into a single batch.
    ///
    /// # Errors
    /// Returns error if the file cannot be opened or parsed
    pub fn read(path: &Path) -> Result<RecordBatch> {
        let file = File::open(path).map_err(|e| {
            Error::StorageError(format!("Failed to open {}: {e}", path.display()))
        })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }

        match batches.len() {
            0 => Ok(RecordBatch::new_empty(partition_schema())),
            1 => Ok(batches.remove(0)),
            _ => Ok(arrow::compute::concat_batches(&partition_schema(), &batches)?),
        }
    }

    /// Remove a partition file; missing files are ignored.
    pub fn remove(path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove trigger sample file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::partition_batch;
    use arrow::array::AsArray;
    use arrow::datatypes::{Float32Type, Int64Type};

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("trueno_select_{name}_{}", std::process::id()))
    }

    #[test]
    fn test_write_and_read_partition() {
        let storage = TriggerSampleStorage::new(temp_dir("spill_rw")).unwrap();
        let batch = partition_batch(vec![4, 5, 6], vec![1.0, 2.0, 2.0]).unwrap();

        let path = storage.write(1, 2, 0, &batch).unwrap();
        assert!(path.ends_with("1_2_0.parquet"));

        let loaded = TriggerSampleStorage::read(&path).unwrap();
        assert_eq!(loaded.column(0).as_primitive::<Int64Type>().values().to_vec(), vec![4, 5, 6]);
        assert_eq!(
            loaded.column(1).as_primitive::<Float32Type>().values().to_vec(),
            vec![1.0, 2.0, 2.0]
        );

        TriggerSampleStorage::remove(&path);
        assert!(!path.exists());
        std::fs::remove_dir_all(storage.directory()).unwrap();
    }

    #[test]
    fn test_read_missing_file_fails() {
        let result = TriggerSampleStorage::read(Path::new("/nonexistent/trueno_select.parquet"));
        assert!(result.unwrap_err().to_string().contains("Failed to open"));
    }
}
