//! Table store (Arrow/Parquet)
//!
//! Append-only collection of record batches sharing one schema. Tables produced
//! by a run (population, assignments, report) land here and can be persisted
//! to and reloaded from Parquet.

use std::fs::File;
use std::path::Path;

use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::{Error, Result};

/// In-memory table of record batches with a fixed schema
#[derive(Debug, Clone, Default)]
pub struct TableStore {
    batches: Vec<RecordBatch>,
}

impl TableStore {
    /// Create a store from existing batches
    ///
    /// # Errors
    ///
    /// Returns error if the batches do not share one schema
    pub fn new(batches: Vec<RecordBatch>) -> Result<Self> {
        let mut store = Self::default();
        for batch in batches {
            store.append_batch(batch)?;
        }
        Ok(store)
    }

    /// Load a table from a Parquet file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or decoded
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        tracing::debug!(
            path = %path.as_ref().display(),
            batches = batches.len(),
            "parquet table loaded"
        );
        Ok(Self { batches })
    }

    /// Write every batch to a single Parquet file
    ///
    /// # Errors
    ///
    /// Returns error if the store is empty or the file cannot be written
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let Some(first) = self.batches.first() else {
            return Err(Error::invalid("cannot write an empty table to Parquet"));
        };
        let file = File::create(path.as_ref())?;
        let mut writer = ArrowWriter::try_new(file, first.schema(), None)?;
        for batch in &self.batches {
            writer.write(batch)?;
        }
        writer.close()?;
        tracing::debug!(
            path = %path.as_ref().display(),
            rows = self.num_rows(),
            "parquet table written"
        );
        Ok(())
    }

    /// All record batches
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total rows across batches
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Append a batch; the store is append-only
    ///
    /// # Errors
    ///
    /// Returns error if the batch schema differs from the stored one
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if let Some(first) = self.batches.first() {
            let existing_schema = first.schema();
            if batch.schema() != existing_schema {
                return Err(Error::Arrow(ArrowError::SchemaError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    existing_schema,
                    batch.schema()
                ))));
            }
        }

        self.batches.push(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, Int32Array, UInt64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[allow(clippy::cast_precision_loss)]
    fn create_test_batch(num_rows: usize) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("value", DataType::Float64, false),
        ]);

        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(UInt64Array::from_iter_values(0..num_rows as u64)),
                Arc::new(Float64Array::from_iter_values(
                    (0..num_rows).map(|i| i as f64 * 0.5),
                )),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_append_batch() {
        let mut store = TableStore::default();
        store.append_batch(create_test_batch(100)).unwrap();
        store.append_batch(create_test_batch(200)).unwrap();

        assert_eq!(store.batches().len(), 2);
        assert_eq!(store.num_rows(), 300);
    }

    #[test]
    fn test_append_batch_schema_validation() {
        let mut store = TableStore::new(vec![create_test_batch(10)]).unwrap();

        let incompatible = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new(
                "different_field",
                DataType::Int32,
                false,
            )])),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();

        let result = store.append_batch(incompatible);
        assert!(result.unwrap_err().to_string().contains("Schema mismatch"));
        assert_eq!(store.num_rows(), 10);
    }

    #[test]
    fn test_parquet_roundtrip_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.parquet");

        let store = TableStore::new(vec![create_test_batch(50), create_test_batch(25)]).unwrap();
        store.write_parquet(&path).unwrap();

        let loaded = TableStore::load_parquet(&path).unwrap();
        assert_eq!(loaded.num_rows(), 75);
        assert_eq!(
            loaded.batches()[0].schema().fields(),
            store.batches()[0].schema().fields()
        );
    }

    #[test]
    fn test_write_empty_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = TableStore::default().write_parquet(dir.path().join("empty.parquet"));
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = TableStore::load_parquet("/nonexistent/table.parquet");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
