//! Partitioned, atomic output of the feature table.
//!
//! Every grid key owns one partition
//! (`ELR_MIL={segment}/year={Y}/month={M}/day={D}/hour={H}/part-0.parquet`).
//! A partition is encoded in memory and handed to a [`PartitionSink`] that
//! must make the whole file visible at once or not at all. Re-running a range
//! rewrites exactly the same paths.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, Timelike};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::features::{
    FeatureDType, FeatureRow, FeatureSchema, FeatureTable, FeatureValue, SchemaError,
};
use crate::registry::SegmentCode;
use crate::timebase::SegmentHourKey;

pub const PARTITION_FILE_NAME: &str = "part-0.parquet";
pub const SCHEMA_FILE_NAME: &str = "_schema.json";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub segment: SegmentCode,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl PartitionKey {
    pub fn from_key(key: &SegmentHourKey) -> Self {
        Self {
            segment: key.segment.clone(),
            year: key.hour.year(),
            month: key.hour.month(),
            day: key.hour.day(),
            hour: key.hour.hour(),
        }
    }

    pub fn directory(&self) -> PathBuf {
        PathBuf::from(format!("ELR_MIL={}", self.segment))
            .join(format!("year={}", self.year))
            .join(format!("month={}", self.month))
            .join(format!("day={}", self.day))
            .join(format!("hour={}", self.hour))
    }

    pub fn relative_path(&self) -> PathBuf {
        self.directory().join(PARTITION_FILE_NAME)
    }
}

#[derive(Debug, Error)]
pub enum PartitionWriteError {
    #[error("failed to encode partition {path}: {message}")]
    Encode { path: PathBuf, message: String },
    #[error("failed to commit partition {path} after {attempts} attempt(s): {source}")]
    Storage {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl PartitionWriteError {
    pub fn path(&self) -> &Path {
        match self {
            Self::Encode { path, .. } | Self::Storage { path, .. } => path,
        }
    }
}

// Durable destination for encoded partitions. `commit` must be atomic: on
// error the previous content at `relative_path` (if any) stays intact.
pub trait PartitionSink: Send + Sync {
    fn commit(&self, relative_path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, relative_path: &Path) -> io::Result<Option<Vec<u8>>>;
}

#[derive(Debug, Clone)]
pub struct FsPartitionSink {
    root: PathBuf,
}

impl FsPartitionSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PartitionSink for FsPartitionSink {
    fn commit(&self, relative_path: &Path, bytes: &[u8]) -> io::Result<()> {
        write_atomic(&self.root.join(relative_path), bytes)
    }

    fn read(&self, relative_path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(relative_path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let committed = write_synced(&tmp_path, bytes).and_then(|()| fs::rename(&tmp_path, path));
    if committed.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    committed
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[derive(Debug, Default)]
pub struct PartitionWriteOutcome {
    pub committed: Vec<PathBuf>,
    pub failed: Vec<PartitionWriteError>,
}

impl PartitionWriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub fn arrow_schema(schema: &FeatureSchema) -> Schema {
    Schema::new(
        schema
            .columns
            .iter()
            .map(|column| Field::new(&column.name, arrow_type(column.dtype), column.nullable))
            .collect::<Vec<_>>(),
    )
}

fn arrow_type(dtype: FeatureDType) -> DataType {
    match dtype {
        FeatureDType::Utf8 => DataType::Utf8,
        FeatureDType::Int32 => DataType::Int32,
        FeatureDType::Int64 => DataType::Int64,
        FeatureDType::Float64 => DataType::Float64,
        FeatureDType::Boolean => DataType::Boolean,
        FeatureDType::TimestampMs => DataType::Timestamp(TimeUnit::Millisecond, None),
    }
}

pub fn encode_partition(schema: &FeatureSchema, rows: &[&FeatureRow]) -> Result<Vec<u8>, String> {
    let arrow_schema = Arc::new(arrow_schema(schema));
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.columns.len());

    for (idx, column) in schema.columns.iter().enumerate() {
        let values = rows
            .iter()
            .map(|row| {
                row.values.get(idx).ok_or_else(|| {
                    format!("row {} has no value for column {}", row.key, column.name)
                })
            })
            .collect::<Result<Vec<&FeatureValue>, String>>()?;
        let mismatch = |value: &FeatureValue| {
            format!(
                "column {} expects {:?}, got {:?}",
                column.name,
                column.dtype,
                value.dtype()
            )
        };

        let array: ArrayRef = match column.dtype {
            FeatureDType::Utf8 => Arc::new(StringArray::from(
                values
                    .iter()
                    .map(|v| match v {
                        FeatureValue::Utf8(s) => Ok(s.as_deref()),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<Option<&str>>, String>>()?,
            )),
            FeatureDType::Int32 => Arc::new(Int32Array::from(
                values
                    .iter()
                    .map(|v| match v {
                        FeatureValue::Int32(n) => Ok(*n),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<Option<i32>>, String>>()?,
            )),
            FeatureDType::Int64 => Arc::new(Int64Array::from(
                values
                    .iter()
                    .map(|v| match v {
                        FeatureValue::Int64(n) => Ok(*n),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<i64>, String>>()?,
            )),
            FeatureDType::Float64 => Arc::new(Float64Array::from(
                values
                    .iter()
                    .map(|v| match v {
                        FeatureValue::Float64(x) => Ok(*x),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<Option<f64>>, String>>()?,
            )),
            FeatureDType::Boolean => Arc::new(BooleanArray::from(
                values
                    .iter()
                    .map(|v| match v {
                        FeatureValue::Boolean(b) => Ok(*b),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<bool>, String>>()?,
            )),
            FeatureDType::TimestampMs => Arc::new(TimestampMillisecondArray::from(
                values
                    .iter()
                    .map(|v| match v {
                        FeatureValue::TimestampMs(ms) => Ok(*ms),
                        other => Err(mismatch(other)),
                    })
                    .collect::<Result<Vec<i64>, String>>()?,
            )),
        };
        columns.push(array);
    }

    let batch =
        RecordBatch::try_new(arrow_schema.clone(), columns).map_err(|err| err.to_string())?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema, Some(props))
        .map_err(|err| err.to_string())?;
    writer.write(&batch).map_err(|err| err.to_string())?;
    writer.close().map_err(|err| err.to_string())?;
    Ok(buffer)
}

pub fn write_partitions(
    table: &FeatureTable,
    sink: &dyn PartitionSink,
    cfg: &OutputConfig,
) -> PartitionWriteOutcome {
    info!(
        component = "partition",
        event = "partition.write.start",
        partitions = table.rows.len(),
        max_write_retries = cfg.max_write_retries
    );

    let results: Vec<Result<PathBuf, PartitionWriteError>> = table
        .rows
        .par_iter()
        .map(|row| {
            let path = PartitionKey::from_key(&row.key).relative_path();
            let bytes = encode_partition(&table.schema, &[row]).map_err(|message| {
                PartitionWriteError::Encode {
                    path: path.clone(),
                    message,
                }
            })?;
            commit_with_retry(sink, &path, &bytes, cfg)?;
            Ok(path)
        })
        .collect();

    let mut outcome = PartitionWriteOutcome::default();
    for result in results {
        match result {
            Ok(path) => outcome.committed.push(path),
            Err(err) => {
                warn!(
                    component = "partition",
                    event = "partition.write.failed",
                    path = %err.path().display(),
                    error = %err
                );
                outcome.failed.push(err);
            }
        }
    }

    info!(
        component = "partition",
        event = "partition.write.complete",
        committed = outcome.committed.len(),
        failed = outcome.failed.len()
    );

    outcome
}

pub fn write_schema_file(
    schema: &FeatureSchema,
    sink: &dyn PartitionSink,
    cfg: &OutputConfig,
) -> Result<PathBuf, PartitionWriteError> {
    let path = PathBuf::from(SCHEMA_FILE_NAME);
    let bytes = serde_json::to_vec_pretty(schema).map_err(|err| PartitionWriteError::Encode {
        path: path.clone(),
        message: err.to_string(),
    })?;
    commit_with_retry(sink, &path, &bytes, cfg)?;
    Ok(path)
}

pub fn read_schema_file(sink: &dyn PartitionSink) -> Result<Option<FeatureSchema>, SchemaError> {
    let path = PathBuf::from(SCHEMA_FILE_NAME);
    let unreadable = |message: String| SchemaError::Unreadable {
        path: path.clone(),
        message,
    };
    let Some(bytes) = sink.read(&path).map_err(|err| unreadable(err.to_string()))? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| unreadable(err.to_string()))
}

fn commit_with_retry(
    sink: &dyn PartitionSink,
    path: &Path,
    bytes: &[u8],
    cfg: &OutputConfig,
) -> Result<(), PartitionWriteError> {
    let mut attempt: u32 = 0;
    loop {
        match sink.commit(path, bytes) {
            Ok(()) => {
                debug!(
                    component = "partition",
                    event = "partition.commit",
                    path = %path.display(),
                    attempts = attempt + 1
                );
                return Ok(());
            }
            Err(source) if attempt >= cfg.max_write_retries => {
                return Err(PartitionWriteError::Storage {
                    path: path.to_path_buf(),
                    attempts: attempt + 1,
                    source,
                });
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                warn!(
                    component = "partition",
                    event = "partition.commit.retry",
                    path = %path.display(),
                    attempt = attempt,
                    error = %err
                );
                std::thread::sleep(backoff_duration(cfg.retry_backoff_ms, attempt));
            }
        }
    }
}

fn backoff_duration(base_ms: u64, attempt: u32) -> std::time::Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << shift;
    std::time::Duration::from_millis(base_ms.saturating_mul(factor))
}
