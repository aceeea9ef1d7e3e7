//! Parquet artifacts
//!
//! An [`ArtifactWriter`] turns the normalized batches of one table into one or
//! more Parquet files under the work directory. A part is closed as soon as
//! its encoded size reaches `max_artifact_bytes`, so the threshold is checked
//! at batch granularity. Parts are written to a `.tmp` name and renamed when
//! complete; a finished [`Artifact`] is never modified again.

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, BooleanArray, Date32Array, Decimal128Array, Float64Array,
    Int32Array, Int64Array, StringArray, Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{
    DataType, Date32Type, Decimal128Type, Field, Float64Type, Int32Type, Int64Type, Schema, SchemaRef,
    Time64MicrosecondType, TimeUnit, TimestampMicrosecondType,
};
use arrow::record_batch::RecordBatch as ArrowBatch;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DateTimePolicy;
use crate::dictionary::{DecimalSpec, TargetType};
use crate::error::{ExtractError, Result};
use crate::model::{Row, Value};
use crate::normalize::{NormalizedBatch, NormalizedColumn, NormalizedSchema};

pub const ARTIFACT_EXTENSION: &str = "parquet";

/// Metadata keys embedded in every artifact footer
pub const META_TENANT: &str = "pgl.tenant";
pub const META_TABLE: &str = "pgl.table";
pub const META_RUN: &str = "pgl.run";

/// `2025-03-01T02:00:00Z` -> `20250301T020000Z`
pub fn run_stamp(started: DateTime<Utc>) -> String {
    started.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Deterministic object keys for one table of one run
///
/// `[{prefix}/]{tenant}/{table}/{run}-{part:05}.parquet`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNaming {
    pub prefix: Option<String>,
    pub tenant: String,
    pub table: String,
    pub run: String,
}

impl ArtifactNaming {
    pub fn new(
        prefix: Option<&str>,
        tenant: impl Into<String>,
        table: impl Into<String>,
        started: DateTime<Utc>,
    ) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            prefix,
            tenant: tenant.into(),
            table: table.into(),
            run: run_stamp(started),
        }
    }

    pub fn file_name(&self, part: u32) -> String {
        format!("{}-{:05}.{}", self.run, part, ARTIFACT_EXTENSION)
    }

    pub fn key(&self, part: u32) -> String {
        let relative = format!("{}/{}/{}", self.tenant, self.table, self.file_name(part));
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, relative),
            None => relative,
        }
    }

    /// Local directory for this table's parts under `work_dir`
    pub fn local_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.tenant).join(&self.table)
    }
}

/// One finished Parquet file awaiting upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub tenant: String,
    pub table: String,
    pub part: u32,
    pub path: PathBuf,
    pub key: String,
    pub rows: u64,
    pub bytes: u64,
    pub sha256: String,
}

fn timestamp_timezone(policy: DateTimePolicy) -> Option<Arc<str>> {
    match policy {
        DateTimePolicy::Naive => None,
        DateTimePolicy::Utc => Some("UTC".into()),
    }
}

fn data_type(target: TargetType, datetime: DateTimePolicy) -> DataType {
    match target {
        TargetType::Bool => DataType::Boolean,
        TargetType::Int32 => DataType::Int32,
        TargetType::Int64 => DataType::Int64,
        TargetType::Float64 => DataType::Float64,
        TargetType::Decimal(spec) => {
            let spec = spec.unwrap_or(DecimalSpec::FALLBACK);
            DataType::Decimal128(spec.precision, spec.scale as i8)
        },
        TargetType::Utf8 => DataType::Utf8,
        TargetType::Binary => DataType::Binary,
        TargetType::Date => DataType::Date32,
        TargetType::Time => DataType::Time64(TimeUnit::Microsecond),
        TargetType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, timestamp_timezone(datetime)),
    }
}

/// Arrow schema derived from the normalized schema, nothing else
pub fn arrow_schema(schema: &NormalizedSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns
        .iter()
        .map(|c| Field::new(&c.name, data_type(c.target, schema.datetime), c.nullable))
        .collect();
    Arc::new(Schema::new(fields))
}

fn unix_epoch() -> NaiveDate {
    NaiveDate::default()
}

fn days_since_epoch(date: NaiveDate) -> Option<i32> {
    i32::try_from(date.signed_duration_since(unix_epoch()).num_days()).ok()
}

fn micros_since_midnight(time: NaiveTime) -> i64 {
    i64::from(time.num_seconds_from_midnight()) * 1_000_000 + i64::from(time.nanosecond() / 1_000)
}

fn micros_since_epoch(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

/// Collect column `index` of every row, converting non-null values with `f`
fn collect_column<'a, T>(
    rows: &'a [Row],
    index: usize,
    column: &NormalizedColumn,
    f: impl Fn(&'a Value) -> Option<T>,
) -> Result<Vec<Option<T>>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| match row.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => f(value).map(Some).ok_or_else(|| {
                ExtractError::Serialization(format!(
                    "column '{}' row {}: {} does not fit {}",
                    column.name,
                    i,
                    value.type_name(),
                    column.target
                ))
            }),
        })
        .collect()
}

fn build_array(rows: &[Row], index: usize, column: &NormalizedColumn, datetime: DateTimePolicy) -> Result<ArrayRef> {
    let array: ArrayRef = match column.target {
        TargetType::Bool => Arc::new(BooleanArray::from(collect_column(rows, index, column, |v| match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        })?)),
        TargetType::Int32 => Arc::new(Int32Array::from(collect_column(rows, index, column, |v| match v {
            Value::Int(i) => i32::try_from(*i).ok(),
            _ => None,
        })?)),
        TargetType::Int64 => Arc::new(Int64Array::from(collect_column(rows, index, column, |v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })?)),
        TargetType::Float64 => Arc::new(Float64Array::from(collect_column(rows, index, column, |v| match v {
            Value::Float(f) => Some(*f),
            _ => None,
        })?)),
        TargetType::Decimal(spec) => {
            let spec = spec.unwrap_or(DecimalSpec::FALLBACK);
            let values = collect_column(rows, index, column, |v| match v {
                Value::Decimal { value, scale } if *scale == spec.scale => Some(*value),
                _ => None,
            })?;
            Arc::new(Decimal128Array::from(values).with_precision_and_scale(spec.precision, spec.scale as i8)?)
        },
        TargetType::Utf8 => Arc::new(StringArray::from(collect_column(rows, index, column, |v| match v {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        })?)),
        TargetType::Binary => Arc::new(BinaryArray::from_opt_vec(collect_column(rows, index, column, |v| {
            match v {
                Value::Binary(b) => Some(b.as_slice()),
                _ => None,
            }
        })?)),
        TargetType::Date => Arc::new(Date32Array::from(collect_column(rows, index, column, |v| match v {
            Value::Date(d) => days_since_epoch(*d),
            _ => None,
        })?)),
        TargetType::Time => Arc::new(Time64MicrosecondArray::from(collect_column(rows, index, column, |v| {
            match v {
                Value::Time(t) => Some(micros_since_midnight(*t)),
                _ => None,
            }
        })?)),
        TargetType::Timestamp => {
            let values = collect_column(rows, index, column, |v| match v {
                Value::Timestamp(ts) => Some(micros_since_epoch(*ts)),
                _ => None,
            })?;
            Arc::new(TimestampMicrosecondArray::from(values).with_timezone_opt(timestamp_timezone(datetime)))
        },
    };
    Ok(array)
}

/// Build an Arrow batch from normalized rows
pub fn to_arrow_batch(schema: &NormalizedSchema, arrow_schema: &SchemaRef, rows: &[Row]) -> Result<ArrowBatch> {
    let columns = schema
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| build_array(rows, index, column, schema.datetime))
        .collect::<Result<Vec<_>>>()?;
    Ok(ArrowBatch::try_new(Arc::clone(arrow_schema), columns)?)
}

/// A part still being written; dropping it unclosed removes the temp file
struct OpenPart {
    part: u32,
    temp_path: PathBuf,
    path: PathBuf,
    writer: Option<ArrowWriter<File>>,
    rows: u64,
}

impl OpenPart {
    fn writer(&mut self) -> Result<&mut ArrowWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| ExtractError::Serialization(format!("part {} is already closed", self.part)))
    }
}

impl Drop for OpenPart {
    fn drop(&mut self) {
        // A closed part was renamed away, so only abandoned parts are found here
        drop(self.writer.take());
        match std::fs::remove_file(&self.temp_path) {
            Ok(()) => debug!("Removed unfinished part {}", self.temp_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!("Could not remove {}: {}", self.temp_path.display(), e),
        }
    }
}

/// Streams normalized batches of one table into size-bounded Parquet parts
pub struct ArtifactWriter {
    naming: ArtifactNaming,
    schema: Arc<NormalizedSchema>,
    arrow_schema: SchemaRef,
    dir: PathBuf,
    max_bytes: u64,
    current: Option<OpenPart>,
    next_part: u32,
    rows_written: u64,
}

impl ArtifactWriter {
    pub fn new(naming: ArtifactNaming, schema: Arc<NormalizedSchema>, work_dir: &Path, max_bytes: u64) -> Result<Self> {
        let dir = naming.local_dir(work_dir);
        std::fs::create_dir_all(&dir)?;
        let arrow_schema = arrow_schema(&schema);
        Ok(Self {
            naming,
            schema,
            arrow_schema,
            dir,
            max_bytes: max_bytes.max(1),
            current: None,
            next_part: 0,
            rows_written: 0,
        })
    }

    pub fn arrow_schema(&self) -> &SchemaRef {
        &self.arrow_schema
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn parts_started(&self) -> u32 {
        self.next_part
    }

    fn writer_properties(&self) -> WriterProperties {
        let metadata = [
            (META_TENANT, self.naming.tenant.as_str()),
            (META_TABLE, self.schema.table.as_str()),
            (META_RUN, self.naming.run.as_str()),
        ]
        .into_iter()
        .map(|(key, value)| KeyValue {
            key: key.to_string(),
            value: Some(value.to_string()),
        })
        .collect();

        WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_created_by(format!("pgl-extractor {}", env!("CARGO_PKG_VERSION")))
            .set_key_value_metadata(Some(metadata))
            .build()
    }

    fn open_part(&mut self) -> Result<OpenPart> {
        let part = self.next_part;
        let path = self.dir.join(self.naming.file_name(part));
        let temp_path = path.with_extension("parquet.tmp");
        let file = File::create(&temp_path)?;
        let writer = ArrowWriter::try_new(file, Arc::clone(&self.arrow_schema), Some(self.writer_properties()))?;
        self.next_part += 1;
        debug!("Opened part {} for {}", part, self.schema.table);
        Ok(OpenPart {
            part,
            temp_path,
            path,
            writer: Some(writer),
            rows: 0,
        })
    }

    fn close_part(&self, mut part: OpenPart) -> Result<Artifact> {
        if let Some(writer) = part.writer.take() {
            writer.close()?;
        }
        std::fs::rename(&part.temp_path, &part.path)?;

        let bytes = std::fs::metadata(&part.path)?.len();
        let sha256 = pgl_common::checksum::compute_file_checksum(&part.path)?;

        info!(
            "Wrote {} ({} rows, {} bytes)",
            part.path.display(),
            part.rows,
            bytes
        );

        Ok(Artifact {
            tenant: self.naming.tenant.clone(),
            table: self.naming.table.clone(),
            part: part.part,
            key: self.naming.key(part.part),
            path: part.path.clone(),
            rows: part.rows,
            bytes,
            sha256,
        })
    }

    /// Append a batch; returns the part it closed, if the size threshold was reached
    pub fn write(&mut self, batch: &NormalizedBatch) -> Result<Option<Artifact>> {
        if batch.is_empty() {
            return Ok(None);
        }

        let mut part = match self.current.take() {
            Some(part) => part,
            None => self.open_part()?,
        };

        let arrow_batch = to_arrow_batch(&self.schema, &self.arrow_schema, &batch.rows)?;
        let writer = part.writer()?;
        writer.write(&arrow_batch)?;
        let encoded = writer.bytes_written() as u64 + writer.in_progress_size() as u64;
        part.rows += batch.len() as u64;
        self.rows_written += batch.len() as u64;

        if encoded >= self.max_bytes {
            return self.close_part(part).map(Some);
        }

        self.current = Some(part);
        Ok(None)
    }

    /// Close the open part; an untouched writer still yields one empty part
    pub fn finish(mut self) -> Result<Option<Artifact>> {
        let part = match self.current.take() {
            Some(part) => part,
            None if self.next_part == 0 => self.open_part()?,
            None => return Ok(None),
        };
        self.close_part(part).map(Some)
    }
}

/// Contents of an artifact read back from disk
#[derive(Debug)]
pub struct ArtifactContents {
    pub schema: SchemaRef,
    pub batches: Vec<ArrowBatch>,
    pub metadata: HashMap<String, String>,
}

impl ArtifactContents {
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    /// Decode every row back into [`Value`]s
    pub fn rows(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.num_rows());
        for batch in &self.batches {
            let columns = batch
                .columns()
                .iter()
                .map(|c| decode_column(c.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            for i in 0..batch.num_rows() {
                rows.push(columns.iter().map(|c| c[i].clone()).collect());
            }
        }
        Ok(rows)
    }
}

pub fn read_artifact(path: impl AsRef<Path>) -> Result<ArtifactContents> {
    let file = File::open(path.as_ref())?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let metadata = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default();
    let schema = Arc::clone(builder.schema());
    let batches = builder
        .build()?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ArtifactContents {
        schema,
        batches,
        metadata,
    })
}

fn unsupported(data_type: &DataType) -> ExtractError {
    ExtractError::Serialization(format!("cannot decode column of type {}", data_type))
}

fn decode_column(array: &dyn Array) -> Result<Vec<Value>> {
    let data_type = array.data_type();
    let len = array.len();
    let mut out = Vec::with_capacity(len);

    macro_rules! decode {
        ($array:expr, $convert:expr) => {{
            let typed = $array.ok_or_else(|| unsupported(data_type))?;
            for i in 0..len {
                if typed.is_null(i) {
                    out.push(Value::Null);
                } else {
                    out.push($convert(typed.value(i)));
                }
            }
        }};
    }

    match data_type {
        DataType::Boolean => decode!(array.as_boolean_opt(), Value::Bool),
        DataType::Int32 => decode!(array.as_primitive_opt::<Int32Type>(), |v: i32| Value::Int(i64::from(v))),
        DataType::Int64 => decode!(array.as_primitive_opt::<Int64Type>(), Value::Int),
        DataType::Float64 => decode!(array.as_primitive_opt::<Float64Type>(), Value::Float),
        DataType::Decimal128(_, scale) => {
            let scale = u8::try_from(*scale).map_err(|_| unsupported(data_type))?;
            decode!(array.as_primitive_opt::<Decimal128Type>(), |v: i128| Value::Decimal {
                value: v,
                scale
            })
        },
        DataType::Utf8 => decode!(array.as_string_opt::<i32>(), |v: &str| Value::Text(v.to_string())),
        DataType::Binary => decode!(array.as_binary_opt::<i32>(), |v: &[u8]| Value::Binary(v.to_vec())),
        DataType::Date32 => decode!(array.as_primitive_opt::<Date32Type>(), |v: i32| {
            Value::Date(unix_epoch() + chrono::Duration::days(i64::from(v)))
        }),
        DataType::Time64(TimeUnit::Microsecond) => {
            decode!(array.as_primitive_opt::<Time64MicrosecondType>(), |v: i64| {
                let secs = u32::try_from(v / 1_000_000).unwrap_or(0);
                let nanos = u32::try_from((v % 1_000_000) * 1_000).unwrap_or(0);
                Value::Time(NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).unwrap_or_default())
            })
        },
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            decode!(array.as_primitive_opt::<TimestampMicrosecondType>(), |v: i64| {
                DateTime::from_timestamp_micros(v)
                    .map(|ts| Value::Timestamp(ts.naive_utc()))
                    .unwrap_or(Value::Null)
            })
        },
        other => return Err(unsupported(other)),
    }

    Ok(out)
}
