//! CSV to parquet conversion for staged data files.
//!
//! Conversion is chunked at 100 000 rows so memory stays bounded regardless
//! of file size. Values that fail to parse under the target type become
//! NULL rather than failing the window; the vendor feed is text-first and
//! per-cell coercion matches the warehouse COPY behavior downstream.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
    TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::properties::WriterProperties;

use crate::error::{Error, Result};
use crate::schema::{ColumnSpec, LogicalType};

/// Rows per record batch written to parquet.
pub const CHUNK_ROWS: usize = 100_000;

/// Builds the arrow schema for a set of columns.
#[must_use]
pub fn arrow_schema(columns: &[ColumnSpec]) -> Arc<Schema> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| {
            let data_type = match c.logical_type {
                LogicalType::Utf8(_) => DataType::Utf8,
                LogicalType::Int64 => DataType::Int64,
                LogicalType::Float64 => DataType::Float64,
                LogicalType::Bool => DataType::Boolean,
                LogicalType::Date => DataType::Date32,
                LogicalType::Timestamp => {
                    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
                }
            };
            Field::new(&c.name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

enum ColumnBuilder {
    Str(StringBuilder),
    Int(Int64Builder),
    Float(Float64Builder),
    Bool(BooleanBuilder),
    Date(Date32Builder),
    Ts(TimestampMicrosecondBuilder),
}

impl ColumnBuilder {
    fn for_type(logical_type: LogicalType) -> Self {
        match logical_type {
            LogicalType::Utf8(_) => Self::Str(StringBuilder::new()),
            LogicalType::Int64 => Self::Int(Int64Builder::new()),
            LogicalType::Float64 => Self::Float(Float64Builder::new()),
            LogicalType::Bool => Self::Bool(BooleanBuilder::new()),
            LogicalType::Date => Self::Date(Date32Builder::new()),
            LogicalType::Timestamp => {
                Self::Ts(TimestampMicrosecondBuilder::new().with_timezone("UTC"))
            }
        }
    }

    fn append(&mut self, value: Option<&str>) {
        let value = value.filter(|v| !v.is_empty());
        match self {
            Self::Str(b) => b.append_option(value),
            Self::Int(b) => b.append_option(value.and_then(|v| v.parse::<i64>().ok())),
            Self::Float(b) => b.append_option(value.and_then(|v| v.parse::<f64>().ok())),
            Self::Bool(b) => b.append_option(value.and_then(parse_bool)),
            Self::Date(b) => b.append_option(value.and_then(parse_date_days)),
            Self::Ts(b) => b.append_option(value.and_then(parse_timestamp_micros)),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Str(b) => Arc::new(b.finish()),
            Self::Int(b) => Arc::new(b.finish()),
            Self::Float(b) => Arc::new(b.finish()),
            Self::Bool(b) => Arc::new(b.finish()),
            Self::Date(b) => Arc::new(b.finish()),
            Self::Ts(b) => Arc::new(b.finish()),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_date_days(value: &str) -> Option<i32> {
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from((date - epoch).num_days()).ok()
}

fn parse_timestamp_micros(value: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc).timestamp_micros());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_micros());
        }
    }
    None
}

/// Converts CSV bytes to parquet under the given column specs.
///
/// Columns absent from `columns` default to unbounded text; the header row
/// drives column order.
///
/// # Errors
///
/// Returns `Error::Columnar` if the CSV is unreadable or the parquet
/// writer fails.
pub fn csv_to_parquet(csv_data: &[u8], columns: &[ColumnSpec]) -> Result<Bytes> {
    let mut reader = csv::ReaderBuilder::new().from_reader(csv_data);
    let headers = reader
        .headers()
        .map_err(|e| Error::columnar(format!("read headers: {e}")))?
        .clone();

    let resolved: Vec<ColumnSpec> = headers
        .iter()
        .map(|header| {
            columns
                .iter()
                .find(|c| c.name == header)
                .cloned()
                .unwrap_or_else(|| ColumnSpec::new(header, LogicalType::Utf8(None)))
        })
        .collect();

    let schema = arrow_schema(&resolved);
    let props = WriterProperties::builder().build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, Arc::clone(&schema), Some(props))
        .map_err(|e| Error::columnar(format!("parquet writer init: {e}")))?;

    let mut builders: Vec<ColumnBuilder> = resolved
        .iter()
        .map(|c| ColumnBuilder::for_type(c.logical_type))
        .collect();
    let mut rows_in_chunk = 0usize;

    for record in reader.records() {
        let record = record.map_err(|e| Error::columnar(format!("read record: {e}")))?;
        for (index, builder) in builders.iter_mut().enumerate() {
            builder.append(record.get(index));
        }
        rows_in_chunk += 1;

        if rows_in_chunk == CHUNK_ROWS {
            flush_chunk(&mut writer, &schema, &mut builders)?;
            rows_in_chunk = 0;
        }
    }

    if rows_in_chunk > 0 {
        flush_chunk(&mut writer, &schema, &mut builders)?;
    }

    writer
        .close()
        .map_err(|e| Error::columnar(format!("parquet close: {e}")))?;
    Ok(Bytes::from(buffer))
}

fn flush_chunk(
    writer: &mut ArrowWriter<&mut Vec<u8>>,
    schema: &Arc<Schema>,
    builders: &mut [ColumnBuilder],
) -> Result<()> {
    let arrays: Vec<ArrayRef> = builders.iter_mut().map(ColumnBuilder::finish).collect();
    let batch = RecordBatch::try_new(Arc::clone(schema), arrays)
        .map_err(|e| Error::columnar(format!("build record batch: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| Error::columnar(format!("parquet write: {e}")))
}

/// Reads a parquet file back as header names plus stringified rows.
///
/// Used by in-memory warehouse loads; NULL cells come back as `None`.
///
/// # Errors
///
/// Returns `Error::Columnar` if the parquet file is unreadable.
pub fn parquet_rows(data: Bytes) -> Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|e| Error::columnar(format!("parquet reader init: {e}")))?;
    let headers: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder
        .build()
        .map_err(|e| Error::columnar(format!("parquet reader build: {e}")))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::columnar(format!("parquet read: {e}")))?;
        for row in 0..batch.num_rows() {
            let mut values = Vec::with_capacity(batch.num_columns());
            for column in batch.columns() {
                if column.is_null(row) {
                    values.push(None);
                } else {
                    let rendered = array_value_to_string(column, row)
                        .map_err(|e| Error::columnar(format!("render cell: {e}")))?;
                    values.push(Some(rendered));
                }
            }
            rows.push(values);
        }
    }
    Ok((headers, rows))
}

/// Returns the names of `Float64` columns in a parquet file.
///
/// Used to carry per-window decimal promotion through to apply: the staged
/// parquet schema is authoritative for numeric columns.
///
/// # Errors
///
/// Returns `Error::Columnar` if the parquet footer is unreadable.
pub fn parquet_float_columns(data: Bytes) -> Result<Vec<String>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(|e| Error::columnar(format!("parquet reader init: {e}")))?;
    Ok(builder
        .schema()
        .fields()
        .iter()
        .filter(|f| matches!(f.data_type(), DataType::Float64))
        .map(|f| f.name().clone())
        .collect())
}
