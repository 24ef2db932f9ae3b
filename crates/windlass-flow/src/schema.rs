//! Logical column types, vendor type mapping and per-window schema registry.
//!
//! The registry is derived from the window's metadata CSV and lives only for
//! that window's apply; nothing schema-related is persisted across windows.
//! Type changes outside the widening matrix are rejected before any DDL.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sampled rows per file when detecting decimal columns.
const DECIMAL_SAMPLE_ROWS: usize = 100_000;

/// Intermediate logical column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalType {
    /// Variable-length text; `None` means unbounded.
    Utf8(Option<u32>),
    /// 64-bit integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// Boolean.
    Bool,
    /// Calendar date.
    Date,
    /// UTC timestamp, microsecond precision.
    Timestamp,
}

impl LogicalType {
    /// The warehouse column type for this logical type.
    #[must_use]
    pub fn warehouse_type(&self) -> String {
        match self {
            Self::Utf8(Some(len)) => format!("VARCHAR({len})"),
            Self::Utf8(None) => "VARCHAR(MAX)".to_string(),
            Self::Int64 => "BIGINT".to_string(),
            Self::Float64 => "DOUBLE PRECISION".to_string(),
            Self::Bool => "BOOLEAN".to_string(),
            Self::Date => "DATE".to_string(),
            Self::Timestamp => "TIMESTAMPTZ".to_string(),
        }
    }

    /// Returns whether a live column of this type may become `target`.
    ///
    /// Allowed widenings: `int64 -> float64`, `utf8(N) -> utf8(M)` for
    /// `M > N` (unbounded counts as widest), `date -> timestamp`.
    #[must_use]
    pub fn can_widen_to(&self, target: &Self) -> bool {
        match (self, target) {
            (a, b) if a == b => true,
            (Self::Int64, Self::Float64) | (Self::Date, Self::Timestamp) => true,
            (Self::Utf8(from), Self::Utf8(to)) => match (from, to) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(from), Some(to)) => to > from,
            },
            _ => false,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8(Some(len)) => write!(f, "utf8({len})"),
            Self::Utf8(None) => f.write_str("utf8"),
            Self::Int64 => f.write_str("int64"),
            Self::Float64 => f.write_str("float64"),
            Self::Bool => f.write_str("bool"),
            Self::Date => f.write_str("date"),
            Self::Timestamp => f.write_str("timestamp"),
        }
    }
}

impl FromStr for LogicalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("utf8(") {
            let len = rest
                .strip_suffix(')')
                .and_then(|n| n.parse::<u32>().ok())
                .ok_or_else(|| Error::manifest(format!("bad type '{s}'")))?;
            return Ok(Self::Utf8(Some(len)));
        }
        match s {
            "utf8" => Ok(Self::Utf8(None)),
            "int64" => Ok(Self::Int64),
            "float64" => Ok(Self::Float64),
            "bool" => Ok(Self::Bool),
            "date" => Ok(Self::Date),
            "timestamp" => Ok(Self::Timestamp),
            other => Err(Error::manifest(format!("unknown logical type '{other}'"))),
        }
    }
}

/// Maps a vendor metadata type to a logical type.
///
/// `Number` defaults to `int64`; decimal promotion happens per window from
/// sampled values via [`promote_decimals`].
#[must_use]
pub fn vendor_type_to_logical(vendor_type: &str, length: Option<u32>) -> LogicalType {
    match vendor_type.to_ascii_lowercase().as_str() {
        "number" | "numeric" => LogicalType::Int64,
        "boolean" => LogicalType::Bool,
        "date" => LogicalType::Date,
        "datetime" | "timestamp with time zone" => LogicalType::Timestamp,
        "relationship" | "multirelationship" | "id" | "reference" => {
            LogicalType::Utf8(Some(length.unwrap_or(255)))
        }
        "string" | "picklist" | "multipicklist" | "text" => LogicalType::Utf8(length),
        "longtext" => LogicalType::Utf8(None),
        _ => LogicalType::Utf8(None),
    }
}

/// One column of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub logical_type: LogicalType,
    /// Whether NULLs are allowed.
    pub nullable: bool,
}

impl ColumnSpec {
    /// Creates a nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            nullable: true,
        }
    }
}

/// Primary key columns for an object.
///
/// Most objects key on `id`; the metadata and picklist system objects carry
/// composite keys.
#[must_use]
pub fn key_columns(object: &str) -> Vec<String> {
    if object == "metadata" {
        vec!["extract".into(), "column_name".into()]
    } else if object.starts_with("picklist") {
        vec![
            "object".into(),
            "object_field".into(),
            "picklist_value_name".into(),
        ]
    } else {
        vec!["id".into()]
    }
}

#[derive(Debug, Deserialize)]
struct MetadataRow {
    extract: String,
    column_name: String,
    #[serde(rename = "type")]
    vendor_type: String,
    #[serde(default)]
    length: Option<u32>,
}

/// Per-window map of `object -> ordered columns`.
///
/// Built from the window's metadata CSV; never persisted across windows.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    objects: BTreeMap<String, Vec<ColumnSpec>>,
}

impl SchemaRegistry {
    /// Parses a metadata CSV (`extract, column_name, type, length, ...`).
    ///
    /// The object name is the segment after the first `.` of `extract`
    /// (`Object.product__v` -> `product__v`). Extra columns are ignored.
    ///
    /// The registry also carries a `metadata` object whose columns are the
    /// file's own header row: full and log loads land the metadata rows in
    /// a warehouse table of that shape, keyed on `(extract, column_name)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ManifestInvalid` if the CSV is malformed.
    pub fn from_metadata_csv(data: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(data);
        let headers = reader
            .headers()
            .map_err(|e| Error::manifest(format!("metadata headers: {e}")))?
            .clone();

        let mut objects: BTreeMap<String, Vec<ColumnSpec>> = BTreeMap::new();
        for (index, record) in reader.deserialize::<MetadataRow>().enumerate() {
            let row = record
                .map_err(|e| Error::manifest(format!("metadata row {}: {e}", index + 1)))?;
            let object = object_name(&row.extract);
            let keys = key_columns(&object);
            let nullable = !keys.contains(&row.column_name);
            objects.entry(object).or_default().push(ColumnSpec {
                name: row.column_name,
                logical_type: vendor_type_to_logical(&row.vendor_type, row.length),
                nullable,
            });
        }

        // Explicit `Metadata.metadata` rows take precedence over the
        // header-derived shape.
        let metadata_keys = key_columns("metadata");
        objects.entry("metadata".to_string()).or_insert_with(|| {
            headers
                .iter()
                .map(|header| ColumnSpec {
                    name: header.to_string(),
                    logical_type: LogicalType::Utf8(Some(1000)),
                    nullable: !metadata_keys.contains(&header.to_string()),
                })
                .collect()
        });

        Ok(Self { objects })
    }

    /// Columns for an object, in metadata order.
    #[must_use]
    pub fn get(&self, object: &str) -> Option<&[ColumnSpec]> {
        self.objects.get(object).map(Vec::as_slice)
    }

    /// Mutable columns for an object.
    pub fn get_mut(&mut self, object: &str) -> Option<&mut Vec<ColumnSpec>> {
        self.objects.get_mut(object)
    }

    /// Registers or replaces an object's columns.
    pub fn insert(&mut self, object: impl Into<String>, columns: Vec<ColumnSpec>) {
        self.objects.insert(object.into(), columns);
    }

    /// All registered object names.
    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Extracts the object name from a vendor `extract` value.
#[must_use]
pub fn object_name(extract: &str) -> String {
    extract
        .split_once('.')
        .map_or(extract, |(_, name)| name)
        .to_string()
}

/// Promotes `int64` columns to `float64` when sampled CSV values carry a
/// decimal separator.
///
/// Detection is per window: the promotion is recomputed from each window's
/// data and never persisted.
///
/// # Errors
///
/// Returns `Error::Columnar` if the CSV cannot be read.
pub fn promote_decimals(columns: &mut [ColumnSpec], csv_data: &[u8]) -> Result<()> {
    let int_columns: Vec<&str> = columns
        .iter()
        .filter(|c| c.logical_type == LogicalType::Int64)
        .map(|c| c.name.as_str())
        .collect();
    if int_columns.is_empty() {
        return Ok(());
    }

    let mut reader = csv::ReaderBuilder::new().from_reader(csv_data);
    let headers = reader
        .headers()
        .map_err(|e| Error::columnar(format!("read headers: {e}")))?
        .clone();

    let indices: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| int_columns.contains(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut decimal: Vec<String> = Vec::new();
    for record in reader.records().take(DECIMAL_SAMPLE_ROWS) {
        let record = record.map_err(|e| Error::columnar(format!("read record: {e}")))?;
        for (index, name) in &indices {
            if decimal.contains(name) {
                continue;
            }
            if let Some(value) = record.get(*index) {
                if !value.is_empty() && value.contains('.') && value.parse::<f64>().is_ok() {
                    decimal.push(name.clone());
                }
            }
        }
        if decimal.len() == indices.len() {
            break;
        }
    }

    for column in columns.iter_mut() {
        if decimal.contains(&column.name) {
            tracing::debug!(column = %column.name, "decimal values sampled, promoting to float64");
            column.logical_type = LogicalType::Float64;
        }
    }
    Ok(())
}

/// Planned schema changes for one object.
#[derive(Debug, Clone, Default)]
pub struct SchemaDelta {
    /// Columns to add.
    pub add: Vec<ColumnSpec>,
    /// Columns to widen.
    pub widen: Vec<ColumnChange>,
}

impl SchemaDelta {
    /// Whether any change is planned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.widen.is_empty()
    }
}

/// One column type change.
#[derive(Debug, Clone)]
pub struct ColumnChange {
    /// Affected column.
    pub column: String,
    /// Live type.
    pub from: LogicalType,
    /// Target type.
    pub to: LogicalType,
}

/// Diffs live columns against the window's target columns.
///
/// # Errors
///
/// Returns `Error::IncompatibleSchemaChange` for any change outside the
/// widening matrix. Live columns absent from the target are left alone;
/// removals arrive as explicit `drop_column` manifest rows.
pub fn diff_columns(
    object: &str,
    live: &[ColumnSpec],
    target: &[ColumnSpec],
) -> Result<SchemaDelta> {
    let live_by_name: BTreeMap<&str, &ColumnSpec> =
        live.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut delta = SchemaDelta::default();
    for wanted in target {
        match live_by_name.get(wanted.name.as_str()) {
            None => delta.add.push(wanted.clone()),
            Some(existing) if existing.logical_type == wanted.logical_type => {}
            Some(existing) => {
                if existing.logical_type.can_widen_to(&wanted.logical_type) {
                    delta.widen.push(ColumnChange {
                        column: wanted.name.clone(),
                        from: existing.logical_type,
                        to: wanted.logical_type,
                    });
                } else {
                    return Err(Error::IncompatibleSchemaChange {
                        object: object.to_string(),
                        column: wanted.name.clone(),
                        from_type: existing.logical_type.to_string(),
                        to_type: wanted.logical_type.to_string(),
                    });
                }
            }
        }
    }
    Ok(delta)
}
