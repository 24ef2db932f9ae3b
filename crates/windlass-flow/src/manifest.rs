//! The per-window manifest: the authoritative description of one window's
//! intent.
//!
//! Manifests are CSV with columns `object_name, operation, file_path,
//! schema_fingerprint, row_count, column_name, from_type, to_type`. Rows
//! parse once, at entry, into the closed [`ManifestRow`] variant; nothing
//! downstream handles raw records.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A data-carrying manifest row (upsert or delete).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileRef {
    /// Target object (table).
    pub object: String,
    /// Staged file name relative to the window prefix.
    pub file_path: String,
    /// Digest of the file's schema; changes signal drift.
    pub schema_fingerprint: String,
    /// Rows in the file.
    pub row_count: u64,
}

/// One parsed manifest row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRow {
    /// Upsert rows for an object.
    Upsert(DataFileRef),
    /// Deleted primary keys for an object.
    Delete(DataFileRef),
    /// The object no longer exists; drop its table.
    DropTable {
        /// Affected object.
        object: String,
    },
    /// A column was removed from the object.
    DropColumn {
        /// Affected object.
        object: String,
        /// The removed column.
        column: String,
    },
    /// A column was added to the object.
    AddColumn {
        /// Affected object.
        object: String,
        /// The new column.
        column: String,
        /// The new column's type.
        to_type: String,
    },
    /// A column's type changed.
    AlterColumn {
        /// Affected object.
        object: String,
        /// The changed column.
        column: String,
        /// The previous type.
        from_type: String,
        /// The requested type.
        to_type: String,
    },
}

/// Raw CSV record shape; kept private to the parser.
#[derive(Debug, Serialize, Deserialize)]
struct RawRow {
    object_name: String,
    operation: String,
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    schema_fingerprint: String,
    #[serde(default)]
    row_count: Option<u64>,
    #[serde(default)]
    column_name: String,
    #[serde(default)]
    from_type: String,
    #[serde(default)]
    to_type: String,
}

/// A parsed window manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    rows: Vec<ManifestRow>,
}

impl Manifest {
    /// Builds a manifest from rows.
    #[must_use]
    pub fn new(rows: Vec<ManifestRow>) -> Self {
        Self { rows }
    }

    /// Parses manifest CSV bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::ManifestInvalid` for unknown operations or rows
    /// missing their required fields.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(data);

        let mut rows = Vec::new();
        for (index, record) in reader.deserialize::<RawRow>().enumerate() {
            let raw = record.map_err(|e| Error::manifest(format!("row {}: {e}", index + 1)))?;
            rows.push(Self::parse_row(&raw, index + 1)?);
        }
        Ok(Self { rows })
    }

    fn parse_row(raw: &RawRow, line: usize) -> Result<ManifestRow> {
        let require = |value: &str, field: &str| -> Result<String> {
            if value.is_empty() {
                Err(Error::manifest(format!(
                    "row {line} ({}): missing {field}",
                    raw.operation
                )))
            } else {
                Ok(value.to_string())
            }
        };

        match raw.operation.as_str() {
            "upsert" => Ok(ManifestRow::Upsert(DataFileRef {
                object: require(&raw.object_name, "object_name")?,
                file_path: require(&raw.file_path, "file_path")?,
                schema_fingerprint: raw.schema_fingerprint.clone(),
                row_count: raw.row_count.unwrap_or(0),
            })),
            "delete" => Ok(ManifestRow::Delete(DataFileRef {
                object: require(&raw.object_name, "object_name")?,
                file_path: require(&raw.file_path, "file_path")?,
                schema_fingerprint: raw.schema_fingerprint.clone(),
                row_count: raw.row_count.unwrap_or(0),
            })),
            "drop_table" => Ok(ManifestRow::DropTable {
                object: require(&raw.object_name, "object_name")?,
            }),
            "drop_column" => Ok(ManifestRow::DropColumn {
                object: require(&raw.object_name, "object_name")?,
                column: require(&raw.column_name, "column_name")?,
            }),
            "add_column" => Ok(ManifestRow::AddColumn {
                object: require(&raw.object_name, "object_name")?,
                column: require(&raw.column_name, "column_name")?,
                to_type: require(&raw.to_type, "to_type")?,
            }),
            "alter_column" => Ok(ManifestRow::AlterColumn {
                object: require(&raw.object_name, "object_name")?,
                column: require(&raw.column_name, "column_name")?,
                from_type: require(&raw.from_type, "from_type")?,
                to_type: require(&raw.to_type, "to_type")?,
            }),
            other => Err(Error::manifest(format!(
                "row {line}: unknown operation '{other}'"
            ))),
        }
    }

    /// Renders the manifest to CSV.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a row cannot be written.
    pub fn to_csv(&self) -> Result<Bytes> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            let raw = match row {
                ManifestRow::Upsert(data) => RawRow {
                    object_name: data.object.clone(),
                    operation: "upsert".into(),
                    file_path: data.file_path.clone(),
                    schema_fingerprint: data.schema_fingerprint.clone(),
                    row_count: Some(data.row_count),
                    column_name: String::new(),
                    from_type: String::new(),
                    to_type: String::new(),
                },
                ManifestRow::Delete(data) => RawRow {
                    object_name: data.object.clone(),
                    operation: "delete".into(),
                    file_path: data.file_path.clone(),
                    schema_fingerprint: data.schema_fingerprint.clone(),
                    row_count: Some(data.row_count),
                    column_name: String::new(),
                    from_type: String::new(),
                    to_type: String::new(),
                },
                ManifestRow::DropTable { object } => RawRow {
                    object_name: object.clone(),
                    operation: "drop_table".into(),
                    file_path: String::new(),
                    schema_fingerprint: String::new(),
                    row_count: None,
                    column_name: String::new(),
                    from_type: String::new(),
                    to_type: String::new(),
                },
                ManifestRow::DropColumn { object, column } => RawRow {
                    object_name: object.clone(),
                    operation: "drop_column".into(),
                    file_path: String::new(),
                    schema_fingerprint: String::new(),
                    row_count: None,
                    column_name: column.clone(),
                    from_type: String::new(),
                    to_type: String::new(),
                },
                ManifestRow::AddColumn {
                    object,
                    column,
                    to_type,
                } => RawRow {
                    object_name: object.clone(),
                    operation: "add_column".into(),
                    file_path: String::new(),
                    schema_fingerprint: String::new(),
                    row_count: None,
                    column_name: column.clone(),
                    from_type: String::new(),
                    to_type: to_type.clone(),
                },
                ManifestRow::AlterColumn {
                    object,
                    column,
                    from_type,
                    to_type,
                } => RawRow {
                    object_name: object.clone(),
                    operation: "alter_column".into(),
                    file_path: String::new(),
                    schema_fingerprint: String::new(),
                    row_count: None,
                    column_name: column.clone(),
                    from_type: from_type.clone(),
                    to_type: to_type.clone(),
                },
            };
            writer
                .serialize(raw)
                .map_err(|e| Error::manifest(format!("serialize row: {e}")))?;
        }
        let inner = writer
            .into_inner()
            .map_err(|e| Error::manifest(format!("flush manifest: {e}")))?;
        Ok(Bytes::from(inner))
    }

    /// Digest of raw manifest bytes, used for idempotent registration.
    #[must_use]
    pub fn checksum(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// All rows.
    #[must_use]
    pub fn rows(&self) -> &[ManifestRow] {
        &self.rows
    }

    /// Upsert files with at least one row.
    pub fn upserts(&self) -> impl Iterator<Item = &DataFileRef> {
        self.rows.iter().filter_map(|row| match row {
            ManifestRow::Upsert(data) if data.row_count > 0 => Some(data),
            _ => None,
        })
    }

    /// Delete files with at least one row.
    pub fn deletes(&self) -> impl Iterator<Item = &DataFileRef> {
        self.rows.iter().filter_map(|row| match row {
            ManifestRow::Delete(data) if data.row_count > 0 => Some(data),
            _ => None,
        })
    }

    /// Objects whose table is dropped by this window.
    pub fn dropped_tables(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().filter_map(|row| match row {
            ManifestRow::DropTable { object } => Some(object.as_str()),
            _ => None,
        })
    }

    /// `(object, column)` pairs dropped by this window.
    pub fn dropped_columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rows.iter().filter_map(|row| match row {
            ManifestRow::DropColumn { object, column } => {
                Some((object.as_str(), column.as_str()))
            }
            _ => None,
        })
    }

    /// Explicit schema additions and alterations.
    pub fn schema_changes(&self) -> impl Iterator<Item = &ManifestRow> {
        self.rows.iter().filter(|row| {
            matches!(
                row,
                ManifestRow::AddColumn { .. } | ManifestRow::AlterColumn { .. }
            )
        })
    }

    /// Every data file the manifest references, for completeness checks.
    #[must_use]
    pub fn data_files(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| match row {
                ManifestRow::Upsert(data) | ManifestRow::Delete(data)
                    if data.row_count > 0 =>
                {
                    Some(data.file_path.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// All objects that carry data in this window.
    #[must_use]
    pub fn data_objects(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .filter_map(|row| match row {
                ManifestRow::Upsert(data) | ManifestRow::Delete(data)
                    if data.row_count > 0 =>
                {
                    Some(data.object.clone())
                }
                _ => None,
            })
            .collect()
    }
}
