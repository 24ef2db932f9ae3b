//! Warehouse contract and the in-memory implementation.
//!
//! The warehouse is the data plane: final analytic tables plus the
//! transaction that loads one window. DDL runs outside the window
//! transaction (warehouses in this family auto-commit DDL), so every DDL
//! operation here is idempotent: partial DDL followed by an apply failure
//! converges on the next run.
//!
//! [`MemoryWarehouse`] buffers transactional operations and applies them
//! only at commit, so an aborted window leaves no trace. Production
//! implementations issue `COPY ... FROM <staged object>` against the real
//! warehouse; the staged-path signature of
//! [`WarehouseTxn::copy_from`] keeps that pushdown available.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use windlass_core::storage::StorageBackend;

use crate::columnar::parquet_rows;
use crate::error::{Error, Result};
use crate::schema::{ColumnSpec, LogicalType};

/// Warehouse control surface: schema inspection and idempotent DDL.
#[async_trait]
pub trait Warehouse: Send + Sync + 'static {
    /// Returns the live column set of a table, or `None` if it does not
    /// exist.
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<ColumnSpec>>>;

    /// Creates the table if absent. Existing tables are left untouched.
    async fn ensure_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<()>;

    /// Adds a column if absent. Existing rows read back as NULL.
    async fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<()>;

    /// Changes a column's type. The caller has already validated the
    /// widening; this is plain DDL.
    async fn alter_column_type(&self, table: &str, column: &str, to: LogicalType) -> Result<()>;

    /// Drops the table if present.
    async fn drop_table(&self, table: &str) -> Result<()>;

    /// Drops a column if present.
    async fn drop_column(&self, table: &str, column: &str) -> Result<()>;

    /// Opens the window transaction.
    async fn begin(&self) -> Result<Box<dyn WarehouseTxn>>;
}

/// One in-flight warehouse transaction.
///
/// Nothing is observable in final tables until [`commit`](Self::commit)
/// returns; any other exit path must call [`rollback`](Self::rollback).
#[async_trait]
pub trait WarehouseTxn: Send {
    /// Deletes rows whose key tuple appears in `keys`.
    async fn delete_keys(
        &mut self,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> Result<()>;

    /// Removes every row of a table.
    async fn truncate(&mut self, table: &str) -> Result<()>;

    /// Bulk-loads a staged file (CSV or parquet, by extension) into a
    /// table. Returns the number of rows loaded.
    async fn copy_from(&mut self, table: &str, staged_path: &str) -> Result<u64>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the transaction back, discarding all buffered work.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// One in-memory table.
#[derive(Debug, Clone, Default)]
pub struct TableData {
    /// Live column set, in DDL order.
    pub columns: Vec<ColumnSpec>,
    /// Rows as column-name -> value maps; absent keys read as NULL.
    pub rows: Vec<BTreeMap<String, Option<String>>>,
}

/// In-memory warehouse for tests.
///
/// Reads staged files from the same backend the staging layer writes to,
/// mirroring `COPY FROM <object store>`.
pub struct MemoryWarehouse {
    staging: Arc<dyn StorageBackend>,
    tables: Arc<RwLock<BTreeMap<String, TableData>>>,
    fail_copy_matching: Arc<RwLock<Option<String>>>,
}

fn poisoned() -> Error {
    Error::warehouse("lock poisoned")
}

impl MemoryWarehouse {
    /// Creates a warehouse reading staged files from `staging`.
    #[must_use]
    pub fn new(staging: Arc<dyn StorageBackend>) -> Self {
        Self {
            staging,
            tables: Arc::new(RwLock::new(BTreeMap::new())),
            fail_copy_matching: Arc::new(RwLock::new(None)),
        }
    }

    /// Makes every `copy_from` whose staged path contains `fragment` fail.
    ///
    /// Failure injection for apply-error scenarios.
    pub fn fail_copy_matching(&self, fragment: impl Into<String>) {
        if let Ok(mut guard) = self.fail_copy_matching.write() {
            *guard = Some(fragment.into());
        }
    }

    /// Clears copy failure injection.
    pub fn clear_copy_failure(&self) {
        if let Ok(mut guard) = self.fail_copy_matching.write() {
            *guard = None;
        }
    }

    /// Snapshot of a table, for assertions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn table(&self, name: &str) -> Result<Option<TableData>> {
        Ok(self.tables.read().map_err(|_| poisoned())?.get(name).cloned())
    }

    /// Row count of a table, zero if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn row_count(&self, name: &str) -> Result<usize> {
        Ok(self
            .tables
            .read()
            .map_err(|_| poisoned())?
            .get(name)
            .map_or(0, |t| t.rows.len()))
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_columns(&self, table: &str) -> Result<Option<Vec<ColumnSpec>>> {
        Ok(self
            .tables
            .read()
            .map_err(|_| poisoned())?
            .get(table)
            .map(|t| t.columns.clone()))
    }

    async fn ensure_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        tables.entry(table.to_string()).or_insert_with(|| TableData {
            columns: columns.to_vec(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let data = tables
            .get_mut(table)
            .ok_or_else(|| Error::warehouse(format!("no such table: {table}")))?;
        if !data.columns.iter().any(|c| c.name == column.name) {
            data.columns.push(column.clone());
        }
        Ok(())
    }

    async fn alter_column_type(&self, table: &str, column: &str, to: LogicalType) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let data = tables
            .get_mut(table)
            .ok_or_else(|| Error::warehouse(format!("no such table: {table}")))?;
        let spec = data
            .columns
            .iter_mut()
            .find(|c| c.name == column)
            .ok_or_else(|| Error::warehouse(format!("no such column: {table}.{column}")))?;
        spec.logical_type = to;
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.tables.write().map_err(|_| poisoned())?.remove(table);
        Ok(())
    }

    async fn drop_column(&self, table: &str, column: &str) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        if let Some(data) = tables.get_mut(table) {
            data.columns.retain(|c| c.name != column);
            for row in &mut data.rows {
                row.remove(column);
            }
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn WarehouseTxn>> {
        Ok(Box::new(MemoryTxn {
            staging: Arc::clone(&self.staging),
            tables: Arc::clone(&self.tables),
            fail_copy_matching: Arc::clone(&self.fail_copy_matching),
            ops: Vec::new(),
        }))
    }
}

enum TxnOp {
    DeleteKeys {
        table: String,
        key_columns: Vec<String>,
        keys: HashSet<Vec<String>>,
    },
    Truncate {
        table: String,
    },
    Insert {
        table: String,
        headers: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
    },
}

struct MemoryTxn {
    staging: Arc<dyn StorageBackend>,
    tables: Arc<RwLock<BTreeMap<String, TableData>>>,
    fail_copy_matching: Arc<RwLock<Option<String>>>,
    ops: Vec<TxnOp>,
}

impl MemoryTxn {
    async fn read_staged_rows(
        &self,
        staged_path: &str,
    ) -> Result<(Vec<String>, Vec<Vec<Option<String>>>)> {
        let data = self.staging.get(staged_path).await?;
        if staged_path.ends_with(".parquet") {
            parquet_rows(data)
        } else {
            let mut reader = csv::ReaderBuilder::new().from_reader(data.as_ref());
            let headers: Vec<String> = reader
                .headers()
                .map_err(|e| Error::warehouse(format!("read {staged_path}: {e}")))?
                .iter()
                .map(ToString::to_string)
                .collect();
            let mut rows = Vec::new();
            for record in reader.records() {
                let record =
                    record.map_err(|e| Error::warehouse(format!("read {staged_path}: {e}")))?;
                rows.push(
                    record
                        .iter()
                        .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                        .collect(),
                );
            }
            Ok((headers, rows))
        }
    }
}

#[async_trait]
impl WarehouseTxn for MemoryTxn {
    async fn delete_keys(
        &mut self,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<String>],
    ) -> Result<()> {
        self.ops.push(TxnOp::DeleteKeys {
            table: table.to_string(),
            key_columns: key_columns.to_vec(),
            keys: keys.iter().cloned().collect(),
        });
        Ok(())
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        self.ops.push(TxnOp::Truncate {
            table: table.to_string(),
        });
        Ok(())
    }

    async fn copy_from(&mut self, table: &str, staged_path: &str) -> Result<u64> {
        let injected = self
            .fail_copy_matching
            .read()
            .map_err(|_| poisoned())?
            .clone();
        if let Some(fragment) = injected {
            if staged_path.contains(&fragment) {
                return Err(Error::warehouse(format!(
                    "copy rejected for {staged_path} (injected failure)"
                )));
            }
        }

        let (headers, rows) = self.read_staged_rows(staged_path).await?;

        // COPY fails on unknown target columns; catch that before commit.
        {
            let tables = self.tables.read().map_err(|_| poisoned())?;
            let data = tables
                .get(table)
                .ok_or_else(|| Error::warehouse(format!("no such table: {table}")))?;
            for header in &headers {
                if !data.columns.iter().any(|c| c.name == *header) {
                    return Err(Error::warehouse(format!(
                        "column {header} of {staged_path} not in table {table}"
                    )));
                }
            }
        }

        let count = rows.len() as u64;
        self.ops.push(TxnOp::Insert {
            table: table.to_string(),
            headers,
            rows,
        });
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;

        for op in self.ops {
            match op {
                TxnOp::DeleteKeys {
                    table,
                    key_columns,
                    keys,
                } => {
                    let data = tables
                        .get_mut(&table)
                        .ok_or_else(|| Error::warehouse(format!("no such table: {table}")))?;
                    data.rows.retain(|row| {
                        let tuple: Vec<String> = key_columns
                            .iter()
                            .map(|col| row.get(col).cloned().flatten().unwrap_or_default())
                            .collect();
                        !keys.contains(&tuple)
                    });
                }
                TxnOp::Truncate { table } => {
                    let data = tables
                        .get_mut(&table)
                        .ok_or_else(|| Error::warehouse(format!("no such table: {table}")))?;
                    data.rows.clear();
                }
                TxnOp::Insert {
                    table,
                    headers,
                    rows,
                } => {
                    let data = tables
                        .get_mut(&table)
                        .ok_or_else(|| Error::warehouse(format!("no such table: {table}")))?;
                    for values in rows {
                        let row: BTreeMap<String, Option<String>> = headers
                            .iter()
                            .cloned()
                            .zip(values)
                            .collect();
                        data.rows.push(row);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        // Buffered ops are simply dropped.
        Ok(())
    }
}
