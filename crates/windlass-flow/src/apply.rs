//! The apply engine: one window, one warehouse transaction.
//!
//! Phase order per window:
//! 1. Fetch and validate the manifest (presence of every referenced file).
//! 2. Plan schema reconciliation, validating every change before any DDL
//!    is issued. A forbidden change fails the window with no DDL executed.
//! 3. Execute the planned DDL (idempotent, outside the transaction).
//! 4. BEGIN; delete-then-load per object (INCR), append (LOG) or
//!    truncate-and-load (FULL); verify the lease; COMMIT.
//!
//! Any failure after BEGIN rolls back, so either a window is fully visible
//! in final tables or not at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use windlass_core::lease::VaultLease;
use windlass_core::staging::StagingArea;
use windlass_core::types::{LoadType, WindowRef};

use crate::columnar::parquet_rows;
use crate::error::{Error, Result};
use crate::manifest::{DataFileRef, Manifest, ManifestRow};
use crate::schema::{self, ColumnSpec, LogicalType, SchemaRegistry};
use crate::warehouse::{Warehouse, WarehouseTxn};

/// Result of one successful apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOutcome {
    /// Objects loaded in the transaction.
    pub objects_loaded: usize,
    /// Total rows copied.
    pub rows_loaded: u64,
}

/// Planned DDL for one window, validated before execution.
#[derive(Debug)]
enum DdlOp {
    DropTable(String),
    DropColumn(String, String),
    CreateTable(String, Vec<ColumnSpec>),
    RecreateTable(String, Vec<ColumnSpec>),
    AddColumn(String, ColumnSpec),
    AlterColumn(String, String, LogicalType),
}

/// Applies one window into the warehouse.
pub struct ApplyEngine {
    staging: StagingArea,
    warehouse: Arc<dyn Warehouse>,
}

impl ApplyEngine {
    /// Creates an apply engine.
    #[must_use]
    pub fn new(staging: StagingArea, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { staging, warehouse }
    }

    /// Applies the window in a single warehouse transaction.
    ///
    /// When a lease is given, it is re-validated immediately before COMMIT;
    /// a lost lease aborts the transaction with [`Error::LeaseLost`].
    ///
    /// # Errors
    ///
    /// Protocol errors (bad manifest, missing files, forbidden schema
    /// change) and warehouse errors fail the window; the transaction is
    /// rolled back in every non-commit path.
    #[tracing::instrument(
        skip(self, window, lease),
        fields(vault = %window.vault_id, window = %window.sort_key())
    )]
    pub async fn apply(
        &self,
        window: &WindowRef,
        lease: Option<&VaultLease>,
    ) -> Result<ApplyOutcome> {
        let manifest = self.fetch_manifest(window).await?;
        let registry = self.load_registry(window, &manifest).await?;

        let ddl = self.plan_schema(window, &manifest, registry.as_ref()).await?;
        self.execute_ddl(&ddl).await?;

        let mut txn = self.warehouse.begin().await?;
        match self.load_phase(&mut txn, window, &manifest).await {
            Ok(outcome) => {
                if let Some(lease) = lease {
                    if !lease.is_held().await.unwrap_or(false) {
                        txn.rollback().await?;
                        return Err(Error::LeaseLost {
                            vault_id: window.vault_id.clone(),
                        });
                    }
                }
                txn.commit().await?;
                tracing::info!(
                    objects = outcome.objects_loaded,
                    rows = outcome.rows_loaded,
                    "window committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    async fn fetch_manifest(&self, window: &WindowRef) -> Result<Manifest> {
        let bytes = match self.staging.read_manifest(window).await {
            Ok(bytes) => bytes,
            Err(windlass_core::Error::NotFound(_)) => {
                return Err(Error::manifest(format!("window {window} is not staged")));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = Manifest::parse(&bytes)?;

        match self
            .staging
            .verify_files(window, &manifest.data_files())
            .await
        {
            Ok(()) => Ok(manifest),
            Err(windlass_core::Error::NotFound(message)) => Err(Error::manifest(message)),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads the window's metadata registry, if the window staged one.
    ///
    /// Numeric columns are reconciled against the staged parquet schemas:
    /// the producer's per-window decimal promotion lives in the parquet
    /// footer, not in the vendor metadata.
    async fn load_registry(
        &self,
        window: &WindowRef,
        manifest: &Manifest,
    ) -> Result<Option<SchemaRegistry>> {
        let mut registry = None;
        for name in ["metadata_full.csv", "metadata.csv"] {
            match self.staging.read_data_file(window, name).await {
                Ok(bytes) => {
                    registry = Some(SchemaRegistry::from_metadata_csv(&bytes)?);
                    break;
                }
                Err(windlass_core::Error::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let Some(mut registry) = registry else {
            return Ok(None);
        };

        for upsert in manifest.upserts() {
            if !upsert.file_path.ends_with(".parquet") {
                continue;
            }
            let Some(columns) = registry.get_mut(&upsert.object) else {
                continue;
            };
            let bytes = self.staging.read_data_file(window, &upsert.file_path).await?;
            let floats = crate::columnar::parquet_float_columns(bytes)?;
            for column in columns.iter_mut() {
                if column.logical_type == LogicalType::Int64 && floats.contains(&column.name) {
                    column.logical_type = LogicalType::Float64;
                }
            }
        }
        Ok(Some(registry))
    }

    /// Plans all DDL for the window, validating everything first.
    async fn plan_schema(
        &self,
        window: &WindowRef,
        manifest: &Manifest,
        registry: Option<&SchemaRegistry>,
    ) -> Result<Vec<DdlOp>> {
        let mut ops = Vec::new();

        for object in manifest.dropped_tables() {
            ops.push(DdlOp::DropTable(object.to_string()));
        }
        for (object, column) in manifest.dropped_columns() {
            ops.push(DdlOp::DropColumn(object.to_string(), column.to_string()));
        }

        // Explicit schema rows: validate every transition before queueing.
        for row in manifest.schema_changes() {
            match row {
                ManifestRow::AddColumn {
                    object,
                    column,
                    to_type,
                } => {
                    let to: LogicalType = to_type.parse()?;
                    ops.push(DdlOp::AddColumn(
                        object.clone(),
                        ColumnSpec::new(column.clone(), to),
                    ));
                }
                ManifestRow::AlterColumn {
                    object,
                    column,
                    from_type,
                    to_type,
                } => {
                    let from: LogicalType = from_type.parse()?;
                    let to: LogicalType = to_type.parse()?;
                    if !from.can_widen_to(&to) {
                        return Err(Error::IncompatibleSchemaChange {
                            object: object.clone(),
                            column: column.clone(),
                            from_type: from.to_string(),
                            to_type: to.to_string(),
                        });
                    }
                    ops.push(DdlOp::AlterColumn(object.clone(), column.clone(), to));
                }
                _ => {}
            }
        }

        // Registry-driven reconciliation for objects that carry data.
        if let Some(registry) = registry {
            match window.load_type {
                LoadType::Full => {
                    for object in registry.objects() {
                        let Some(target) = registry.get(object) else {
                            continue;
                        };
                        match self.warehouse.table_columns(object).await? {
                            None => {
                                ops.push(DdlOp::CreateTable(object.to_string(), target.to_vec()));
                            }
                            Some(live) if columns_equivalent(&live, target) => {}
                            // A full load replaces data wholesale; recreate
                            // on any schema difference.
                            Some(_) => ops.push(DdlOp::RecreateTable(
                                object.to_string(),
                                target.to_vec(),
                            )),
                        }
                    }
                }
                LoadType::Incr | LoadType::Log => {
                    for upsert in manifest.upserts() {
                        let Some(target) = registry.get(&upsert.object) else {
                            continue;
                        };
                        match self.warehouse.table_columns(&upsert.object).await? {
                            None => ops.push(DdlOp::CreateTable(
                                upsert.object.clone(),
                                target.to_vec(),
                            )),
                            Some(live) => {
                                let delta = schema::diff_columns(&upsert.object, &live, target)?;
                                for column in delta.add {
                                    ops.push(DdlOp::AddColumn(upsert.object.clone(), column));
                                }
                                for change in delta.widen {
                                    ops.push(DdlOp::AlterColumn(
                                        upsert.object.clone(),
                                        change.column,
                                        change.to,
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(ops)
    }

    async fn execute_ddl(&self, ops: &[DdlOp]) -> Result<()> {
        for op in ops {
            match op {
                DdlOp::DropTable(table) => self.warehouse.drop_table(table).await?,
                DdlOp::DropColumn(table, column) => {
                    self.warehouse.drop_column(table, column).await?;
                }
                DdlOp::CreateTable(table, columns) => {
                    self.warehouse.ensure_table(table, columns).await?;
                }
                DdlOp::RecreateTable(table, columns) => {
                    self.warehouse.drop_table(table).await?;
                    self.warehouse.ensure_table(table, columns).await?;
                }
                DdlOp::AddColumn(table, column) => {
                    // Targets created earlier in this window already have
                    // the column; add_column is a no-op there.
                    self.warehouse.add_column(table, column).await?;
                }
                DdlOp::AlterColumn(table, column, to) => {
                    self.warehouse.alter_column_type(table, column, *to).await?;
                }
            }
        }
        Ok(())
    }

    async fn load_phase(
        &self,
        txn: &mut Box<dyn WarehouseTxn>,
        window: &WindowRef,
        manifest: &Manifest,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();

        match window.load_type {
            LoadType::Incr => {
                // Group deletes and upserts per object: the delete runs
                // first and subsumes the old version of every upserted row.
                let mut groups: BTreeMap<String, (Option<&DataFileRef>, Option<&DataFileRef>)> =
                    BTreeMap::new();
                for delete in manifest.deletes() {
                    groups.entry(delete.object.clone()).or_default().0 = Some(delete);
                }
                for upsert in manifest.upserts() {
                    groups.entry(upsert.object.clone()).or_default().1 = Some(upsert);
                }

                for (object, (delete, upsert)) in groups {
                    let key_columns = schema::key_columns(&object);
                    let mut keys = Vec::new();
                    if let Some(delete) = delete {
                        keys.extend(self.read_key_tuples(window, delete, &key_columns).await?);
                    }
                    if let Some(upsert) = upsert {
                        keys.extend(self.read_key_tuples(window, upsert, &key_columns).await?);
                    }
                    if !keys.is_empty() {
                        txn.delete_keys(&object, &key_columns, &keys).await?;
                    }
                    if let Some(upsert) = upsert {
                        let path = self.staging.data_path(window, &upsert.file_path);
                        outcome.rows_loaded += txn.copy_from(&object, &path).await?;
                        outcome.objects_loaded += 1;
                    }
                }
            }
            LoadType::Log => {
                for upsert in manifest.upserts() {
                    let path = self.staging.data_path(window, &upsert.file_path);
                    outcome.rows_loaded += txn.copy_from(&upsert.object, &path).await?;
                    outcome.objects_loaded += 1;
                }
            }
            LoadType::Full => {
                for object in manifest.data_objects() {
                    txn.truncate(&object).await?;
                }
                for upsert in manifest.upserts() {
                    let path = self.staging.data_path(window, &upsert.file_path);
                    outcome.rows_loaded += txn.copy_from(&upsert.object, &path).await?;
                    outcome.objects_loaded += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Reads the key tuples of a staged file.
    async fn read_key_tuples(
        &self,
        window: &WindowRef,
        file: &DataFileRef,
        key_columns: &[String],
    ) -> Result<Vec<Vec<String>>> {
        let bytes = self.staging.read_data_file(window, &file.file_path).await?;

        let (headers, rows) = if file.file_path.ends_with(".parquet") {
            parquet_rows(bytes)?
        } else {
            let mut reader = csv::ReaderBuilder::new().from_reader(bytes.as_ref());
            let headers: Vec<String> = reader
                .headers()
                .map_err(|e| Error::manifest(format!("read {}: {e}", file.file_path)))?
                .iter()
                .map(ToString::to_string)
                .collect();
            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record
                    .map_err(|e| Error::manifest(format!("read {}: {e}", file.file_path)))?;
                rows.push(
                    record
                        .iter()
                        .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                        .collect::<Vec<Option<String>>>(),
                );
            }
            (headers, rows)
        };

        let indices: Vec<usize> = key_columns
            .iter()
            .map(|key| {
                headers.iter().position(|h| h == key).ok_or_else(|| {
                    Error::manifest(format!(
                        "file {} lacks key column {key}",
                        file.file_path
                    ))
                })
            })
            .collect::<Result<_>>()?;

        Ok(rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|&i| row.get(i).cloned().flatten().unwrap_or_default())
                    .collect()
            })
            .collect())
    }
}

fn columns_equivalent(live: &[ColumnSpec], target: &[ColumnSpec]) -> bool {
    if live.len() != target.len() {
        return false;
    }
    let live_types: BTreeMap<&str, LogicalType> = live
        .iter()
        .map(|c| (c.name.as_str(), c.logical_type))
        .collect();
    target
        .iter()
        .all(|c| live_types.get(c.name.as_str()) == Some(&c.logical_type))
}
