//! The producer: vendor windows in, READY queue entries out.
//!
//! Per invocation the producer reads the vault watermark, lists available
//! windows, stages each window's files under its prefix (manifest last) and
//! registers a READY entry at the vault's current epoch. Registration is
//! the final step, so a failure anywhere earlier leaves no entry and the
//! next tick retries from scratch.
//!
//! The producer never advances any watermark and never blocks on consumer
//! state; backlog simply accumulates as READY entries.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use windlass_core::config::SyncConfig;
use windlass_core::queue::{ControlPlane, RegisterOutcome, VaultState, WindowEntry};
use windlass_core::staging::{StagingArea, manifest_name};
use windlass_core::storage::MultipartUpload;
use windlass_core::types::{LoadType, LogicalTime, WindowRef};

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::archive::{ExtractedFile, unpack_window};
use crate::columnar::csv_to_parquet;
use crate::error::{Error, Result};
use crate::manifest::{DataFileRef, Manifest, ManifestRow};
use crate::schema::{self, ColumnSpec, LogicalType, SchemaRegistry, object_name};
use crate::vendor::{VendorClient, WindowDescriptor};

/// Vendor members that describe schema rather than carry object rows.
const METADATA_MEMBERS: [&str; 2] = ["metadata_full.csv", "metadata.csv"];

/// Member carrying dropped objects and columns.
const METADATA_DELETES_MEMBER: &str = "metadata_deletes.csv";

/// Outcome of one producer invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerReport {
    /// Windows newly staged and registered.
    pub staged: usize,
    /// Windows skipped (empty, already applied, already registered).
    pub skipped: usize,
}

/// Stages vendor windows and registers them with the control plane.
pub struct Producer {
    vendor: Arc<dyn VendorClient>,
    plane: Arc<dyn ControlPlane>,
    staging: StagingArea,
    alerts: Arc<dyn AlertSink>,
    config: SyncConfig,
}

impl Producer {
    /// Creates a producer.
    #[must_use]
    pub fn new(
        vendor: Arc<dyn VendorClient>,
        plane: Arc<dyn ControlPlane>,
        staging: StagingArea,
        alerts: Arc<dyn AlertSink>,
        config: SyncConfig,
    ) -> Self {
        Self {
            vendor,
            plane,
            staging,
            alerts,
            config,
        }
    }

    /// Runs one producer tick.
    ///
    /// # Errors
    ///
    /// Protocol errors (conflicting re-registration) propagate after an
    /// alert; anything else is absorbed so the next tick can retry.
    #[tracing::instrument(skip(self, now), fields(vault = %self.config.vault_id))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ProducerReport> {
        let vault = &self.config.vault_id;

        let state = match self.plane.get_vault_state(vault).await? {
            Some(state) => state,
            None => {
                let fresh = VaultState::new(vault.clone());
                self.plane.init_vault_state(fresh).await?;
                self.plane
                    .get_vault_state(vault)
                    .await?
                    .ok_or_else(|| windlass_core::Error::NotFound(format!("vault state {vault}")))?
            }
        };

        let watermark = state.watermark(self.config.extract_type);
        let start = match watermark {
            Some(watermark) => watermark,
            None if self.config.use_dynamic_window => {
                let lookback = Duration::hours(i64::from(self.config.dynamic_lookback_hours));
                let start = LogicalTime::from_datetime(now - lookback);
                tracing::info!(start = %start, "no watermark, using dynamic lookback window");
                start
            }
            None => {
                return Err(windlass_core::Error::configuration(
                    "no watermark for this vault; seed the watermark or set USE_DYNAMIC_WINDOW",
                )
                .into());
            }
        };
        let stop = LogicalTime::from_datetime(now);

        // A full-load trigger rewinds the watermark to the snapshot
        // boundary itself, so the FULL listing must include windows at the
        // watermark, not only past it.
        let listing_start = match self.config.extract_type {
            LoadType::Full => LogicalTime::from_datetime(start.as_datetime() - Duration::minutes(1)),
            LoadType::Incr | LoadType::Log => start,
        };

        let mut windows = self
            .vendor
            .list_windows(self.config.extract_type, listing_start, stop)
            .await?;
        windows.sort_by_key(|w| w.stop_time);

        let mut report = ProducerReport::default();
        for descriptor in windows {
            if descriptor.record_count == 0 {
                tracing::debug!(window = %descriptor.stop_time, "empty window, skipping");
                report.skipped += 1;
                continue;
            }
            let below_watermark = match self.config.extract_type {
                LoadType::Full => watermark.is_some_and(|w| descriptor.stop_time < w),
                LoadType::Incr | LoadType::Log => {
                    watermark.is_some_and(|w| descriptor.stop_time <= w)
                }
            };
            if below_watermark {
                tracing::debug!(window = %descriptor.stop_time, "window below watermark, skipping");
                report.skipped += 1;
                continue;
            }

            match self.stage_window(&descriptor).await {
                Ok(RegisterOutcome::Created) => report.staged += 1,
                Ok(RegisterOutcome::AlreadyRegistered) => {
                    tracing::debug!(window = %descriptor.stop_time, "already registered");
                    report.skipped += 1;
                }
                Err(e) if e.is_protocol_error() => {
                    self.alert_protocol_error(&descriptor, &e).await;
                    return Err(e);
                }
                Err(e) => {
                    // Nothing was registered; the next tick retries this
                    // window. Later windows must not jump the queue.
                    tracing::warn!(window = %descriptor.stop_time, error = %e, "staging failed, deferring window");
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn alert_protocol_error(&self, descriptor: &WindowDescriptor, error: &Error) {
        let alert = Alert::new(
            AlertSeverity::Critical,
            self.config.vault_id.to_string(),
            "window registration conflict",
        )
        .with_context("window", descriptor.stop_time.to_string())
        .with_context("error", error.to_string());
        if let Err(e) = self.alerts.emit(alert).await {
            tracing::warn!(error = %e, "alert delivery failed");
        }
    }

    /// Stages one window end to end and registers it.
    async fn stage_window(&self, descriptor: &WindowDescriptor) -> Result<RegisterOutcome> {
        let vault = self.config.vault_id.clone();
        let window = WindowRef::new(vault, descriptor.load_type, descriptor.stop_time);

        self.download_archive(&window, descriptor).await?;
        let archive = self
            .staging
            .read_archive(&window, &descriptor.file_name)
            .await?;
        let files = unpack_window(&archive)?;

        let mut registry = files
            .iter()
            .find(|f| METADATA_MEMBERS.contains(&f.name.as_str()))
            .map(|f| SchemaRegistry::from_metadata_csv(&f.data))
            .transpose()?
            .unwrap_or_default();

        let mut rows: Vec<ManifestRow> = Vec::new();
        for file in &files {
            if file.name == METADATA_DELETES_MEMBER {
                rows.extend(parse_metadata_deletes(&file.data)?);
            }
        }

        for file in &files {
            // The vendor's own manifest is superseded by the one built
            // here.
            if file.name == "manifest.csv" || file.name == manifest_name(window.load_type) {
                continue;
            }
            if file.name == METADATA_DELETES_MEMBER {
                continue;
            }
            if METADATA_MEMBERS.contains(&file.name.as_str()) {
                self.staging
                    .write_data_file(&window, &file.name, file.data.clone())
                    .await?;
                // Full and log loads also land the metadata rows in the
                // warehouse's metadata table, keyed on
                // (extract, column_name). Incremental windows use the file
                // for schema reconciliation only.
                if matches!(window.load_type, LoadType::Full | LoadType::Log) {
                    let (headers, row_count) = csv_shape(&file.name, &file.data)?;
                    rows.push(ManifestRow::Upsert(DataFileRef {
                        object: "metadata".to_string(),
                        file_path: file.name.clone(),
                        schema_fingerprint: Manifest::checksum(headers.join(",").as_bytes()),
                        row_count,
                    }));
                }
                continue;
            }
            if !file.name.ends_with(".csv") {
                tracing::debug!(member = %file.name, "skipping non-CSV member");
                continue;
            }

            rows.push(self.stage_data_file(&window, file, &mut registry).await?);
        }

        rows.sort_by(row_order);
        let manifest = Manifest::new(rows);
        let manifest_csv = manifest.to_csv()?;
        let checksum = Manifest::checksum(&manifest_csv);
        self.staging.finish_window(&window, manifest_csv).await?;

        // Epoch is read at registration time so a full-load trigger racing
        // this staging run invalidates as little as possible.
        let epoch = self
            .plane
            .get_vault_state(&window.vault_id)
            .await?
            .ok_or_else(|| {
                windlass_core::Error::NotFound(format!("vault state {}", window.vault_id))
            })?
            .current_epoch;

        let entry = WindowEntry::ready(window.clone(), self.staging.prefix(&window), checksum, epoch);
        Ok(self.plane.put_if_absent(entry).await?)
    }

    /// Streams the archive parts into staging. Multi-part archives use a
    /// multipart upload that is aborted on any failure.
    async fn download_archive(
        &self,
        window: &WindowRef,
        descriptor: &WindowDescriptor,
    ) -> Result<()> {
        if descriptor.parts.len() <= 1 {
            let part_name = descriptor
                .parts
                .first()
                .map_or(descriptor.file_name.as_str(), |p| p.name.as_str());
            let data = self.vendor.fetch_part(part_name).await?;
            self.staging
                .write_archive(window, &descriptor.file_name, data)
                .await?;
            return Ok(());
        }

        let mut parts = descriptor.parts.clone();
        parts.sort_by_key(|p| p.part_number);

        let mut upload = self
            .staging
            .start_archive_upload(window, &descriptor.file_name)
            .await?;
        for part in &parts {
            let data = match self.vendor.fetch_part(&part.name).await {
                Ok(data) => data,
                Err(e) => {
                    upload.abort().await?;
                    return Err(e);
                }
            };
            if let Err(e) = upload.write_part(data).await {
                upload.abort().await?;
                return Err(e.into());
            }
        }
        upload.complete().await?;
        Ok(())
    }

    /// Writes one data member (optionally converted to parquet) and returns
    /// its manifest row.
    async fn stage_data_file(
        &self,
        window: &WindowRef,
        file: &ExtractedFile,
        registry: &mut SchemaRegistry,
    ) -> Result<ManifestRow> {
        let (object, is_delete) = classify_member(&file.name);
        let (headers, row_count) = csv_shape(&file.name, &file.data)?;
        let fingerprint = Manifest::checksum(headers.join(",").as_bytes());

        let mut file_name = file.name.clone();
        let mut data = file.data.clone();

        if self.config.convert_to_columnar && !is_delete {
            let columns = match registry.get_mut(&object) {
                Some(columns) => {
                    schema::promote_decimals(columns, &file.data)?;
                    columns.clone()
                }
                None => headers
                    .iter()
                    .map(|h| ColumnSpec::new(h.clone(), LogicalType::Utf8(None)))
                    .collect(),
            };
            data = csv_to_parquet(&file.data, &columns)?;
            file_name = file_name.replace(".csv", ".parquet");
        }

        self.staging
            .write_data_file(window, &file_name, data)
            .await?;

        let data_ref = DataFileRef {
            object,
            file_path: file_name,
            schema_fingerprint: fingerprint,
            row_count,
        };
        Ok(if is_delete {
            ManifestRow::Delete(data_ref)
        } else {
            ManifestRow::Upsert(data_ref)
        })
    }
}

/// Derives `(object, is_delete)` from a data member name.
fn classify_member(name: &str) -> (String, bool) {
    let stem = name.trim_end_matches(".csv");
    if let Some(object) = stem.strip_suffix("_delete") {
        (object.to_string(), true)
    } else if let Some(object) = stem.strip_suffix("_deletes") {
        (object.to_string(), true)
    } else if let Some(object) = stem.strip_suffix("_upsert") {
        (object.to_string(), false)
    } else {
        (stem.to_string(), false)
    }
}

/// Returns a CSV member's headers and record count.
fn csv_shape(name: &str, data: &[u8]) -> Result<(Vec<String>, u64)> {
    let mut reader = csv::ReaderBuilder::new().from_reader(data);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| Error::Archive {
            message: format!("member {name}: {e}"),
        })?
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut count = 0u64;
    for record in reader.records() {
        record.map_err(|e| Error::Archive {
            message: format!("member {name}: {e}"),
        })?;
        count += 1;
    }
    Ok((headers, count))
}

/// Translates metadata delete rows into drop operations.
///
/// A deleted `id` column means the whole object is gone; any other column
/// is an individual drop.
fn parse_metadata_deletes(data: &[u8]) -> Result<Vec<ManifestRow>> {
    #[derive(serde::Deserialize)]
    struct DeleteRow {
        extract: String,
        column_name: String,
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(data);
    let mut rows = Vec::new();
    for record in reader.deserialize::<DeleteRow>() {
        let row = record.map_err(|e| Error::Archive {
            message: format!("metadata deletes: {e}"),
        })?;
        let object = object_name(&row.extract);
        if row.column_name == "id" {
            rows.push(ManifestRow::DropTable { object });
        } else {
            rows.push(ManifestRow::DropColumn {
                object,
                column: row.column_name,
            });
        }
    }
    Ok(rows)
}

/// Deterministic manifest row order, so re-staging reproduces the checksum.
fn row_order(a: &ManifestRow, b: &ManifestRow) -> std::cmp::Ordering {
    fn key(row: &ManifestRow) -> (u8, String, String) {
        match row {
            ManifestRow::DropTable { object } => (0, object.clone(), String::new()),
            ManifestRow::DropColumn { object, column } => (1, object.clone(), column.clone()),
            ManifestRow::AddColumn { object, column, .. } => (2, object.clone(), column.clone()),
            ManifestRow::AlterColumn { object, column, .. } => (3, object.clone(), column.clone()),
            ManifestRow::Delete(data) => (4, data.object.clone(), data.file_path.clone()),
            ManifestRow::Upsert(data) => (5, data.object.clone(), data.file_path.clone()),
        }
    }
    key(a).cmp(&key(b))
}
