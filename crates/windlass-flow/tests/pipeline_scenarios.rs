//! End-to-end pipeline scenarios over the in-memory stack.
//!
//! Each test drives the real producer/consumer/apply code against the
//! in-memory control plane, staging backend and warehouse, checking the
//! pipeline's ordering, single-flight and rewind guarantees.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;

use windlass_core::config::SyncConfig;
use windlass_core::queue::{
    ControlPlane, EntryStatus, ObjectControlPlane, StatusUpdate, VaultMode, VaultState,
    VaultStateUpdate, WindowEntry,
};
use windlass_core::staging::StagingArea;
use windlass_core::storage::MemoryBackend;
use windlass_core::types::{Epoch, LoadType, LogicalTime, SortKey, VaultId, WindowRef};

use windlass_flow::alerts::{AlertSink, MemoryAlertSink};
use windlass_flow::apply::ApplyEngine;
use windlass_flow::archive::pack_window;
use windlass_flow::consumer::Consumer;
use windlass_flow::manifest::{DataFileRef, Manifest, ManifestRow};
use windlass_flow::producer::Producer;
use windlass_flow::vendor::{FilePart, VendorClient, WindowDescriptor};
use windlass_flow::warehouse::{MemoryWarehouse, Warehouse};
use windlass_flow::{admin, Error};

const PRODUCT_METADATA: &str = "\
extract,column_name,type,length
Object.product__v,id,String,255
Object.product__v,name__v,String,128
";

fn vault() -> VaultId {
    VaultId::new("v1").unwrap()
}

fn lt(key: &str) -> LogicalTime {
    LogicalTime::parse_key(key).unwrap()
}

fn incr_key(key: &str) -> SortKey {
    SortKey::new(LoadType::Incr, lt(key))
}

fn test_config(extract_type: &str, convert: bool) -> SyncConfig {
    SyncConfig::from_env_with(|key| match key {
        "VAULT_ID" => Some("v1".to_string()),
        "OBJECT_STORE_ROOT" => Some("lake".to_string()),
        "WAREHOUSE_DSN" => Some("memory://analytics".to_string()),
        "EXTRACT_TYPE" => Some(extract_type.to_string()),
        "USE_DYNAMIC_WINDOW" => Some("true".to_string()),
        "CONVERT_TO_COLUMNAR" => Some(if convert { "1" } else { "0" }.to_string()),
        _ => None,
    })
    .unwrap()
}

struct Pipeline {
    plane: Arc<ObjectControlPlane>,
    staging: StagingArea,
    warehouse: Arc<MemoryWarehouse>,
    alerts: Arc<MemoryAlertSink>,
}

impl Pipeline {
    async fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let plane = Arc::new(ObjectControlPlane::new(backend.clone()));
        let staging = StagingArea::new(backend.clone(), "lake");
        let warehouse = Arc::new(MemoryWarehouse::new(backend));
        let alerts = Arc::new(MemoryAlertSink::new());

        plane.init_vault_state(VaultState::new(vault())).await.unwrap();

        Self {
            plane,
            staging,
            warehouse,
            alerts,
        }
    }

    fn consumer(&self) -> Consumer {
        let engine = ApplyEngine::new(
            self.staging.clone(),
            Arc::clone(&self.warehouse) as Arc<dyn Warehouse>,
        );
        Consumer::new(
            Arc::clone(&self.plane) as Arc<dyn ControlPlane>,
            engine,
            Arc::clone(&self.alerts) as Arc<dyn AlertSink>,
            test_config("INCR", false),
        )
        .with_lease_ttl(Duration::from_secs(60))
    }

    async fn seed_watermark(&self, key: &str) {
        self.plane
            .update_vault_state(
                &vault(),
                Epoch(0),
                VaultStateUpdate {
                    last_applied_stoptime: Some(lt(key)),
                    ..VaultStateUpdate::default()
                },
            )
            .await
            .unwrap();
    }

    async fn state(&self) -> VaultState {
        self.plane.get_vault_state(&vault()).await.unwrap().unwrap()
    }

    async fn entry_status(&self, key: &str) -> EntryStatus {
        self.plane
            .get_entry(&vault(), &incr_key(key))
            .await
            .unwrap()
            .unwrap()
            .status
    }

    /// Stages an INCR window carrying upserts (and optional deletes) for
    /// `product__v`, then registers its READY entry.
    async fn stage_incr(&self, key: &str, upsert_csv: &str, delete_csv: Option<&str>) {
        let window = WindowRef::new(vault(), LoadType::Incr, lt(key));
        let mut rows = Vec::new();

        self.staging
            .write_data_file(&window, "metadata.csv", Bytes::from(PRODUCT_METADATA))
            .await
            .unwrap();

        let upsert_count = upsert_csv.lines().count().saturating_sub(1) as u64;
        self.staging
            .write_data_file(
                &window,
                "product__v_upsert.csv",
                Bytes::from(upsert_csv.to_string()),
            )
            .await
            .unwrap();
        rows.push(ManifestRow::Upsert(DataFileRef {
            object: "product__v".into(),
            file_path: "product__v_upsert.csv".into(),
            schema_fingerprint: "fp-product".into(),
            row_count: upsert_count,
        }));

        if let Some(delete_csv) = delete_csv {
            let delete_count = delete_csv.lines().count().saturating_sub(1) as u64;
            self.staging
                .write_data_file(
                    &window,
                    "product__v_delete.csv",
                    Bytes::from(delete_csv.to_string()),
                )
                .await
                .unwrap();
            rows.push(ManifestRow::Delete(DataFileRef {
                object: "product__v".into(),
                file_path: "product__v_delete.csv".into(),
                schema_fingerprint: "fp-product".into(),
                row_count: delete_count,
            }));
        }

        let manifest_csv = Manifest::new(rows).to_csv().unwrap();
        let checksum = Manifest::checksum(&manifest_csv);
        self.staging.finish_window(&window, manifest_csv).await.unwrap();

        self.plane
            .put_if_absent(WindowEntry::ready(
                window.clone(),
                self.staging.prefix(&window),
                checksum,
                Epoch(0),
            ))
            .await
            .unwrap();
    }

    /// Stages a FULL snapshot window for `product__v` and returns its
    /// registration details.
    async fn stage_full(&self, date_key: &str, snapshot_csv: &str) -> admin::FullEntrySpec {
        let window = WindowRef::new(vault(), LoadType::Full, lt(date_key));
        self.staging
            .write_data_file(&window, "metadata_full.csv", Bytes::from(PRODUCT_METADATA))
            .await
            .unwrap();
        let count = snapshot_csv.lines().count().saturating_sub(1) as u64;
        self.staging
            .write_data_file(
                &window,
                "product__v.csv",
                Bytes::from(snapshot_csv.to_string()),
            )
            .await
            .unwrap();

        let manifest_csv = Manifest::new(vec![ManifestRow::Upsert(DataFileRef {
            object: "product__v".into(),
            file_path: "product__v.csv".into(),
            schema_fingerprint: "fp-product".into(),
            row_count: count,
        })])
        .to_csv()
        .unwrap();
        let checksum = Manifest::checksum(&manifest_csv);
        self.staging.finish_window(&window, manifest_csv).await.unwrap();

        admin::FullEntrySpec {
            staging_prefix: self.staging.prefix(&window),
            checksum,
        }
    }

    fn product_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .warehouse
            .table("product__v")
            .unwrap()
            .map(|t| {
                t.rows
                    .iter()
                    .filter_map(|r| r.get("id").cloned().flatten())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

// --- Scenario: happy path -------------------------------------------------

#[tokio::test]
async fn happy_path_single_window() {
    let px = Pipeline::new().await;
    px.seed_watermark("202401010000").await;
    px.stage_incr("202401010015", "id,name__v\np1,Widget\n", None)
        .await;

    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(report.blocked.is_none());

    assert_eq!(px.entry_status("202401010015").await, EntryStatus::Applied);
    let state = px.state().await;
    assert_eq!(state.last_applied_stoptime.unwrap(), lt("202401010015"));
    assert_eq!(px.product_ids(), vec!["p1"]);
    assert!(px.alerts.is_empty());
}

// --- Scenario: blocked by failure, resumed by operator --------------------

#[tokio::test]
async fn failure_pauses_queue_and_reset_resumes() {
    let px = Pipeline::new().await;
    px.seed_watermark("202401010000").await;
    px.stage_incr("202401010015", "id,name__v\np1,A\n", None).await;
    px.stage_incr("202401010030", "id,name__v\np2,B\n", None).await;
    px.stage_incr("202401010045", "id,name__v\np3,C\n", None).await;

    // Inject an apply failure for the 00:30 window only.
    px.warehouse.fail_copy_matching("stoptime=202401010030");

    let err = px.consumer().run_once().await.unwrap_err();
    assert!(matches!(err, Error::Warehouse { .. }));

    assert_eq!(px.entry_status("202401010015").await, EntryStatus::Applied);
    assert_eq!(px.entry_status("202401010030").await, EntryStatus::Failed);
    assert_eq!(px.entry_status("202401010045").await, EntryStatus::Ready);

    let state = px.state().await;
    assert_eq!(state.last_applied_stoptime.unwrap(), lt("202401010015"));
    assert_eq!(px.alerts.len(), 1);

    // Nothing from the failed window is observable.
    assert_eq!(px.product_ids(), vec!["p1"]);

    // Operator fixes the cause and resets the window.
    px.warehouse.clear_copy_failure();
    admin::reset_failed(
        px.plane.as_ref(),
        &vault(),
        LoadType::Incr,
        lt("202401010030"),
    )
    .await
    .unwrap();

    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 2);

    let state = px.state().await;
    assert_eq!(state.last_applied_stoptime.unwrap(), lt("202401010045"));
    assert_eq!(px.product_ids(), vec!["p1", "p2", "p3"]);
}

#[tokio::test]
async fn reset_wakes_consumer_via_change_stream() {
    let px = Pipeline::new().await;
    px.seed_watermark("202401010000").await;
    px.stage_incr("202401010015", "id,name__v\np1,A\n", None).await;
    px.warehouse.fail_copy_matching("stoptime=202401010015");

    // First pass fails the window.
    let _ = px.consumer().run_once().await.unwrap_err();
    assert_eq!(px.entry_status("202401010015").await, EntryStatus::Failed);

    // An event-driven consumer sits on the change feed.
    px.warehouse.clear_copy_failure();
    let consumer = px.consumer();
    let mut feed = px.plane.subscribe();
    let server = tokio::spawn(async move { consumer.serve(&mut feed).await });

    admin::reset_failed(
        px.plane.as_ref(),
        &vault(),
        LoadType::Incr,
        lt("202401010015"),
    )
    .await
    .unwrap();

    // The reset's change event wakes the server, which applies the window.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if px.entry_status("202401010015").await == EntryStatus::Applied {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "consumer did not wake on change event"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.abort();

    assert_eq!(px.product_ids(), vec!["p1"]);
}

// --- Scenario: claim race -------------------------------------------------

#[tokio::test]
async fn claim_race_has_exactly_one_winner() {
    let px = Pipeline::new().await;
    px.stage_incr("202401010015", "id,name__v\np1,A\n", None).await;

    let key = incr_key("202401010015");
    let v = vault();
    let claim = || {
        px.plane.conditional_update(
            &v,
            &key,
            EntryStatus::Ready,
            StatusUpdate::to(EntryStatus::Processing).claiming(),
        )
    };

    let (a, b) = tokio::join!(claim(), claim());
    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one claim must win");

    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser,
        Err(windlass_core::Error::PreconditionFailed { .. })
    ));

    // Single claim means a single attempt was recorded.
    let entry = px.plane.get_entry(&vault(), &key).await.unwrap().unwrap();
    assert_eq!(entry.attempt_count, 1);
    assert_eq!(entry.status, EntryStatus::Processing);
}

// --- Scenario: duplicate registration --------------------------------------

#[tokio::test]
async fn duplicate_registration_semantics() {
    let px = Pipeline::new().await;
    px.stage_incr("202401010015", "id,name__v\np1,A\n", None).await;

    let window = WindowRef::new(vault(), LoadType::Incr, lt("202401010015"));
    let existing = px
        .plane
        .get_entry(&vault(), &incr_key("202401010015"))
        .await
        .unwrap()
        .unwrap();

    // Same checksum: no-op.
    let outcome = px
        .plane
        .put_if_absent(WindowEntry::ready(
            window.clone(),
            existing.staging_prefix.clone(),
            existing.checksum.clone(),
            Epoch(0),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, windlass_core::RegisterOutcome::AlreadyRegistered);

    // Different checksum: protocol error, no mutation.
    let err = px
        .plane
        .put_if_absent(WindowEntry::ready(
            window,
            existing.staging_prefix.clone(),
            "sha:other".into(),
            Epoch(0),
        ))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        windlass_core::Error::DuplicateChecksum { .. }
    ));

    let unchanged = px
        .plane
        .get_entry(&vault(), &incr_key("202401010015"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.checksum, existing.checksum);
}

// --- Scenario: full rewind --------------------------------------------------

#[tokio::test]
async fn full_rewind_and_replay() {
    let px = Pipeline::new().await;
    px.seed_watermark("202312312300").await;

    // Apply history: 23:45 the previous day, then 00:15 / 00:30 / 00:45.
    px.stage_incr("202312312345", "id,name__v\np0,Old\n", None).await;
    px.stage_incr("202401010015", "id,name__v\np1,A\n", None).await;
    px.stage_incr("202401010030", "id,name__v\np2,B\n", None).await;
    px.stage_incr("202401010045", "id,name__v\np3,C\n", None).await;
    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 4);

    // Trigger a full load at the 2024-01-01 boundary. The warehouse lost
    // some rows; the snapshot carries p1 only, increments restore p2/p3.
    let spec = px
        .stage_full("20240101", "id,name__v\np0,Old\np1,A\n")
        .await;
    let new_epoch = admin::trigger_full_load(
        px.plane.as_ref(),
        &vault(),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        Some(spec),
    )
    .await
    .unwrap();
    assert_eq!(new_epoch, Epoch(1));

    // Post-trigger control-plane shape.
    let state = px.state().await;
    assert_eq!(state.mode, VaultMode::FullLoad);
    assert_eq!(state.current_epoch, Epoch(1));
    assert_eq!(state.last_applied_stoptime.unwrap(), lt("202401010000"));
    for key in ["202401010015", "202401010030", "202401010045"] {
        let entry = px.plane.get_entry(&vault(), &incr_key(key)).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Ready, "{key}");
        assert_eq!(entry.epoch, Epoch(1), "{key}");
    }
    let untouched = px
        .plane
        .get_entry(&vault(), &incr_key("202312312345"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.status, EntryStatus::Applied);
    assert_eq!(untouched.epoch, Epoch(0));

    // One drain applies the snapshot, flips back to incremental and
    // re-applies the rewound windows in order.
    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 4);

    let state = px.state().await;
    assert_eq!(state.mode, VaultMode::Incremental);
    assert_eq!(state.last_applied_stoptime.unwrap(), lt("202401010045"));
    assert_eq!(px.product_ids(), vec!["p0", "p1", "p2", "p3"]);
}

// --- Ordering and watermark properties --------------------------------------

#[tokio::test]
async fn windows_apply_in_ascending_order_with_deletes() {
    let px = Pipeline::new().await;
    px.seed_watermark("202401010000").await;

    // 00:15 inserts p1 and p2; 00:30 deletes p2 and rewrites p1.
    px.stage_incr("202401010015", "id,name__v\np1,A1\np2,B\n", None)
        .await;
    px.stage_incr(
        "202401010030",
        "id,name__v\np1,A2\n",
        Some("id,deleted_date\np2,2024-01-01T00:25:00Z\n"),
    )
    .await;

    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 2);

    // The later window's view wins: p1 rewritten, p2 gone.
    assert_eq!(px.product_ids(), vec!["p1"]);
    let table = px.warehouse.table("product__v").unwrap().unwrap();
    assert_eq!(
        table.rows[0].get("name__v"),
        Some(&Some("A2".to_string()))
    );
}

#[tokio::test]
async fn watermark_is_monotonic_within_epoch() {
    let px = Pipeline::new().await;
    px.seed_watermark("202401010000").await;
    px.stage_incr("202401010015", "id,name__v\np1,A\n", None).await;
    px.stage_incr("202401010030", "id,name__v\np2,B\n", None).await;

    let mut seen = Vec::new();
    seen.push(px.state().await.last_applied_stoptime.unwrap());
    px.consumer().run_once().await.unwrap();
    seen.push(px.state().await.last_applied_stoptime.unwrap());
    px.consumer().run_once().await.unwrap();
    seen.push(px.state().await.last_applied_stoptime.unwrap());

    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "watermark must never move backwards");
}

// --- End to end through the producer ----------------------------------------

struct OneWindowVendor {
    descriptor: WindowDescriptor,
    archive: Bytes,
}

#[async_trait]
impl VendorClient for OneWindowVendor {
    async fn list_windows(
        &self,
        load_type: LoadType,
        start: LogicalTime,
        stop: LogicalTime,
    ) -> windlass_flow::Result<Vec<WindowDescriptor>> {
        let w = &self.descriptor;
        if w.load_type == load_type && w.stop_time > start && w.stop_time <= stop {
            Ok(vec![w.clone()])
        } else {
            Ok(vec![])
        }
    }

    async fn fetch_part(&self, _part_name: &str) -> windlass_flow::Result<Bytes> {
        Ok(self.archive.clone())
    }
}

#[tokio::test]
async fn full_load_populates_metadata_table() {
    let px = Pipeline::new().await;

    // Operator flips the vault to full-load mode; the snapshot arrives
    // through the FULL producer afterwards.
    admin::trigger_full_load(
        px.plane.as_ref(),
        &vault(),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        None,
    )
    .await
    .unwrap();

    let members = vec![
        (
            "product__v.csv".to_string(),
            Bytes::from("id,name__v\np1,Widget\n"),
        ),
        (
            "metadata_full.csv".to_string(),
            Bytes::from(PRODUCT_METADATA),
        ),
    ];
    let vendor = Arc::new(OneWindowVendor {
        descriptor: WindowDescriptor {
            load_type: LoadType::Full,
            stop_time: lt("20240101"),
            file_name: "v1-20240101-F.tar.gz".into(),
            record_count: 1,
            parts: vec![FilePart {
                name: "v1-20240101-F.tar.gz".into(),
                part_number: 1,
            }],
        },
        archive: pack_window(&members).unwrap(),
    });

    let producer = Producer::new(
        vendor,
        Arc::clone(&px.plane) as Arc<dyn ControlPlane>,
        px.staging.clone(),
        Arc::clone(&px.alerts) as Arc<dyn AlertSink>,
        test_config("FULL", false),
    );
    let report = producer
        .run_once(lt("202401011200").as_datetime())
        .await
        .unwrap();
    assert_eq!(report.staged, 1);

    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 1);

    // The snapshot's metadata rows land in a real metadata table.
    let metadata = px.warehouse.table("metadata").unwrap().unwrap();
    assert_eq!(metadata.rows.len(), 2);
    let mut keys: Vec<(String, String)> = metadata
        .rows
        .iter()
        .map(|row| {
            (
                row.get("extract").cloned().flatten().unwrap_or_default(),
                row.get("column_name").cloned().flatten().unwrap_or_default(),
            )
        })
        .collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            ("Object.product__v".to_string(), "id".to_string()),
            ("Object.product__v".to_string(), "name__v".to_string()),
        ]
    );

    // The table is keyed on (extract, column_name); other columns are
    // nullable text.
    for column in &metadata.columns {
        let is_key = column.name == "extract" || column.name == "column_name";
        assert_eq!(column.nullable, !is_key, "{}", column.name);
    }

    // The object snapshot loaded alongside, and the vault resumed
    // incremental operation.
    assert_eq!(px.product_ids(), vec!["p1"]);
    let state = px.state().await;
    assert_eq!(state.mode, VaultMode::Incremental);
    assert_eq!(state.current_epoch, Epoch(1));
}

#[tokio::test]
async fn vendor_to_warehouse_with_columnar_conversion() {
    let px = Pipeline::new().await;

    let members = vec![
        (
            "Object/product__v_upsert.csv".to_string(),
            Bytes::from("id,name__v,score__c\np1,Widget,1.5\np2,Gadget,2\n"),
        ),
        (
            "metadata.csv".to_string(),
            Bytes::from(
                "extract,column_name,type,length\n\
                 Object.product__v,id,String,255\n\
                 Object.product__v,name__v,String,128\n\
                 Object.product__v,score__c,Number,\n",
            ),
        ),
    ];
    let vendor = Arc::new(OneWindowVendor {
        descriptor: WindowDescriptor {
            load_type: LoadType::Incr,
            stop_time: lt("202401010015"),
            file_name: "v1-202401010015.tar.gz".into(),
            record_count: 2,
            parts: vec![FilePart {
                name: "v1-202401010015.tar.gz".into(),
                part_number: 1,
            }],
        },
        archive: pack_window(&members).unwrap(),
    });

    let producer = Producer::new(
        vendor,
        Arc::clone(&px.plane) as Arc<dyn ControlPlane>,
        px.staging.clone(),
        Arc::clone(&px.alerts) as Arc<dyn AlertSink>,
        test_config("INCR", true),
    );
    let report = producer
        .run_once(lt("202401011200").as_datetime())
        .await
        .unwrap();
    assert_eq!(report.staged, 1);

    let report = px.consumer().run_once().await.unwrap();
    assert_eq!(report.applied, 1);

    // Decimal sampling promoted score__c; the created table reflects it.
    let table = px.warehouse.table("product__v").unwrap().unwrap();
    let score = table.columns.iter().find(|c| c.name == "score__c").unwrap();
    assert_eq!(
        score.logical_type,
        windlass_flow::LogicalType::Float64
    );
    assert_eq!(px.product_ids(), vec!["p1", "p2"]);

    let state = px.state().await;
    assert_eq!(state.last_applied_stoptime.unwrap(), lt("202401010015"));
}
