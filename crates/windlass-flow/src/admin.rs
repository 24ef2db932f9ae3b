//! Operator actions: failed-window reset and the full-load rewind protocol.
//!
//! Every step is a conditional write, so a partially executed trigger can
//! be re-run and converges to the same end state.

use chrono::{NaiveDate, Utc};

use windlass_core::queue::{
    ControlPlane, EntryStatus, StatusUpdate, VaultMode, VaultStateUpdate, WindowEntry,
};
use windlass_core::types::{Epoch, LoadType, LogicalTime, SortKey, VaultId, WindowRef};

use crate::error::Result;

/// Rewind scans fetch at most this many entries per page.
const REWIND_SCAN_LIMIT: usize = 256;

/// Registration details for the FULL entry inserted by a trigger.
///
/// Omitted when the snapshot is not staged yet; the FULL producer registers
/// the entry once the snapshot lands.
#[derive(Debug, Clone)]
pub struct FullEntrySpec {
    /// Staging prefix of the snapshot window.
    pub staging_prefix: String,
    /// Manifest checksum of the snapshot window.
    pub checksum: String,
}

/// Resets a FAILED window back to READY at its current epoch.
///
/// The consumer wakes on the resulting change event and resumes from the
/// reset window.
///
/// # Errors
///
/// Returns `Error::PreconditionFailed` if the entry is not FAILED and
/// `Error::NotFound` if it does not exist.
pub async fn reset_failed(
    plane: &dyn ControlPlane,
    vault: &VaultId,
    load_type: LoadType,
    stoptime: LogicalTime,
) -> Result<WindowEntry> {
    let key = SortKey::new(load_type, stoptime);
    let entry = plane
        .conditional_update(
            vault,
            &key,
            EntryStatus::Failed,
            StatusUpdate::to(EntryStatus::Ready).fresh(),
        )
        .await?;
    tracing::info!(vault = %vault, window = %key, "failed window reset to READY");
    Ok(entry)
}

/// Triggers a catastrophic full-load recovery at `snapshot_date`.
///
/// Steps, each idempotent:
/// 1. Bump the epoch, set `FULL_LOAD` mode and rewind the watermark to the
///    snapshot boundary.
/// 2. Move every INCR entry past the boundary to the new epoch; previously
///    APPLIED entries become READY so they re-apply after the snapshot.
///    Entries at or below the boundary are not disturbed.
/// 3. Register the FULL entry when the snapshot is already staged.
///
/// Re-running a partially executed trigger completes the remaining steps.
///
/// # Errors
///
/// Returns control-plane errors; a concurrent conflicting trigger surfaces
/// as `Error::PreconditionFailed`.
pub async fn trigger_full_load(
    plane: &dyn ControlPlane,
    vault: &VaultId,
    snapshot_date: NaiveDate,
    full_entry: Option<FullEntrySpec>,
) -> Result<Epoch> {
    let boundary = LogicalTime::from_date(snapshot_date);
    let state = plane
        .get_vault_state(vault)
        .await?
        .ok_or_else(|| windlass_core::Error::NotFound(format!("vault state {vault}")))?;

    let new_epoch = if state.mode == VaultMode::FullLoad
        && state.last_applied_stoptime == Some(boundary)
    {
        // Replay of a partially executed trigger; the epoch is already
        // bumped.
        state.current_epoch
    } else {
        let new_epoch = state.current_epoch.next();
        plane
            .update_vault_state(
                vault,
                state.current_epoch,
                VaultStateUpdate {
                    mode: Some(VaultMode::FullLoad),
                    last_applied_stoptime: Some(boundary),
                    current_epoch: Some(new_epoch),
                    full_load_started_at: Some(Utc::now()),
                    ..VaultStateUpdate::default()
                },
            )
            .await?;
        tracing::info!(
            vault = %vault,
            epoch = %new_epoch,
            boundary = %boundary,
            "full load triggered"
        );
        new_epoch
    };

    rewind_incremental_entries(plane, vault, boundary, new_epoch).await?;

    if let Some(spec) = full_entry {
        let window = WindowRef::new(vault.clone(), LoadType::Full, boundary);
        let entry = WindowEntry::ready(window, spec.staging_prefix, spec.checksum, new_epoch);
        plane.put_if_absent(entry).await?;
    }

    Ok(new_epoch)
}

/// Moves INCR entries past the boundary to the new epoch.
///
/// APPLIED entries become READY; READY and FAILED entries keep their status
/// so un-applied data is not lost and failed windows still demand operator
/// attention. PROCESSING entries are left for lease recovery.
async fn rewind_incremental_entries(
    plane: &dyn ControlPlane,
    vault: &VaultId,
    boundary: LogicalTime,
    new_epoch: Epoch,
) -> Result<()> {
    let mut after = Some(boundary);
    loop {
        let page = plane
            .scan_forward(vault, LoadType::Incr, after, REWIND_SCAN_LIMIT)
            .await?;
        if page.is_empty() {
            return Ok(());
        }
        after = page.last().map(|e| e.logical_time);

        for entry in page {
            if entry.epoch == new_epoch {
                continue;
            }
            let key = entry.sort_key();
            let update = match entry.status {
                EntryStatus::Applied => {
                    StatusUpdate::to(EntryStatus::Ready).fresh().at_epoch(new_epoch)
                }
                EntryStatus::Ready => StatusUpdate::to(EntryStatus::Ready).at_epoch(new_epoch),
                EntryStatus::Failed => StatusUpdate::to(EntryStatus::Failed).at_epoch(new_epoch),
                EntryStatus::Processing => continue,
            };
            match plane
                .conditional_update(vault, &key, entry.status, update)
                .await
            {
                Ok(_) => {}
                // Raced with another replay of the same trigger; the other
                // writer moved it.
                Err(windlass_core::Error::PreconditionFailed { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use windlass_core::queue::{ObjectControlPlane, VaultState};
    use windlass_core::storage::MemoryBackend;

    fn vault() -> VaultId {
        VaultId::new("v1").unwrap()
    }

    fn entry(key: &str, status: EntryStatus, epoch: Epoch) -> WindowEntry {
        let window = WindowRef::new(
            vault(),
            LoadType::Incr,
            LogicalTime::parse_key(key).unwrap(),
        );
        let mut entry =
            WindowEntry::ready(window, "lake/prefix".into(), format!("sha:{key}"), epoch);
        entry.status = status;
        entry
    }

    async fn plane_with_state() -> Arc<ObjectControlPlane> {
        let plane = Arc::new(ObjectControlPlane::new(Arc::new(MemoryBackend::new())));
        plane.init_vault_state(VaultState::new(vault())).await.unwrap();
        plane
    }

    #[tokio::test]
    async fn reset_failed_requires_failed_status() {
        let plane = plane_with_state().await;
        plane
            .put_if_absent(entry("202401010030", EntryStatus::Failed, Epoch(0)))
            .await
            .unwrap();

        let reset = reset_failed(
            plane.as_ref(),
            &vault(),
            LoadType::Incr,
            LogicalTime::parse_key("202401010030").unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(reset.status, EntryStatus::Ready);
        assert_eq!(reset.attempt_count, 0);

        // Resetting again fails the precondition.
        let err = reset_failed(
            plane.as_ref(),
            &vault(),
            LoadType::Incr,
            LogicalTime::parse_key("202401010030").unwrap(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Core(windlass_core::Error::PreconditionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn full_trigger_rewinds_applied_entries_past_boundary() {
        let plane = plane_with_state().await;
        // Applied history: one before the boundary, three after.
        for key in ["202312312345", "202401010015", "202401010030", "202401010045"] {
            plane
                .put_if_absent(entry(key, EntryStatus::Applied, Epoch(0)))
                .await
                .unwrap();
        }

        let new_epoch = trigger_full_load(
            plane.as_ref(),
            &vault(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            Some(FullEntrySpec {
                staging_prefix: "lake/vault=v1/full/date=20240101".into(),
                checksum: "sha:full".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(new_epoch, Epoch(1));

        let state = plane.get_vault_state(&vault()).await.unwrap().unwrap();
        assert_eq!(state.mode, VaultMode::FullLoad);
        assert_eq!(state.current_epoch, Epoch(1));
        assert_eq!(
            state.last_applied_stoptime.unwrap().key(),
            "202401010000"
        );

        // Entries past the boundary are READY at the new epoch.
        for key in ["202401010015", "202401010030", "202401010045"] {
            let sort_key =
                SortKey::new(LoadType::Incr, LogicalTime::parse_key(key).unwrap());
            let e = plane.get_entry(&vault(), &sort_key).await.unwrap().unwrap();
            assert_eq!(e.status, EntryStatus::Ready, "{key}");
            assert_eq!(e.epoch, Epoch(1), "{key}");
        }

        // The entry before the boundary is untouched.
        let before = plane
            .get_entry(
                &vault(),
                &SortKey::new(LoadType::Incr, LogicalTime::parse_key("202312312345").unwrap()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.status, EntryStatus::Applied);
        assert_eq!(before.epoch, Epoch(0));

        // The FULL entry is registered at the new epoch.
        let full = plane
            .get_entry(
                &vault(),
                &SortKey::new(LoadType::Full, LogicalTime::parse_key("20240101").unwrap()),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.status, EntryStatus::Ready);
        assert_eq!(full.epoch, Epoch(1));
    }

    #[tokio::test]
    async fn full_trigger_replay_is_idempotent() {
        let plane = plane_with_state().await;
        plane
            .put_if_absent(entry("202401010015", EntryStatus::Applied, Epoch(0)))
            .await
            .unwrap();

        let spec = FullEntrySpec {
            staging_prefix: "lake/vault=v1/full/date=20240101".into(),
            checksum: "sha:full".into(),
        };
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let first = trigger_full_load(plane.as_ref(), &vault(), date, Some(spec.clone()))
            .await
            .unwrap();
        let second = trigger_full_load(plane.as_ref(), &vault(), date, Some(spec))
            .await
            .unwrap();

        // The replay reuses the bumped epoch instead of bumping again.
        assert_eq!(first, second);
        let state = plane.get_vault_state(&vault()).await.unwrap().unwrap();
        assert_eq!(state.current_epoch, first);
    }
}
