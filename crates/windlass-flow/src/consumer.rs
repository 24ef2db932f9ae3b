//! The consumer orchestrator: selects, claims and applies windows.
//!
//! One invocation drains one vault's queue for one stream. All durable
//! state lives in the control plane, so the loop is reentrant: a crash at
//! any point is recovered by the next invocation from status edges alone.
//!
//! Single-flight is the conjunction of the `(vault, stream)` lease and the
//! `READY -> PROCESSING` conditional write; either alone is insufficient.

use std::sync::Arc;
use std::time::Duration;

use windlass_core::config::SyncConfig;
use windlass_core::lease::VaultLease;
use windlass_core::queue::{
    ChangeEvent, ChangeFeed, ControlPlane, EntryStatus, StatusUpdate, VaultMode, VaultStateUpdate,
    WindowEntry,
};
use windlass_core::types::{Epoch, LeaseScope, LoadType, VaultId};

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::apply::ApplyEngine;
use crate::error::{Error, Result};

/// Default lease TTL: generous apply time plus slack.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Entries fetched per selection scan.
const SCAN_LIMIT: usize = 32;

/// Outcome of one consumer invocation.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Windows applied and committed in this invocation.
    pub applied: usize,
    /// Why draining stopped early, if it did (failed or stuck entry).
    pub blocked: Option<String>,
}

/// Drives the apply engine for one vault.
pub struct Consumer {
    plane: Arc<dyn ControlPlane>,
    engine: ApplyEngine,
    alerts: Arc<dyn AlertSink>,
    config: SyncConfig,
    scope: LeaseScope,
    lease_ttl: Duration,
}

impl Consumer {
    /// Creates a consumer. The stream follows the configured extract type:
    /// LOG runs as an independent consumer with its own lease and
    /// watermark; INCR and FULL share the primary stream.
    #[must_use]
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        engine: ApplyEngine,
        alerts: Arc<dyn AlertSink>,
        config: SyncConfig,
    ) -> Self {
        let scope = match config.extract_type {
            LoadType::Log => LeaseScope::Log,
            LoadType::Incr | LoadType::Full => LeaseScope::Primary,
        };
        Self {
            plane,
            engine,
            alerts,
            config,
            scope,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    /// Overrides the lease TTL.
    #[must_use]
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Runs one drain pass.
    ///
    /// Exits cleanly when another runner holds the lease or the queue is
    /// empty; returns an error after marking an entry FAILED.
    ///
    /// # Errors
    ///
    /// Apply failures propagate after the entry is marked FAILED and an
    /// alert is emitted. A lost lease propagates without touching the
    /// entry.
    #[tracing::instrument(
        skip(self),
        fields(vault = %self.config.vault_id, scope = %self.scope)
    )]
    pub async fn run_once(&self) -> Result<DrainReport> {
        let vault = self.config.vault_id.clone();

        let Some(lease) = VaultLease::acquire(
            Arc::clone(&self.plane),
            vault.clone(),
            self.scope,
            self.lease_ttl,
        )
        .await?
        else {
            tracing::info!(vault = %vault, scope = %self.scope, "another runner owns the lease");
            return Ok(DrainReport::default());
        };

        let result = self.drain(&vault, &lease).await;
        match result {
            Ok(report) => {
                lease.release().await?;
                Ok(report)
            }
            Err(e) => {
                // A lost lease is not ours to release.
                if !matches!(e, Error::LeaseLost { .. }) {
                    let _ = lease.release().await;
                }
                Err(e)
            }
        }
    }

    /// Event-driven loop: drain once per change-feed wakeup.
    ///
    /// Duplicate and unordered wakeups are harmless; every pass re-reads
    /// durable state. Returns when the feed closes.
    ///
    /// # Errors
    ///
    /// Propagates the first drain failure.
    pub async fn serve(&self, feed: &mut ChangeFeed) -> Result<()> {
        loop {
            self.run_once().await?;
            loop {
                match feed.next().await {
                    Some(ChangeEvent::Entry { vault_id, .. })
                        if vault_id == self.config.vault_id =>
                    {
                        break;
                    }
                    Some(ChangeEvent::Entry { .. }) => {}
                    Some(ChangeEvent::Resync) => break,
                    None => return Ok(()),
                }
            }
        }
    }

    async fn drain(&self, vault: &VaultId, lease: &VaultLease) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        loop {
            let state = self
                .plane
                .get_vault_state(vault)
                .await?
                .ok_or_else(|| windlass_core::Error::NotFound(format!("vault state {vault}")))?;

            let load_type = match self.scope {
                LeaseScope::Log => LoadType::Log,
                LeaseScope::Primary => match state.mode {
                    VaultMode::FullLoad => LoadType::Full,
                    VaultMode::Incremental => LoadType::Incr,
                },
            };
            // The FULL entry sits exactly at the rewound watermark, so the
            // full stream scans from the beginning and relies on the epoch
            // filter instead.
            let watermark = match load_type {
                LoadType::Full => None,
                LoadType::Incr | LoadType::Log => state.watermark(load_type),
            };

            let entries = self
                .plane
                .scan_forward(vault, load_type, watermark, SCAN_LIMIT)
                .await?;
            let Some(entry) = next_eligible(&entries, state.current_epoch) else {
                break;
            };

            match entry.status {
                EntryStatus::Ready => {
                    let key = entry.sort_key();
                    let claimed = match self
                        .plane
                        .conditional_update(
                            vault,
                            &key,
                            EntryStatus::Ready,
                            StatusUpdate::to(EntryStatus::Processing).claiming(),
                        )
                        .await
                    {
                        Ok(claimed) => claimed,
                        Err(windlass_core::Error::PreconditionFailed { .. }) => {
                            // Lost the claim race; re-read and re-select.
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };

                    lease.renew().await?;
                    self.apply_claimed(vault, &state.current_epoch, load_type, &claimed, lease)
                        .await?;
                    report.applied += 1;
                }
                EntryStatus::Processing => {
                    // We hold the stream lease, so the claimant is gone.
                    if entry.attempt_count < self.config.max_attempts {
                        tracing::warn!(
                            window = %entry.sort_key(),
                            attempts = entry.attempt_count,
                            "recovering interrupted window"
                        );
                        match self
                            .plane
                            .conditional_update(
                                vault,
                                &entry.sort_key(),
                                EntryStatus::Processing,
                                StatusUpdate::to(EntryStatus::Ready),
                            )
                            .await
                        {
                            Ok(_) | Err(windlass_core::Error::PreconditionFailed { .. }) => {}
                            Err(e) => return Err(e.into()),
                        }
                        continue;
                    }

                    let message = format!(
                        "window {} stuck in PROCESSING after {} attempts; operator reset required",
                        entry.sort_key(),
                        entry.attempt_count
                    );
                    self.emit_alert(vault, &entry, &message).await;
                    report.blocked = Some(message);
                    break;
                }
                EntryStatus::Failed => {
                    let message = format!(
                        "window {} is FAILED; operator reset required",
                        entry.sort_key()
                    );
                    tracing::info!(window = %entry.sort_key(), "queue blocked on failed window");
                    report.blocked = Some(message);
                    break;
                }
                EntryStatus::Applied => unreachable!("filtered by next_eligible"),
            }
        }

        Ok(report)
    }

    async fn apply_claimed(
        &self,
        vault: &VaultId,
        epoch: &Epoch,
        load_type: LoadType,
        entry: &WindowEntry,
        lease: &VaultLease,
    ) -> Result<()> {
        let window = entry.window();
        let key = entry.sort_key();

        match self.engine.apply(&window, Some(lease)).await {
            Ok(_) => {
                self.plane
                    .conditional_update(
                        vault,
                        &key,
                        EntryStatus::Processing,
                        StatusUpdate::to(EntryStatus::Applied),
                    )
                    .await?;

                let mut update = VaultStateUpdate::default();
                match load_type {
                    LoadType::Log => update.last_applied_log_date = Some(entry.logical_time),
                    LoadType::Incr | LoadType::Full => {
                        update.last_applied_stoptime = Some(entry.logical_time);
                    }
                }
                if load_type == LoadType::Full {
                    update.mode = Some(VaultMode::Incremental);
                }
                self.plane.update_vault_state(vault, *epoch, update).await?;
                Ok(())
            }
            Err(e @ Error::LeaseLost { .. }) => {
                // The entry stays PROCESSING; the lease TTL owns recovery.
                tracing::warn!(window = %key, "lease lost mid-apply, aborted before commit");
                Err(e)
            }
            Err(e) => {
                let update = StatusUpdate::to(EntryStatus::Failed).with_error(e.to_string());
                if let Err(mark_err) = self
                    .plane
                    .conditional_update(vault, &key, EntryStatus::Processing, update)
                    .await
                {
                    tracing::error!(window = %key, error = %mark_err, "failed to mark window FAILED");
                }
                self.emit_alert(vault, entry, &format!("apply failed: {e}")).await;
                Err(e)
            }
        }
    }

    async fn emit_alert(&self, vault: &VaultId, entry: &WindowEntry, message: &str) {
        let alert = Alert::new(AlertSeverity::Critical, vault.to_string(), message)
            .with_context("window", entry.sort_key().encode())
            .with_context("attempts", entry.attempt_count.to_string());
        if let Err(e) = self.alerts.emit(alert).await {
            tracing::warn!(error = %e, "alert delivery failed");
        }
    }
}

/// First entry at the current epoch that is not already applied.
///
/// Entries from other epochs are invisible; APPLIED entries past the
/// watermark should not occur but are skipped defensively.
fn next_eligible(entries: &[WindowEntry], epoch: Epoch) -> Option<WindowEntry> {
    entries
        .iter()
        .filter(|e| e.epoch == epoch)
        .find(|e| e.status != EntryStatus::Applied)
        .cloned()
}
