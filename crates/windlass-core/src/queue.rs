//! Durable control plane: the window queue and per-vault state.
//!
//! The control plane is the only shared mutable state in the system. Every
//! transition is a single-record conditional write; pause/resume control
//! flow is encoded as durable status edges, never as in-memory retry loops.
//!
//! [`ObjectControlPlane`] implements the contract over any
//! [`StorageBackend`]: entries and vault state are JSON documents and every
//! mutation is a version-preconditioned read-modify-write. Change events are
//! fanned out in-process; deployments with a native change stream (e.g. a
//! key/value store with CDC) can feed the same [`ChangeFeed`] shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};
use crate::types::{Epoch, LeaseScope, LoadType, LogicalTime, SortKey, VaultId, WindowRef};

/// Bounded retries for read-modify-write races on a single document.
const CAS_MAX_ATTEMPTS: u32 = 3;

/// Capacity of the in-process change fanout. Slow subscribers observe a
/// `Resync` event instead of missing entries.
const CHANGE_FEED_CAPACITY: usize = 256;

/// Lifecycle status of a queued window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    /// Staged and eligible for apply.
    Ready,
    /// Claimed by a consumer; at most one per vault.
    Processing,
    /// Committed to the warehouse.
    Applied,
    /// Apply failed; requires operator action.
    Failed,
}

impl EntryStatus {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Processing => "PROCESSING",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    /// The vault the window belongs to.
    pub vault_id: VaultId,
    /// The window's load type.
    pub load_type: LoadType,
    /// Vendor-assigned window stop time.
    pub logical_time: LogicalTime,
    /// Lifecycle status.
    pub status: EntryStatus,
    /// Prefix of the staged manifest and data files.
    pub staging_prefix: String,
    /// Manifest digest; drives idempotent re-registration.
    pub checksum: String,
    /// Generation the entry belongs to. Entries from older epochs are
    /// invisible to consumers.
    pub epoch: Epoch,
    /// Number of times a consumer has claimed this entry.
    pub attempt_count: u32,
    /// Last apply error, if any.
    pub last_error: Option<String>,
    /// When the entry was registered.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
}

impl WindowEntry {
    /// Creates a READY entry for a freshly staged window.
    #[must_use]
    pub fn ready(window: WindowRef, staging_prefix: String, checksum: String, epoch: Epoch) -> Self {
        let now = Utc::now();
        Self {
            vault_id: window.vault_id,
            load_type: window.load_type,
            logical_time: window.logical_time,
            status: EntryStatus::Ready,
            staging_prefix,
            checksum,
            epoch,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The entry's queue sort key.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.load_type, self.logical_time)
    }

    /// The entry's window reference.
    #[must_use]
    pub fn window(&self) -> WindowRef {
        WindowRef::new(self.vault_id.clone(), self.load_type, self.logical_time)
    }
}

/// Fields to change in a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// The target status.
    pub status: Option<EntryStatus>,
    /// Increment `attempt_count` (claiming).
    pub increment_attempts: bool,
    /// Zero `attempt_count` (operator reset).
    pub reset_attempts: bool,
    /// Replace `last_error`; `None` clears it.
    pub last_error: Option<String>,
    /// Move the entry to a new epoch (full-load rewind).
    pub epoch: Option<Epoch>,
}

impl StatusUpdate {
    /// Transition to `status`, clearing any previous error.
    #[must_use]
    pub fn to(status: EntryStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Also increment the attempt counter.
    #[must_use]
    pub fn claiming(mut self) -> Self {
        self.increment_attempts = true;
        self
    }

    /// Also zero the attempt counter.
    #[must_use]
    pub fn fresh(mut self) -> Self {
        self.reset_attempts = true;
        self
    }

    /// Record a failure message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Move the entry to `epoch`.
    #[must_use]
    pub fn at_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

/// Outcome of an idempotent registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The entry was created.
    Created,
    /// An identical entry (same checksum) already exists; no-op.
    AlreadyRegistered,
}

/// Operating mode of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VaultMode {
    /// Normal incremental operation.
    Incremental,
    /// A full snapshot is pending; only FULL windows are eligible.
    FullLoad,
}

/// An exclusion lease held by one consumer process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Unique holder ID.
    pub owner: String,
    /// When the lease was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses if not renewed.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Returns whether the lease has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Durable per-vault state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultState {
    /// The vault this state belongs to.
    pub vault_id: VaultId,
    /// Operating mode.
    pub mode: VaultMode,
    /// Greatest INCR/FULL logical time whose window has committed.
    pub last_applied_stoptime: Option<LogicalTime>,
    /// Greatest LOG logical time whose window has committed. The log
    /// consumer is independent of the incremental stream.
    pub last_applied_log_date: Option<LogicalTime>,
    /// Current generation. Bumped by every full-load trigger.
    pub current_epoch: Epoch,
    /// When the last full load was triggered. Audit only.
    pub full_load_started_at: Option<DateTime<Utc>>,
    /// Per-stream exclusion leases, keyed by [`LeaseScope`] name.
    #[serde(default)]
    pub leases: BTreeMap<String, LeaseRecord>,
}

impl VaultState {
    /// Fresh state for a vault that has never synced.
    #[must_use]
    pub fn new(vault_id: VaultId) -> Self {
        Self {
            vault_id,
            mode: VaultMode::Incremental,
            last_applied_stoptime: None,
            last_applied_log_date: None,
            current_epoch: Epoch::default(),
            full_load_started_at: None,
            leases: BTreeMap::new(),
        }
    }

    /// The watermark for a given load type.
    #[must_use]
    pub fn watermark(&self, load_type: LoadType) -> Option<LogicalTime> {
        match load_type {
            LoadType::Incr | LoadType::Full => self.last_applied_stoptime,
            LoadType::Log => self.last_applied_log_date,
        }
    }
}

/// Fields to change in a vault-state update.
#[derive(Debug, Clone, Default)]
pub struct VaultStateUpdate {
    /// New operating mode.
    pub mode: Option<VaultMode>,
    /// New INCR/FULL watermark.
    pub last_applied_stoptime: Option<LogicalTime>,
    /// New LOG watermark.
    pub last_applied_log_date: Option<LogicalTime>,
    /// New epoch (full-load trigger).
    pub current_epoch: Option<Epoch>,
    /// Audit timestamp for the full-load trigger.
    pub full_load_started_at: Option<DateTime<Utc>>,
}

/// What changed in the queue.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A queue entry was inserted or modified.
    Entry {
        /// The vault whose queue changed.
        vault_id: VaultId,
        /// Encoded sort key of the changed entry.
        sort_key: String,
    },
    /// The subscriber fell behind; rescan instead of replaying.
    Resync,
}

/// At-least-once stream of queue change events.
///
/// Delivery may duplicate and may reorder across keys; consumers must treat
/// every event as a wakeup, not as state.
pub struct ChangeFeed {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    /// Waits for the next change event. `None` means the plane shut down.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => return Some(ChangeEvent::Resync),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The control-plane contract.
///
/// Any store with conditional single-record updates, ordered range scans on
/// the sort key and a change stream satisfies it.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Registers a window entry idempotently.
    ///
    /// Re-registration with an identical checksum is a no-op; a different
    /// checksum under the same key fails with `Error::DuplicateChecksum`
    /// without mutating anything.
    async fn put_if_absent(&self, entry: WindowEntry) -> Result<RegisterOutcome>;

    /// Fetches a single entry.
    async fn get_entry(&self, vault: &VaultId, key: &SortKey) -> Result<Option<WindowEntry>>;

    /// Atomically transitions an entry's status.
    ///
    /// Fails with `Error::PreconditionFailed` if the current status is not
    /// `expected`, and `Error::NotFound` if the entry is absent.
    async fn conditional_update(
        &self,
        vault: &VaultId,
        key: &SortKey,
        expected: EntryStatus,
        update: StatusUpdate,
    ) -> Result<WindowEntry>;

    /// Returns entries of one load type in ascending sort-key order,
    /// strictly after `after` when given.
    async fn scan_forward(
        &self,
        vault: &VaultId,
        load_type: LoadType,
        after: Option<LogicalTime>,
        limit: usize,
    ) -> Result<Vec<WindowEntry>>;

    /// Fetches vault state, if initialized.
    async fn get_vault_state(&self, vault: &VaultId) -> Result<Option<VaultState>>;

    /// Creates vault state if absent. Losing the creation race is fine.
    async fn init_vault_state(&self, state: VaultState) -> Result<()>;

    /// Updates vault state, guarded by the expected epoch.
    async fn update_vault_state(
        &self,
        vault: &VaultId,
        expected_epoch: Epoch,
        update: VaultStateUpdate,
    ) -> Result<VaultState>;

    /// Attempts to take the `(vault, scope)` lease. Honors expiry of a
    /// previous holder. Returns `false` when the lease is held elsewhere.
    async fn acquire_lease(
        &self,
        vault: &VaultId,
        scope: LeaseScope,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Extends a held lease. Fails with `Error::PreconditionFailed` if the
    /// caller is no longer the holder.
    async fn renew_lease(
        &self,
        vault: &VaultId,
        scope: LeaseScope,
        owner: &str,
        ttl: Duration,
    ) -> Result<()>;

    /// Releases a held lease. No-op if the caller is not the holder.
    async fn release_lease(&self, vault: &VaultId, scope: LeaseScope, owner: &str) -> Result<()>;

    /// Reads the current lease record for a scope, expired or not.
    async fn lease_holder(
        &self,
        vault: &VaultId,
        scope: LeaseScope,
    ) -> Result<Option<LeaseRecord>>;

    /// Subscribes to queue change events.
    fn subscribe(&self) -> ChangeFeed;
}

// ---------------------------------------------------------------------------
// Object-storage-backed implementation
// ---------------------------------------------------------------------------

/// Control plane persisted as JSON documents in object storage.
///
/// Layout:
/// - `<root>/state/<vault>.json`
/// - `<root>/queue/<vault>/<load_type>-<time_key>.json`
///
/// Every mutation is a version-preconditioned write, so concurrent runners
/// can only interleave at record granularity.
pub struct ObjectControlPlane {
    backend: Arc<dyn StorageBackend>,
    root: String,
    events: broadcast::Sender<ChangeEvent>,
}

impl ObjectControlPlane {
    /// Creates a control plane under the default `control/` root.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_root(backend, "control")
    }

    /// Creates a control plane under a custom root prefix.
    #[must_use]
    pub fn with_root(backend: Arc<dyn StorageBackend>, root: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            backend,
            root: root.into(),
            events,
        }
    }

    fn state_path(&self, vault: &VaultId) -> String {
        format!("{}/state/{vault}.json", self.root)
    }

    fn entry_path(&self, vault: &VaultId, key: &SortKey) -> String {
        format!(
            "{}/queue/{vault}/{}-{}.json",
            self.root,
            key.load_type.as_str(),
            key.logical_time.key()
        )
    }

    // Object-store listings match on whole path segments, so the scan lists
    // the vault directory and filters load types by file name.
    fn queue_dir(&self, vault: &VaultId) -> String {
        format!("{}/queue/{vault}", self.root)
    }

    fn emit(&self, vault_id: &VaultId, sort_key: &SortKey) {
        // No subscribers is fine; send only fails when the feed is unused.
        let _ = self.events.send(ChangeEvent::Entry {
            vault_id: vault_id.clone(),
            sort_key: sort_key.encode(),
        });
    }

    async fn load_doc<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<(T, String)>> {
        let Some(meta) = self.backend.head(path).await? else {
            return Ok(None);
        };
        let data = match self.backend.get(path).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let doc = serde_json::from_slice(&data)
            .map_err(|e| Error::serialization(format!("parse {path}: {e}")))?;
        Ok(Some((doc, meta.version)))
    }

    async fn store_doc<T: Serialize>(
        &self,
        path: &str,
        doc: &T,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let bytes = serde_json::to_vec(doc)
            .map_err(|e| Error::serialization(format!("serialize {path}: {e}")))?;
        self.backend
            .put(path, Bytes::from(bytes), precondition)
            .await
    }
}

#[async_trait]
impl ControlPlane for ObjectControlPlane {
    async fn put_if_absent(&self, entry: WindowEntry) -> Result<RegisterOutcome> {
        let key = entry.sort_key();
        let path = self.entry_path(&entry.vault_id, &key);

        match self
            .store_doc(&path, &entry, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                self.emit(&entry.vault_id, &key);
                Ok(RegisterOutcome::Created)
            }
            WriteResult::PreconditionFailed { .. } => {
                let Some((existing, _)) = self.load_doc::<WindowEntry>(&path).await? else {
                    // Deleted between our write and read; treat as contention.
                    return Err(Error::precondition(format!(
                        "registration race on {key}"
                    )));
                };
                if existing.checksum == entry.checksum {
                    Ok(RegisterOutcome::AlreadyRegistered)
                } else {
                    Err(Error::DuplicateChecksum {
                        vault_id: entry.vault_id.to_string(),
                        sort_key: key.encode(),
                    })
                }
            }
        }
    }

    async fn get_entry(&self, vault: &VaultId, key: &SortKey) -> Result<Option<WindowEntry>> {
        let path = self.entry_path(vault, key);
        Ok(self.load_doc(&path).await?.map(|(entry, _)| entry))
    }

    async fn conditional_update(
        &self,
        vault: &VaultId,
        key: &SortKey,
        expected: EntryStatus,
        update: StatusUpdate,
    ) -> Result<WindowEntry> {
        let path = self.entry_path(vault, key);

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((mut entry, version)) = self.load_doc::<WindowEntry>(&path).await? else {
                return Err(Error::NotFound(format!("entry {vault}/{key}")));
            };

            if entry.status != expected {
                return Err(Error::precondition(format!(
                    "entry {vault}/{key} is {}, expected {expected}",
                    entry.status
                )));
            }

            if let Some(status) = update.status {
                entry.status = status;
            }
            if update.increment_attempts {
                entry.attempt_count = entry.attempt_count.saturating_add(1);
            }
            if update.reset_attempts {
                entry.attempt_count = 0;
            }
            entry.last_error.clone_from(&update.last_error);
            if let Some(epoch) = update.epoch {
                entry.epoch = epoch;
            }
            entry.updated_at = Utc::now();

            match self
                .store_doc(&path, &entry, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => {
                    self.emit(vault, key);
                    return Ok(entry);
                }
                WriteResult::PreconditionFailed { .. } => {
                    // Concurrent writer; re-read and re-check the status.
                }
            }
        }

        Err(Error::precondition(format!(
            "lost conditional update race on {vault}/{key}"
        )))
    }

    async fn scan_forward(
        &self,
        vault: &VaultId,
        load_type: LoadType,
        after: Option<LogicalTime>,
        limit: usize,
    ) -> Result<Vec<WindowEntry>> {
        let dir = format!("{}/", self.queue_dir(vault));
        let member_prefix = format!("{}-", load_type.as_str());
        let mut keys: Vec<SortKey> = Vec::new();

        for meta in self.backend.list(&dir).await? {
            let Some(name) = meta.path.strip_prefix(&dir) else {
                continue;
            };
            let Some(time_key) = name
                .strip_prefix(&member_prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let Ok(logical_time) = LogicalTime::parse_key(time_key) else {
                continue;
            };
            if after.is_some_and(|watermark| logical_time <= watermark) {
                continue;
            }
            keys.push(SortKey::new(load_type, logical_time));
        }

        keys.sort();
        keys.truncate(limit);

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get_entry(vault, &key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn get_vault_state(&self, vault: &VaultId) -> Result<Option<VaultState>> {
        let path = self.state_path(vault);
        Ok(self.load_doc(&path).await?.map(|(state, _)| state))
    }

    async fn init_vault_state(&self, state: VaultState) -> Result<()> {
        let path = self.state_path(&state.vault_id);
        // Losing the creation race means another runner initialized first.
        let _ = self
            .store_doc(&path, &state, WritePrecondition::DoesNotExist)
            .await?;
        Ok(())
    }

    async fn update_vault_state(
        &self,
        vault: &VaultId,
        expected_epoch: Epoch,
        update: VaultStateUpdate,
    ) -> Result<VaultState> {
        let path = self.state_path(vault);

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((mut state, version)) = self.load_doc::<VaultState>(&path).await? else {
                return Err(Error::NotFound(format!("vault state {vault}")));
            };

            if state.current_epoch != expected_epoch {
                return Err(Error::precondition(format!(
                    "vault {vault} is at epoch {}, expected {expected_epoch}",
                    state.current_epoch
                )));
            }

            if let Some(mode) = update.mode {
                state.mode = mode;
            }
            if let Some(stoptime) = update.last_applied_stoptime {
                state.last_applied_stoptime = Some(stoptime);
            }
            if let Some(log_date) = update.last_applied_log_date {
                state.last_applied_log_date = Some(log_date);
            }
            if let Some(epoch) = update.current_epoch {
                state.current_epoch = epoch;
            }
            if let Some(started_at) = update.full_load_started_at {
                state.full_load_started_at = Some(started_at);
            }

            match self
                .store_doc(&path, &state, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => return Ok(state),
                WriteResult::PreconditionFailed { .. } => {}
            }
        }

        Err(Error::precondition(format!(
            "lost vault state update race on {vault}"
        )))
    }

    async fn acquire_lease(
        &self,
        vault: &VaultId,
        scope: LeaseScope,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let path = self.state_path(vault);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((mut state, version)) = self.load_doc::<VaultState>(&path).await? else {
                return Err(Error::NotFound(format!("vault state {vault}")));
            };

            if let Some(holder) = state.leases.get(scope.as_str()) {
                if !holder.is_expired() && holder.owner != owner {
                    return Ok(false);
                }
            }

            let now = Utc::now();
            state.leases.insert(
                scope.as_str().to_string(),
                LeaseRecord {
                    owner: owner.to_string(),
                    acquired_at: now,
                    expires_at: now + ttl,
                },
            );

            match self
                .store_doc(&path, &state, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => return Ok(true),
                WriteResult::PreconditionFailed { .. } => {}
            }
        }

        Ok(false)
    }

    async fn renew_lease(
        &self,
        vault: &VaultId,
        scope: LeaseScope,
        owner: &str,
        ttl: Duration,
    ) -> Result<()> {
        let path = self.state_path(vault);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((mut state, version)) = self.load_doc::<VaultState>(&path).await? else {
                return Err(Error::NotFound(format!("vault state {vault}")));
            };

            match state.leases.get_mut(scope.as_str()) {
                Some(holder) if holder.owner == owner => {
                    holder.expires_at = Utc::now() + ttl;
                }
                _ => {
                    return Err(Error::precondition(format!(
                        "lease {vault}/{scope} not held by {owner}"
                    )));
                }
            }

            match self
                .store_doc(&path, &state, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => return Ok(()),
                WriteResult::PreconditionFailed { .. } => {}
            }
        }

        Err(Error::precondition(format!(
            "lost lease renewal race on {vault}/{scope}"
        )))
    }

    async fn release_lease(&self, vault: &VaultId, scope: LeaseScope, owner: &str) -> Result<()> {
        let path = self.state_path(vault);

        for _ in 0..CAS_MAX_ATTEMPTS {
            let Some((mut state, version)) = self.load_doc::<VaultState>(&path).await? else {
                return Ok(());
            };

            match state.leases.get(scope.as_str()) {
                Some(holder) if holder.owner == owner => {
                    state.leases.remove(scope.as_str());
                }
                // Taken over or already gone; leave the new holder intact.
                _ => return Ok(()),
            }

            match self
                .store_doc(&path, &state, WritePrecondition::MatchesVersion(version))
                .await?
            {
                WriteResult::Success { .. } => return Ok(()),
                WriteResult::PreconditionFailed { .. } => {}
            }
        }

        // Renewals from the same process cannot race a release; TTL cleanup
        // covers anything else.
        Ok(())
    }

    async fn lease_holder(
        &self,
        vault: &VaultId,
        scope: LeaseScope,
    ) -> Result<Option<LeaseRecord>> {
        Ok(self
            .get_vault_state(vault)
            .await?
            .and_then(|state| state.leases.get(scope.as_str()).cloned()))
    }

    fn subscribe(&self) -> ChangeFeed {
        ChangeFeed {
            rx: self.events.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn plane() -> ObjectControlPlane {
        ObjectControlPlane::new(Arc::new(MemoryBackend::new()))
    }

    fn vault() -> VaultId {
        VaultId::new("v1").unwrap()
    }

    fn entry(time_key: &str) -> WindowEntry {
        let window = WindowRef::new(
            vault(),
            LoadType::Incr,
            LogicalTime::parse_key(time_key).unwrap(),
        );
        WindowEntry::ready(
            window,
            format!("lake/vault=v1/incr/stoptime={time_key}"),
            format!("sha:{time_key}"),
            Epoch(0),
        )
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let plane = plane();

        let outcome = plane.put_if_absent(entry("202401010015")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Created);

        // Same checksum: no-op.
        let outcome = plane.put_if_absent(entry("202401010015")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::AlreadyRegistered);

        // Different checksum: protocol error, no mutation.
        let mut conflicting = entry("202401010015");
        conflicting.checksum = "sha:other".into();
        let err = plane.put_if_absent(conflicting).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateChecksum { .. }));

        let stored = plane
            .get_entry(&vault(), &entry("202401010015").sort_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.checksum, "sha:202401010015");
    }

    #[tokio::test]
    async fn conditional_update_enforces_expected_status() {
        let plane = plane();
        let key = entry("202401010015").sort_key();
        plane.put_if_absent(entry("202401010015")).await.unwrap();

        let claimed = plane
            .conditional_update(
                &vault(),
                &key,
                EntryStatus::Ready,
                StatusUpdate::to(EntryStatus::Processing).claiming(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, EntryStatus::Processing);
        assert_eq!(claimed.attempt_count, 1);

        // Second claim loses.
        let err = plane
            .conditional_update(
                &vault(),
                &key,
                EntryStatus::Ready,
                StatusUpdate::to(EntryStatus::Processing).claiming(),
            )
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn conditional_update_missing_entry() {
        let plane = plane();
        let err = plane
            .conditional_update(
                &vault(),
                &entry("202401010015").sort_key(),
                EntryStatus::Ready,
                StatusUpdate::to(EntryStatus::Processing),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn scan_forward_orders_and_filters() {
        let plane = plane();
        for key in ["202401010045", "202401010015", "202401010030"] {
            plane.put_if_absent(entry(key)).await.unwrap();
        }
        // A LOG entry must not leak into the INCR scan.
        let log_window = WindowRef::new(
            vault(),
            LoadType::Log,
            LogicalTime::parse_key("20240101").unwrap(),
        );
        plane
            .put_if_absent(WindowEntry::ready(
                log_window,
                "lake/log".into(),
                "sha:log".into(),
                Epoch(0),
            ))
            .await
            .unwrap();

        let all = plane
            .scan_forward(&vault(), LoadType::Incr, None, 10)
            .await
            .unwrap();
        let keys: Vec<String> = all.iter().map(|e| e.logical_time.key()).collect();
        assert_eq!(keys, vec!["202401010015", "202401010030", "202401010045"]);

        let after = plane
            .scan_forward(
                &vault(),
                LoadType::Incr,
                Some(LogicalTime::parse_key("202401010015").unwrap()),
                10,
            )
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].logical_time.key(), "202401010030");
    }

    #[tokio::test]
    async fn vault_state_epoch_guard() {
        let plane = plane();
        plane.init_vault_state(VaultState::new(vault())).await.unwrap();

        let updated = plane
            .update_vault_state(
                &vault(),
                Epoch(0),
                VaultStateUpdate {
                    last_applied_stoptime: Some(LogicalTime::parse_key("202401010015").unwrap()),
                    ..VaultStateUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            updated.last_applied_stoptime.unwrap().key(),
            "202401010015"
        );

        // Stale epoch is rejected.
        let err = plane
            .update_vault_state(
                &vault(),
                Epoch(7),
                VaultStateUpdate {
                    last_applied_stoptime: Some(LogicalTime::parse_key("202401010030").unwrap()),
                    ..VaultStateUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn init_vault_state_race_is_harmless() {
        let plane = plane();
        plane.init_vault_state(VaultState::new(vault())).await.unwrap();

        let mut second = VaultState::new(vault());
        second.current_epoch = Epoch(9);
        plane.init_vault_state(second).await.unwrap();

        let state = plane.get_vault_state(&vault()).await.unwrap().unwrap();
        assert_eq!(state.current_epoch, Epoch(0));
    }

    #[tokio::test]
    async fn lease_exclusion_and_expiry() {
        let plane = plane();
        plane.init_vault_state(VaultState::new(vault())).await.unwrap();

        let taken = plane
            .acquire_lease(&vault(), LeaseScope::Primary, "owner-a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(taken);

        let contended = plane
            .acquire_lease(&vault(), LeaseScope::Primary, "owner-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!contended);

        // An independent scope is not excluded.
        let log_lease = plane
            .acquire_lease(&vault(), LeaseScope::Log, "owner-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(log_lease);

        // Expired leases can be taken over.
        plane
            .acquire_lease(&vault(), LeaseScope::Primary, "owner-a", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let takeover = plane
            .acquire_lease(&vault(), LeaseScope::Primary, "owner-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(takeover);
    }

    #[tokio::test]
    async fn renew_requires_ownership() {
        let plane = plane();
        plane.init_vault_state(VaultState::new(vault())).await.unwrap();
        plane
            .acquire_lease(&vault(), LeaseScope::Primary, "owner-a", Duration::from_secs(60))
            .await
            .unwrap();

        plane
            .renew_lease(&vault(), LeaseScope::Primary, "owner-a", Duration::from_secs(60))
            .await
            .unwrap();

        let err = plane
            .renew_lease(&vault(), LeaseScope::Primary, "owner-b", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn release_is_owner_checked_and_idempotent() {
        let plane = plane();
        plane.init_vault_state(VaultState::new(vault())).await.unwrap();
        plane
            .acquire_lease(&vault(), LeaseScope::Primary, "owner-a", Duration::from_secs(60))
            .await
            .unwrap();

        // Wrong owner: silently leaves the lease intact.
        plane
            .release_lease(&vault(), LeaseScope::Primary, "owner-b")
            .await
            .unwrap();
        assert!(plane
            .lease_holder(&vault(), LeaseScope::Primary)
            .await
            .unwrap()
            .is_some());

        plane
            .release_lease(&vault(), LeaseScope::Primary, "owner-a")
            .await
            .unwrap();
        assert!(plane
            .lease_holder(&vault(), LeaseScope::Primary)
            .await
            .unwrap()
            .is_none());

        // Releasing again is a no-op.
        plane
            .release_lease(&vault(), LeaseScope::Primary, "owner-a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn change_feed_delivers_queue_events() {
        let plane = plane();
        let mut feed = plane.subscribe();

        plane.put_if_absent(entry("202401010015")).await.unwrap();

        match feed.next().await {
            Some(ChangeEvent::Entry { vault_id, sort_key }) => {
                assert_eq!(vault_id, vault());
                assert_eq!(sort_key, "incr#202401010015");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
