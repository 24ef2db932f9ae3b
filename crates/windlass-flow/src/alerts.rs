//! Operator alerting.
//!
//! Alerts are fire-and-forget notifications for conditions that need a
//! human: failed windows, protocol errors, stuck entries. Delivery targets
//! (pager, queue, chat) are adapters behind [`AlertSink`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::error::Result;

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    /// Worth a look; the pipeline keeps going.
    Warning,
    /// The pipeline is paused for this vault until someone acts.
    Critical,
}

/// One operator notification.
#[derive(Debug, Clone)]
pub struct Alert {
    /// Unique alert ID.
    pub id: String,
    /// Urgency.
    pub severity: AlertSeverity,
    /// The vault the alert concerns.
    pub vault_id: String,
    /// Human-readable description.
    pub message: String,
    /// Structured context (window, error, attempt count).
    pub context: BTreeMap<String, String>,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Creates an alert.
    #[must_use]
    pub fn new(
        severity: AlertSeverity,
        vault_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            severity,
            vault_id: vault_id.into(),
            message: message.into(),
            context: BTreeMap::new(),
            raised_at: Utc::now(),
        }
    }

    /// Attaches a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Alert delivery adapter.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    /// Delivers one alert. Best effort; callers log but do not fail the
    /// pipeline on delivery errors.
    async fn emit(&self, alert: Alert) -> Result<()>;
}

/// Sink that emits alerts as structured log events.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Warning => tracing::warn!(
                alert_id = %alert.id,
                vault = %alert.vault_id,
                context = ?alert.context,
                "{}",
                alert.message
            ),
            AlertSeverity::Critical => tracing::error!(
                alert_id = %alert.id,
                vault = %alert.vault_id,
                context = ?alert.context,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Sink that records alerts in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all alerts emitted so far.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Number of alerts emitted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Whether no alert was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn emit(&self, alert: Alert) -> Result<()> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
        Ok(())
    }
}
