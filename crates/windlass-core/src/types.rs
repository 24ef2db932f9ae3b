//! Strongly-typed identifiers for vaults, windows and epochs.
//!
//! `LogicalTime` encodes to a fixed-width key (`YYYYMMDDHHMM`) so that
//! lexical order over encoded sort keys equals chronological apply order
//! within a load type. All timestamps are UTC at minute precision; date-only
//! windows normalize to midnight.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque tenant identifier for one synchronized vault.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultId(String);

impl VaultId {
    /// Creates a vault ID, validating the allowed character set.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the ID is empty or contains
    /// characters outside `[a-z0-9_-]`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidInput("vault id cannot be empty".into()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(Error::InvalidInput(format!(
                "vault id '{id}' may only contain [a-z0-9_-]"
            )));
        }
        Ok(Self(id))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for VaultId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// The kind of change set a window carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    /// Incremental upsert/delete window (minute precision).
    Incr,
    /// Audit-log window (one per day, append-only).
    Log,
    /// Full snapshot (one per day, replaces everything).
    Full,
}

impl LoadType {
    /// Returns the lowercase wire name, also used in staging paths.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incr => "incr",
            Self::Log => "log",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "incr" | "incremental" => Ok(Self::Incr),
            "log" => Ok(Self::Log),
            "full" => Ok(Self::Full),
            other => Err(Error::InvalidInput(format!(
                "unknown load type '{other}' (expected incr, log or full)"
            ))),
        }
    }
}

/// A vendor-assigned window stop time, truncated to minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalTime(DateTime<Utc>);

impl LogicalTime {
    /// Truncates a timestamp to minute precision.
    #[must_use]
    pub fn from_datetime(ts: DateTime<Utc>) -> Self {
        let truncated = ts
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(ts);
        Self(truncated)
    }

    /// Midnight UTC of the given date. Used for LOG and FULL windows.
    #[must_use]
    pub fn from_date(date: NaiveDate) -> Self {
        Self(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default()))
    }

    /// Parses the fixed-width key form: `YYYYMMDDHHMM` or `YYYYMMDD`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for any other shape.
    pub fn parse_key(key: &str) -> Result<Self> {
        match key.len() {
            12 => {
                let naive = chrono::NaiveDateTime::parse_from_str(key, "%Y%m%d%H%M")
                    .map_err(|e| Error::InvalidInput(format!("bad time key '{key}': {e}")))?;
                Ok(Self(Utc.from_utc_datetime(&naive)))
            }
            8 => {
                let date = NaiveDate::parse_from_str(key, "%Y%m%d")
                    .map_err(|e| Error::InvalidInput(format!("bad date key '{key}': {e}")))?;
                Ok(Self::from_date(date))
            }
            _ => Err(Error::InvalidInput(format!(
                "time key '{key}' must be YYYYMMDDHHMM or YYYYMMDD"
            ))),
        }
    }

    /// Fixed-width sortable key: `YYYYMMDDHHMM`.
    #[must_use]
    pub fn key(&self) -> String {
        self.0.format("%Y%m%d%H%M").to_string()
    }

    /// Date-only key: `YYYYMMDD`.
    #[must_use]
    pub fn date_key(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    /// Returns the underlying timestamp.
    #[must_use]
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%MZ"))
    }
}

impl FromStr for LogicalTime {
    type Err = Error;

    /// Accepts RFC 3339, `YYYY-MM-DDTHH:MM`, a bare date, or the key form.
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self::from_datetime(ts.with_timezone(&Utc)));
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M") {
            return Ok(Self::from_datetime(Utc.from_utc_datetime(&naive)));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::from_date(date));
        }
        Self::parse_key(s)
    }
}

/// Composite queue sort key: `<load_type>#<logical_time_key>`.
///
/// Lexical order over the encoded form equals apply order within one load
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortKey {
    /// The window's load type.
    pub load_type: LoadType,
    /// The window's logical stop time.
    pub logical_time: LogicalTime,
}

impl SortKey {
    /// Creates a sort key.
    #[must_use]
    pub fn new(load_type: LoadType, logical_time: LogicalTime) -> Self {
        Self {
            load_type,
            logical_time,
        }
    }

    /// Encodes to the canonical `<load_type>#<YYYYMMDDHHMM>` form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}#{}", self.load_type.as_str(), self.logical_time.key())
    }

    /// Decodes the canonical form.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if either segment is malformed.
    pub fn decode(encoded: &str) -> Result<Self> {
        let (load_type, time_key) = encoded.split_once('#').ok_or_else(|| {
            Error::InvalidInput(format!("sort key '{encoded}' missing '#' separator"))
        })?;
        Ok(Self {
            load_type: load_type.parse()?,
            logical_time: LogicalTime::parse_key(time_key)?,
        })
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Generation counter for a vault. Incremented on every full-load trigger;
/// entries from older epochs are invisible to consumers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(
    /// Raw generation counter.
    pub u64,
);

impl Epoch {
    /// The next epoch.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one window: `(vault, load_type, logical_time)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowRef {
    /// The vault the window belongs to.
    pub vault_id: VaultId,
    /// The window's load type.
    pub load_type: LoadType,
    /// The window's logical stop time.
    pub logical_time: LogicalTime,
}

impl WindowRef {
    /// Creates a window reference.
    #[must_use]
    pub fn new(vault_id: VaultId, load_type: LoadType, logical_time: LogicalTime) -> Self {
        Self {
            vault_id,
            load_type,
            logical_time,
        }
    }

    /// The window's queue sort key.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        SortKey::new(self.load_type, self.logical_time)
    }
}

impl fmt::Display for WindowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vault_id, self.sort_key())
    }
}

/// Which consumer stream a lease protects.
///
/// The primary stream applies INCR and FULL windows; the log stream is an
/// independent consumer with its own watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseScope {
    /// INCR/FULL consumer.
    Primary,
    /// LOG consumer.
    Log,
}

impl LeaseScope {
    /// Returns the lease key segment for this scope.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for LeaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_id_validation() {
        assert!(VaultId::new("acme-pharma_01").is_ok());
        assert!(VaultId::new("").is_err());
        assert!(VaultId::new("Upper").is_err());
        assert!(VaultId::new("has space").is_err());
    }

    #[test]
    fn logical_time_truncates_to_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 42).unwrap();
        let lt = LogicalTime::from_datetime(ts);
        assert_eq!(lt.key(), "202401010015");
    }

    #[test]
    fn logical_time_key_roundtrip() {
        let lt = LogicalTime::parse_key("202401010015").unwrap();
        assert_eq!(lt.key(), "202401010015");

        let date = LogicalTime::parse_key("20240101").unwrap();
        assert_eq!(date.key(), "202401010000");
        assert_eq!(date.date_key(), "20240101");
    }

    #[test]
    fn logical_time_parses_operator_forms() {
        let a: LogicalTime = "2024-01-01T00:15".parse().unwrap();
        let b: LogicalTime = "2024-01-01T00:15:00Z".parse().unwrap();
        assert_eq!(a, b);

        let d: LogicalTime = "2024-01-01".parse().unwrap();
        assert_eq!(d.key(), "202401010000");
    }

    #[test]
    fn sort_key_lexical_order_matches_time_order() {
        let earlier = SortKey::new(LoadType::Incr, LogicalTime::parse_key("202401010015").unwrap());
        let later = SortKey::new(LoadType::Incr, LogicalTime::parse_key("202401010030").unwrap());
        assert!(earlier.encode() < later.encode());
        assert!(earlier < later);
    }

    #[test]
    fn sort_key_roundtrip() {
        let key = SortKey::new(LoadType::Full, LogicalTime::parse_key("20240101").unwrap());
        let decoded = SortKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn load_type_parse_accepts_aliases() {
        assert_eq!("INCR".parse::<LoadType>().unwrap(), LoadType::Incr);
        assert_eq!("incremental".parse::<LoadType>().unwrap(), LoadType::Incr);
        assert_eq!("Full".parse::<LoadType>().unwrap(), LoadType::Full);
        assert!("hourly".parse::<LoadType>().is_err());
    }

    #[test]
    fn epoch_next_increments() {
        assert_eq!(Epoch(0).next(), Epoch(1));
        assert_eq!(Epoch(u64::MAX).next(), Epoch(u64::MAX));
    }
}
