//! Process configuration, read once at startup.
//!
//! Configuration is immutable input: every environment variable is parsed
//! and validated here, and nothing reads the environment after startup.

use crate::error::{Error, Result};
use crate::types::{LoadType, VaultId};

const ENV_VAULT_ID: &str = "VAULT_ID";
const ENV_STATE_TABLE_NAME: &str = "STATE_TABLE_NAME";
const ENV_QUEUE_TABLE_NAME: &str = "QUEUE_TABLE_NAME";
const ENV_OBJECT_STORE_ROOT: &str = "OBJECT_STORE_ROOT";
const ENV_WAREHOUSE_DSN: &str = "WAREHOUSE_DSN";
const ENV_EXTRACT_TYPE: &str = "EXTRACT_TYPE";
const ENV_USE_DYNAMIC_WINDOW: &str = "USE_DYNAMIC_WINDOW";
const ENV_DYNAMIC_LOOKBACK_HOURS: &str = "DYNAMIC_LOOKBACK_HOURS";
const ENV_CONVERT_TO_COLUMNAR: &str = "CONVERT_TO_COLUMNAR";
const ENV_MAX_ATTEMPTS: &str = "MAX_ATTEMPTS";

const DEFAULT_STATE_TABLE: &str = "windlass_state";
const DEFAULT_QUEUE_TABLE: &str = "windlass_queue";
const DEFAULT_LOOKBACK_HOURS: u32 = 24;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The vault this process serves.
    pub vault_id: VaultId,
    /// Control-plane state table name (store-specific addressing).
    pub state_table_name: String,
    /// Control-plane queue table name (store-specific addressing).
    pub queue_table_name: String,
    /// Root prefix or URL of the staging object store.
    pub object_store_root: String,
    /// Warehouse connection string.
    pub warehouse_dsn: String,
    /// Which load type this process extracts or consumes.
    pub extract_type: LoadType,
    /// Fall back to `now - lookback` when no watermark exists.
    pub use_dynamic_window: bool,
    /// Lookback horizon for the dynamic window, in hours.
    pub dynamic_lookback_hours: u32,
    /// Convert staged CSVs to parquet.
    pub convert_to_columnar: bool,
    /// Claim budget before a stuck window needs operator intervention.
    pub max_attempts: u32,
}

impl SyncConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required variable is missing or a
    /// value fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// Test-friendly entry point accepting a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required variable is missing or a
    /// value fails validation.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault_id = require(&get_env, ENV_VAULT_ID)?
            .parse::<VaultId>()
            .map_err(|e| Error::configuration(format!("{ENV_VAULT_ID}: {e}")))?;
        let object_store_root = require(&get_env, ENV_OBJECT_STORE_ROOT)?;
        let warehouse_dsn = require(&get_env, ENV_WAREHOUSE_DSN)?;

        let extract_type = get_env(ENV_EXTRACT_TYPE)
            .map_or(Ok(LoadType::Incr), |raw| {
                raw.parse::<LoadType>()
                    .map_err(|e| Error::configuration(format!("{ENV_EXTRACT_TYPE}: {e}")))
            })?;

        Ok(Self {
            vault_id,
            state_table_name: get_env(ENV_STATE_TABLE_NAME)
                .unwrap_or_else(|| DEFAULT_STATE_TABLE.to_string()),
            queue_table_name: get_env(ENV_QUEUE_TABLE_NAME)
                .unwrap_or_else(|| DEFAULT_QUEUE_TABLE.to_string()),
            object_store_root,
            warehouse_dsn,
            extract_type,
            use_dynamic_window: parse_bool(&get_env, ENV_USE_DYNAMIC_WINDOW, false)?,
            dynamic_lookback_hours: parse_positive_u32(
                &get_env,
                ENV_DYNAMIC_LOOKBACK_HOURS,
                DEFAULT_LOOKBACK_HOURS,
            )?,
            convert_to_columnar: parse_bool(&get_env, ENV_CONVERT_TO_COLUMNAR, false)?,
            max_attempts: parse_positive_u32(&get_env, ENV_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS)?,
        })
    }
}

fn require<F>(get_env: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    get_env(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::configuration(format!("{key} is required")))
}

fn parse_bool<F>(get_env: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(Error::configuration(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_positive_u32<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    let parsed = raw.parse::<u32>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}
