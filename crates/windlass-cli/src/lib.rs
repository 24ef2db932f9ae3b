//! # windlass-cli
//!
//! Operator command-line interface for the windlass sync pipeline.
//!
//! ## Commands
//!
//! - `windlass reset-failed` - Reset a FAILED window back to READY
//! - `windlass trigger-full` - Trigger a full-load rewind at a snapshot date
//! - `windlass status` - Show vault state and recent queue entries
//!
//! ## Configuration
//!
//! The CLI uses environment variables or command-line flags:
//!
//! - `OBJECT_STORE_ROOT` - Control-plane store root (`file://...` or `mem://`)
//! - `VAULT_ID` - Target vault
//!
//! ## Exit codes
//!
//! `0` success, `2` precondition failure, `3` transient store error,
//! `4` protocol error, `1` anything else.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use std::sync::Arc;

use clap::{Parser, Subcommand};

use windlass_core::queue::{ControlPlane, ObjectControlPlane};
use windlass_core::storage::{MemoryBackend, ObjectStoreBackend, StorageBackend};
use windlass_core::types::VaultId;

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for a failed precondition (lost race, wrong status).
pub const EXIT_PRECONDITION: i32 = 2;
/// Exit code for a transient store error; safe to retry.
pub const EXIT_TRANSIENT: i32 = 3;
/// Exit code for a protocol error; needs investigation.
pub const EXIT_PROTOCOL: i32 = 4;
/// Exit code for everything else.
pub const EXIT_FAILURE: i32 = 1;

/// windlass CLI - sync pipeline operator interface.
#[derive(Debug, Parser)]
#[command(name = "windlass")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Control-plane store root.
    #[arg(long, env = "OBJECT_STORE_ROOT")]
    pub store_root: String,

    /// Target vault.
    #[arg(long, env = "VAULT_ID")]
    pub vault: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Reset a FAILED window back to READY at its current epoch.
    ResetFailed(commands::reset_failed::ResetFailedArgs),
    /// Trigger a full-load rewind at a snapshot date.
    TriggerFull(commands::trigger_full::TriggerFullArgs),
    /// Show vault state and recent queue entries.
    Status(commands::status::StatusArgs),
}

/// Shared command context.
pub struct Context {
    /// Control-plane handle.
    pub plane: Arc<dyn ControlPlane>,
    /// Target vault.
    pub vault: VaultId,
}

impl Context {
    /// Builds the context from parsed CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns an error for an unsupported store root or invalid vault ID.
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let backend = open_backend(&cli.store_root)?;
        Ok(Self {
            plane: Arc::new(ObjectControlPlane::new(backend)),
            vault: cli.vault.parse()?,
        })
    }
}

/// Opens a storage backend for the given root.
///
/// `file://<path>` uses the local filesystem and `mem://` an in-process
/// store (dry runs). Cloud stores are wired in deployment-specific builds.
///
/// # Errors
///
/// Returns an error for unsupported schemes.
pub fn open_backend(root: &str) -> anyhow::Result<Arc<dyn StorageBackend>> {
    if let Some(path) = root.strip_prefix("file://") {
        let store = object_store::local::LocalFileSystem::new_with_prefix(path)?;
        return Ok(Arc::new(ObjectStoreBackend::new(Arc::new(store))));
    }
    if root.starts_with("mem://") {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    anyhow::bail!("unsupported store root '{root}' (expected file://<path> or mem://)")
}

/// Maps a pipeline error to the documented exit code.
#[must_use]
pub fn exit_code_for(error: &windlass_flow::Error) -> i32 {
    if error.is_protocol_error() {
        return EXIT_PROTOCOL;
    }
    if error.is_transient() {
        return EXIT_TRANSIENT;
    }
    match error {
        windlass_flow::Error::Core(windlass_core::Error::PreconditionFailed { .. }) => {
            EXIT_PRECONDITION
        }
        _ => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_reset_failed() {
        let cli = Cli::parse_from([
            "windlass",
            "--store-root",
            "mem://",
            "--vault",
            "v1",
            "reset-failed",
            "--stoptime",
            "2024-01-01T00:30",
        ]);
        assert!(matches!(cli.command, Commands::ResetFailed(_)));
        assert_eq!(cli.vault, "v1");
    }

    #[test]
    fn cli_parses_trigger_full() {
        let cli = Cli::parse_from([
            "windlass",
            "--store-root",
            "mem://",
            "--vault",
            "v1",
            "trigger-full",
            "--snapshot-date",
            "2024-01-01",
        ]);
        assert!(matches!(cli.command, Commands::TriggerFull(_)));
    }

    #[test]
    fn exit_codes_follow_error_taxonomy() {
        let precondition = windlass_flow::Error::Core(
            windlass_core::Error::precondition("entry is PROCESSING"),
        );
        assert_eq!(exit_code_for(&precondition), EXIT_PRECONDITION);

        let transient =
            windlass_flow::Error::Core(windlass_core::Error::transient("throttled"));
        assert_eq!(exit_code_for(&transient), EXIT_TRANSIENT);

        let protocol = windlass_flow::Error::Core(windlass_core::Error::DuplicateChecksum {
            vault_id: "v1".into(),
            sort_key: "incr#202401010015".into(),
        });
        assert_eq!(exit_code_for(&protocol), EXIT_PROTOCOL);

        let other = windlass_flow::Error::warehouse("copy rejected");
        assert_eq!(exit_code_for(&other), EXIT_FAILURE);
    }

    #[test]
    fn unsupported_store_root_is_rejected() {
        assert!(open_backend("mem://").is_ok());
        assert!(open_backend("redis://x").is_err());
    }
}
