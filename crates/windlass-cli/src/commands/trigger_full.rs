//! Trigger-full command - start the full-load rewind protocol.

use chrono::NaiveDate;
use clap::Args;

use windlass_flow::admin::{self, FullEntrySpec};

use crate::Context;

/// Arguments for the trigger-full command.
#[derive(Debug, Args)]
pub struct TriggerFullArgs {
    /// Snapshot date boundary (`YYYY-MM-DD`).
    #[arg(long)]
    pub snapshot_date: NaiveDate,

    /// Staging prefix of an already-staged snapshot window. When omitted,
    /// the FULL producer registers the entry once the snapshot lands.
    #[arg(long, requires = "checksum")]
    pub staging_prefix: Option<String>,

    /// Manifest checksum of the staged snapshot window.
    #[arg(long, requires = "staging_prefix")]
    pub checksum: Option<String>,
}

/// Executes the trigger-full command.
///
/// # Errors
///
/// Exit code 2 on a conflicting concurrent trigger, 3 on transient store
/// errors.
pub async fn execute(args: &TriggerFullArgs, context: &Context) -> windlass_flow::Result<()> {
    let full_entry = match (&args.staging_prefix, &args.checksum) {
        (Some(staging_prefix), Some(checksum)) => Some(FullEntrySpec {
            staging_prefix: staging_prefix.clone(),
            checksum: checksum.clone(),
        }),
        _ => None,
    };

    let epoch = admin::trigger_full_load(
        context.plane.as_ref(),
        &context.vault,
        args.snapshot_date,
        full_entry,
    )
    .await?;

    println!(
        "full load triggered for {} at {} (epoch {epoch})",
        context.vault, args.snapshot_date
    );
    Ok(())
}
