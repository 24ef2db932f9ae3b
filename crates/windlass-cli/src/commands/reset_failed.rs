//! Reset-failed command - CAS a FAILED window back to READY.

use clap::Args;

use windlass_core::types::{LoadType, LogicalTime};
use windlass_flow::admin;

use crate::Context;

/// Arguments for the reset-failed command.
#[derive(Debug, Args)]
pub struct ResetFailedArgs {
    /// Stop time of the failed window (e.g. `2024-01-01T00:30`).
    #[arg(long)]
    pub stoptime: String,

    /// Load type of the failed window.
    #[arg(long, default_value = "incr")]
    pub load_type: String,
}

/// Executes the reset-failed command.
///
/// # Errors
///
/// Exit code 2 if the window is not FAILED, 3 on transient store errors.
pub async fn execute(args: &ResetFailedArgs, context: &Context) -> windlass_flow::Result<()> {
    let load_type: LoadType = args.load_type.parse()?;
    let stoptime: LogicalTime = args.stoptime.parse()?;

    let entry = admin::reset_failed(context.plane.as_ref(), &context.vault, load_type, stoptime)
        .await?;

    println!(
        "window {} reset to {} (epoch {})",
        entry.sort_key(),
        entry.status,
        entry.epoch
    );
    Ok(())
}
