//! Status command - show vault state and recent queue entries.

use clap::Args;

use windlass_core::queue::ControlPlane;
use windlass_core::types::LoadType;

use crate::Context;

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Entries to show per load type.
    #[arg(long, default_value = "10")]
    pub limit: usize,
}

/// Executes the status command.
///
/// # Errors
///
/// Exit code 3 on transient store errors.
pub async fn execute(args: &StatusArgs, context: &Context) -> windlass_flow::Result<()> {
    let Some(state) = context.plane.get_vault_state(&context.vault).await? else {
        println!("vault {} has no state yet", context.vault);
        return Ok(());
    };

    println!("vault {}", state.vault_id);
    println!("  mode:       {:?}", state.mode);
    println!("  epoch:      {}", state.current_epoch);
    println!(
        "  watermark:  {}",
        state
            .last_applied_stoptime
            .map_or_else(|| "-".to_string(), |t| t.to_string())
    );
    println!(
        "  log mark:   {}",
        state
            .last_applied_log_date
            .map_or_else(|| "-".to_string(), |t| t.to_string())
    );
    for (scope, lease) in &state.leases {
        let status = if lease.is_expired() { "expired" } else { "live" };
        println!("  lease[{scope}]: {} ({status})", lease.owner);
    }

    for load_type in [LoadType::Incr, LoadType::Log, LoadType::Full] {
        let entries = context
            .plane
            .scan_forward(&context.vault, load_type, None, args.limit)
            .await?;
        if entries.is_empty() {
            continue;
        }
        println!();
        println!("{load_type} queue:");
        for entry in entries {
            println!(
                "  {} {} epoch={} attempts={}{}",
                entry.logical_time,
                entry.status,
                entry.epoch,
                entry.attempt_count,
                entry
                    .last_error
                    .as_deref()
                    .map(|e| format!(" error={e}"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}
