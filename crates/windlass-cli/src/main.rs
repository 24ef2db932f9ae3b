//! windlass CLI - the main entry point for the `windlass` binary.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use windlass_cli::{Cli, Commands, Context, EXIT_FAILURE, EXIT_OK, exit_code_for};

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    std::process::exit(runtime.block_on(run(cli)));
}

async fn run(cli: Cli) -> i32 {
    let context = match Context::from_cli(&cli) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_FAILURE;
        }
    };

    let result = match cli.command {
        Commands::ResetFailed(args) => {
            windlass_cli::commands::reset_failed::execute(&args, &context).await
        }
        Commands::TriggerFull(args) => {
            windlass_cli::commands::trigger_full::execute(&args, &context).await
        }
        Commands::Status(args) => windlass_cli::commands::status::execute(&args, &context).await,
    };

    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for(&e)
        }
    }
}
