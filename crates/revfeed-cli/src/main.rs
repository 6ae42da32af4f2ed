use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use revfeed_sync::ConfigError;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 2;
const EXIT_FAILURE: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "revfeed-cli")]
#[command(about = "Collect app-store reviews into the raw_reviews table")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and upsert one pass of reviews.
    Collect {
        /// Fetch and normalize only; skip the upsert.
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Collect { dry_run: false }) {
        Commands::Collect { dry_run } => {
            let summary = revfeed_sync::run_collect_once_from_env(dry_run).await?;
            println!(
                "collect complete: run_id={} app_id={} fetched={} rows={} upserted={}",
                summary.run_id,
                summary.app_id,
                summary.fetched_reviews,
                summary.unique_rows,
                summary.upserted_rows
            );
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code_for(&err);
            if code == EXIT_CONFIG {
                tracing::error!(error = %err, "fatal: configuration error");
            } else {
                tracing::error!(error = format!("{err:#}"), "fatal: collect failed");
            }
            ExitCode::from(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_exit_code_two() {
        let err = anyhow::Error::from(ConfigError::MissingEndpoint);
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn other_errors_map_to_exit_code_one() {
        let err = anyhow::anyhow!("upsert rejected");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn collect_is_the_default_command() {
        let cli = Cli::parse_from(["revfeed-cli"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["revfeed-cli", "collect", "--dry-run"]);
        assert!(matches!(cli.command, Some(Commands::Collect { dry_run: true })));
    }
}
