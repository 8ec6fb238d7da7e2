use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use jobetl_core::{EtlRun, RunStatus};
use jobetl_sync::{EtlConfig, RunOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobetl")]
#[command(about = "Load USAJobs search results into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extract/load pass (the default).
    Sync(SyncArgs),
    /// Apply pending schema migrations.
    Migrate,
    /// Show the most recent ETL runs.
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Write to in-memory stores instead of the database.
    #[arg(long)]
    dry_run: bool,
    /// Serve search results from a recorded response file.
    #[arg(long)]
    fixture: Option<PathBuf>,
    #[arg(long)]
    max_pages: Option<u32>,
}

fn init_tracing(config: &EtlConfig) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},sqlx=warn", config.log_directive()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_run(run: &EtlRun) {
    println!(
        "run {} {}: processed={} inserted={} updated={} failed={}",
        run.run_id,
        run.status,
        run.counters.records_processed,
        run.counters.records_inserted,
        run.counters.records_updated,
        run.counters.records_failed,
    );
    if let Some(message) = &run.error_message {
        println!("  error: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EtlConfig::from_env()?;
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let run = jobetl_sync::run_etl(
                config,
                RunOptions {
                    dry_run: args.dry_run,
                    fixture: args.fixture,
                    max_pages: args.max_pages,
                },
            )
            .await?;
            print_run(&run);
            if run.status == RunStatus::Failed {
                bail!("etl run {} failed", run.run_id);
            }
        }
        Commands::Migrate => {
            jobetl_sync::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Runs { limit } => {
            for run in jobetl_sync::recent_runs(&config, limit).await? {
                print_run(&run);
            }
        }
    }

    Ok(())
}
