//! `opsync`: admin surface for the local operation queue store (spec §6.4).
//! Operates directly on the on-disk `sled` store; it does not talk to a
//! running engine process, so it is safe to run alongside the app (every
//! operation here goes through the same `PersistentMap`/`Queue` types the
//! engine uses, and inherits their atomicity).

mod commands;
mod error;

use clap::{Parser, Subcommand};
use error::CliError;
use opsync_kvstore::SledPersistentMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "opsync")]
#[command(about = "Admin CLI for the offline-first operation sync queue", long_about = None)]
struct Cli {
    /// Directory holding the sled store. Defaults to $OPSYNC_DATA_DIR, or
    /// ./opsync-data if unset.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump queue depth, oldest op age, breaker state, and lock holder.
    Inspect,
    /// Reconstruct index/* from pending/*.
    RebuildIndex,
    /// Move one or all archived ops back to pending.
    RetryFailed {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        all: bool,
        /// Short-lived confirmation token; run without it to see the expected value.
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Permanently delete every archived op. Destructive.
    PurgeFailed {
        #[arg(long)]
        confirm: Option<String>,
    },
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap-detected usage errors (bad flags, missing args) are
            // exactly spec §6.4's "64 usage error" — before we ever open the
            // store.
            err.print().ok();
            std::process::exit(64);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            std::process::exit(70);
        }
    };

    let exit_code = runtime.block_on(run(cli));
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> i32 {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        std::env::var("OPSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./opsync-data"))
    });
    std::fs::create_dir_all(&data_dir)
        .map_err(|e| CliError::Internal(anyhow::anyhow!("failed to create {}: {e}", data_dir.display())))?;
    let map = Arc::new(SledPersistentMap::open(&data_dir)?);

    match cli.cmd {
        Commands::Inspect => commands::inspect(map).await,
        Commands::RebuildIndex => commands::rebuild_index(map).await,
        Commands::RetryFailed { id, all, confirm } => commands::retry_failed(map, id, all, confirm).await,
        Commands::PurgeFailed { confirm } => commands::purge_failed(map, confirm).await,
    }
}
