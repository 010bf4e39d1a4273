//! sitecache - command line front end for the offline-first sync engine.
//!
//! Reads and writes go through the local cache; changes made while offline
//! are queued and replayed by `sitecache sync` or a running `sitecache watch`.

mod cli;
mod commands;
mod config;

use std::io;
use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};
use config::Config;

/// Log file prefix in the cache directory; rotated daily
const LOG_FILE: &str = "sitecache.log";

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g., RUST_LOG=sitecache_core=debug).
/// The returned guard flushes the log file when dropped.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let stored = Config::load()?;

    let log_dir = stored.cache_dir().ok();
    if let Some(ref dir) = log_dir {
        // Logging to stderr still works if this fails
        let _ = std::fs::create_dir_all(dir);
    }
    let _log_guard = init_tracing(log_dir.as_deref());
    info!("sitecache starting");

    if let Commands::Config { api_url, token } = cli.command {
        return commands::configure(stored, api_url, token);
    }

    let config = stored.with_env();
    let engine = commands::open_engine(&config, cli.offline).await?;
    let json = cli.json;

    match cli.command {
        Commands::Get { collection, id } => commands::get(&engine, &collection, &id, json).await?,
        Commands::List {
            collection,
            filters,
        } => commands::list(&engine, &collection, filters, json).await?,
        Commands::Create { collection, data } => {
            commands::create(&engine, &collection, &data, json).await?
        }
        Commands::Update {
            collection,
            id,
            patch,
        } => commands::update(&engine, &collection, &id, &patch, json).await?,
        Commands::Remove { collection, id } => commands::remove(&engine, &collection, &id).await?,
        Commands::Sync => commands::sync(&engine, json).await?,
        Commands::Status => commands::status(&engine, json).await?,
        Commands::Failed => commands::failed(&engine, json).await?,
        Commands::Retry { op_id } => commands::retry(&engine, op_id).await?,
        Commands::Discard { op_id } => commands::discard(&engine, op_id).await?,
        Commands::Resolve {
            collection,
            id,
            keep,
        } => commands::resolve(&engine, &collection, &id, keep.into(), json).await?,
        Commands::Watch => commands::watch(&engine, json).await?,
        Commands::Config { .. } => {}
    }

    info!("sitecache finished");
    Ok(())
}
