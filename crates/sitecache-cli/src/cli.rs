use clap::{Parser, Subcommand, ValueEnum};
use sitecache_core::Resolution;

#[derive(Parser)]
#[command(name = "sitecache", about = "Offline-first cache for a REST API of versioned records")]
#[command(version, author)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Work from the local cache only; writes stay queued
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show one record
    Get {
        /// Collection name, e.g. `batches`
        collection: String,
        /// Server id, or the `tmp-N` id of a record not yet synced
        id: String,
    },

    /// List a collection
    List {
        collection: String,
        /// Only records whose top-level field equals the value (repeatable)
        #[arg(long = "where", value_name = "FIELD=VALUE", value_parser = parse_field)]
        filters: Vec<(String, String)>,
    },

    /// Create a record from a JSON object
    Create {
        collection: String,
        /// JSON payload, e.g. '{"status":"poured"}'
        data: String,
    },

    /// Apply a JSON merge patch to a record
    Update {
        collection: String,
        id: String,
        /// JSON merge patch, e.g. '{"status":"approved"}'
        patch: String,
    },

    /// Delete a record
    Remove { collection: String, id: String },

    /// Replay queued changes and refresh the cache
    Sync,

    /// Show queue and connectivity state
    Status,

    /// List operations waiting for a retry or discard
    Failed,

    /// Put a failed operation back in the queue
    Retry { op_id: u64 },

    /// Drop a failed operation and roll its record back to server state
    Discard { op_id: u64 },

    /// Settle a record left in conflict
    Resolve {
        collection: String,
        id: String,
        /// Which side to keep
        #[arg(long, value_enum)]
        keep: Side,
    },

    /// Run background sync and print change events until Ctrl-C
    Watch,

    /// Show or change the stored configuration
    Config {
        /// Base URL of the API, e.g. https://api.example.com/v1/
        #[arg(long)]
        api_url: Option<String>,
        /// Bearer token sent with every request
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Side {
    Server,
    Local,
}

impl From<Side> for Resolution {
    fn from(side: Side) -> Self {
        match side {
            Side::Server => Resolution::KeepServer,
            Side::Local => Resolution::KeepLocal,
        }
    }
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((field, value)) if !field.is_empty() => Ok((field.to_string(), value.to_string())),
        _ => Err(format!("expected FIELD=VALUE, got `{}`", s)),
    }
}
