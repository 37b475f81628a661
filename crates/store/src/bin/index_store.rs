//! Index store command-line tool.
//!
//! Sets up databases, applies files of index messages and runs reindex
//! sweeps against a SQLite store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use helios_index_store::backends::sqlite::SqliteBackend;
use helios_index_store::search::ReindexSweep;
use helios_index_store::{
    IndexMessageConsumer, ResourceStorage, StoreConfig, TenantId, WriteRequest,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "index-store")]
#[command(about = "Versioned resource store and search index maintenance")]
struct Cli {
    /// SQLite database file, or ":memory:".
    #[arg(long, env = "INDEX_STORE_DATABASE", default_value = "store.db")]
    database: String,

    /// JSON store configuration file.
    #[arg(long, env = "INDEX_STORE_CONFIG")]
    config: Option<PathBuf>,

    /// Tenant served by this store. Overrides the configuration file.
    #[arg(long, env = "INDEX_STORE_TENANT")]
    tenant: Option<String>,

    /// Log level.
    #[arg(long, env = "INDEX_STORE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates the schema and exits.
    Init,

    /// Applies a file of index messages, one JSON message per line.
    Ingest {
        /// Message file.
        #[arg(long)]
        file: PathBuf,

        /// Messages per transaction.
        #[arg(long, default_value = "100")]
        batch_size: usize,
    },

    /// Rebuilds parameter rows of resources not reindexed since the cutoff.
    Reindex {
        /// Concurrent workers.
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Replace rows even when their hash is unchanged.
        #[arg(long)]
        force: bool,

        /// RFC 3339 cutoff. Defaults to now.
        #[arg(long)]
        cutoff: Option<DateTime<Utc>>,
    },

    /// Writes one resource from a JSON file.
    Write {
        /// Resource type.
        #[arg(long = "type")]
        resource_type: String,

        /// Logical id.
        #[arg(long)]
        id: String,

        /// Resource JSON file.
        #[arg(long)]
        file: PathBuf,
    },
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("helios_index_store={},index_store={}", level, level)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            StoreConfig::from_json_str(&raw)?
        }
        None => StoreConfig::default(),
    };
    if let Some(tenant) = &cli.tenant {
        config = config.with_tenant(TenantId::new(tenant.as_str()));
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(&cli)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    info!(database = %cli.database, tenant = %config.tenant_id, "Opening store");
    let backend = Arc::new(SqliteBackend::with_config(&cli.database, config)?);

    match cli.command {
        Command::Init => {
            info!("Schema ready");
        }
        Command::Ingest { file, batch_size } => {
            ingest(&backend, &file, batch_size.max(1)).await?;
        }
        Command::Reindex {
            workers,
            force,
            cutoff,
        } => {
            let progress = ReindexSweep::new(cutoff.unwrap_or_else(Utc::now))
                .with_workers(workers)
                .with_force(force)
                .run(backend.clone())
                .await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Command::Write {
            resource_type,
            id,
            file,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&raw)?;
            let outcome = backend
                .write(WriteRequest::upsert(resource_type, id, payload))
                .await?;
            println!(
                "{} {:?} ({} parameter rows)",
                outcome.version.versioned_url(),
                outcome.disposition,
                outcome.parameter_rows
            );
        }
    }

    Ok(())
}

async fn ingest(backend: &SqliteBackend, file: &Path, batch_size: usize) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let messages: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();

    let mut accepted = 0;
    let mut dropped = 0;
    let mut stale = 0;
    let mut deferred = Vec::new();
    for batch in messages.chunks(batch_size) {
        let report = backend.process_batch(batch.to_vec()).await?;
        accepted += report.accepted;
        dropped += report.dropped;
        stale += report.stale;
        deferred.extend(report.deferred);
    }

    if !deferred.is_empty() {
        warn!(count = deferred.len(), "Messages for uncommitted versions were not applied");
    }
    println!(
        "accepted {}, dropped {}, stale {}, deferred {}",
        accepted,
        dropped,
        stale,
        deferred.len()
    );
    Ok(())
}
