//! Cutover: in-place migration of a log cluster onto data nodes
//!
//! Main binary with subcommands:
//! - `serve`: Run the migration server (trigger protocol over HTTP)
//! - `steps`: Print the step catalog
//! - `inspect`: Print persisted migration records

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cutover_engine::{FileStore, MigrationStore, catalog};

mod serve;

#[derive(Parser)]
#[command(name = "cutover")]
#[command(about = "In-place data node migration orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration server
    Serve {
        /// HTTP server port
        #[arg(long, env = "CUTOVER_PORT", default_value = "8780")]
        port: u16,

        /// Directory holding one JSON record per migration
        #[arg(long, env = "CUTOVER_DATA_DIR", default_value = "./migrations")]
        data_dir: PathBuf,

        /// Base URL of the compatibility checker
        #[arg(long, env = "CUTOVER_COMPATIBILITY_URL")]
        compatibility_url: String,

        /// Base URL of the certificate provisioning backend.
        /// Without it, node status only arrives through the push callback.
        #[arg(long, env = "CUTOVER_PROVISIONING_URL")]
        provisioning_url: Option<String>,

        /// Base URL of the cluster's message-processing control API
        #[arg(long, env = "CUTOVER_PROCESSING_URL")]
        processing_url: String,

        /// Certificate status poll interval in seconds
        #[arg(long, env = "CUTOVER_POLL_INTERVAL", default_value = "5")]
        poll_interval: u64,

        /// Failed provisioning attempts per node before giving up
        #[arg(long, env = "CUTOVER_MAX_ATTEMPTS", default_value = "3")]
        max_attempts: u32,

        /// Timeout for collaborator requests in seconds
        #[arg(long, env = "CUTOVER_CHECK_TIMEOUT", default_value = "30")]
        check_timeout: u64,
    },

    /// Print the step catalog as JSON
    Steps,

    /// Print persisted migration records as JSON
    Inspect {
        /// Directory holding one JSON record per migration
        #[arg(long, env = "CUTOVER_DATA_DIR", default_value = "./migrations")]
        data_dir: PathBuf,

        /// Only print this migration
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "cutover=info,cutover_engine=info,cutover_web=info".to_string()
            }),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            data_dir,
            compatibility_url,
            provisioning_url,
            processing_url,
            poll_interval,
            max_attempts,
            check_timeout,
        } => {
            serve::run(serve::ServeOptions {
                port,
                data_dir,
                compatibility_url,
                provisioning_url,
                processing_url,
                poll_interval,
                max_attempts,
                check_timeout,
            })
            .await
        }

        Commands::Steps => {
            let json = serde_json::to_string_pretty(&catalog())
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{}", json);
            Ok(())
        }

        Commands::Inspect { data_dir, id } => inspect(data_dir, id).await,
    }
}

async fn inspect(data_dir: PathBuf, id: Option<String>) -> Result<()> {
    let store = FileStore::open(data_dir)
        .await
        .map_err(|e| miette::miette!("failed to open store: {}", e))?;

    let ids = match id {
        Some(id) => vec![id],
        None => store
            .list_ids()
            .await
            .map_err(|e| miette::miette!("{}", e))?,
    };

    for id in ids {
        let state = store
            .load(&id)
            .await
            .map_err(|e| miette::miette!("failed to load {}: {}", id, e))?
            .ok_or_else(|| miette::miette!("migration not found: {}", id))?;
        let json = serde_json::to_string_pretty(&state).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", json);
    }
    Ok(())
}
