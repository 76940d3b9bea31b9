use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use secrecy::SecretString;

use parley_enrich::{EnrichConfig, EnrichmentService, HttpBackend};
use parley_store::Database;

/// Real-time messaging server with in-flight text enrichment.
#[derive(Parser, Debug)]
#[command(name = "parley", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Path to the SQLite database. Defaults to ~/.parley/parley.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Base URL of the hosted inference API.
    #[arg(long, default_value = parley_enrich::backend::DEFAULT_BASE_URL)]
    inference_url: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("starting parley server");

    let db_path = args
        .db
        .unwrap_or_else(|| dirs_home().join(".parley").join("parley.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    // The inference token stays wrapped in SecretString and never hits
    // the logs. Without one the coordinator leans on its fallbacks.
    let token = std::env::var("PARLEY_INFERENCE_TOKEN")
        .ok()
        .map(SecretString::from);
    if token.is_none() {
        tracing::warn!("PARLEY_INFERENCE_TOKEN not set, enrichment will rely on fallbacks");
    }

    let backend = Arc::new(HttpBackend::new(args.inference_url, token));
    let enrich = Arc::new(EnrichmentService::new(backend, EnrichConfig::default()));

    let config = parley_server::ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = parley_server::start(config, db, enrich)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "parley server ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
