use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use beacon_server::ServerConfig;
use beacon_store::Database;

#[derive(Parser, Debug)]
#[command(name = "beacond", about = "Task status broadcast daemon")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 9070)]
    port: u16,

    /// Path to the SQLite database (defaults to ~/.beacon/database/beacon.db)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,

    /// Latest-state cache TTL in seconds
    #[arg(long, default_value_t = 1800)]
    cache_ttl_secs: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting beacon daemon");

    let db_path = args.db_path.unwrap_or_else(|| {
        dirs_home()
            .join(".beacon")
            .join("database")
            .join("beacon.db")
    });
    let db = Database::open(&db_path).expect("Failed to open database");

    let config = ServerConfig {
        port: args.port,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        cache_ttl: Duration::from_secs(args.cache_ttl_secs),
        ..Default::default()
    };
    let handle = beacon_server::start(config, db)
        .await
        .expect("Failed to start server");

    tracing::info!(port = handle.port, "beacon ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    let closed = handle.registry.close_all();
    tracing::info!(sessions = closed, "Shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
