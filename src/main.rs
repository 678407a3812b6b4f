use std::sync::Arc;
use tracing::info;

use agora::{bus::Relay, config::Config, http, manager::Manager, store::Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Agora chat service starting...");

    let config = Config::from_env()?;

    info!("Initializing store at {}", config.db_path.display());
    let store = Store::new(&config.db_path).await?;
    store.init().await?;

    let relay = Arc::new(Relay::new(config.channel_capacity));
    let manager = Arc::new(Manager::new(store, relay));
    let app = http::router(manager);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!("Listening on {}", listener.local_addr()?);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = axum::serve(listener, app) => {
            if let Err(e) = res {
                info!("Server stopped with error: {}", e);
            }
        }
    }

    Ok(())
}
