mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use deskpilot_road::{
    config::{Config, StoreBackend},
    router,
    storage::{InMemorySessionStore, RedisSessionStore},
    AppState, SharedStore,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::cli::{Cli, Commands};

fn init_tracing() {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Some(Commands::Watch { url, machine }) = cli.command {
        if let Err(e) = cli::run_watch_client(url, machine).await {
            error!("watch client error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(store) = cli.store {
        config.store = store;
    }
    info!(port = config.port, store = ?config.store, "starting deskpilot road");

    let store: SharedStore = match config.store {
        StoreBackend::Memory => InMemorySessionStore::new(),
        StoreBackend::Redis => {
            info!("Redis URL: {}", config.redis_url);
            match RedisSessionStore::connect(&config.redis_url, config.session_ttl_seconds).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    let state = AppState::new(
        store,
        Duration::from_secs(config.relay_idle_timeout_seconds),
    );
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("deskpilot road listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
