//! Chat Hub - Entry Point
//!
//! Loads configuration, starts the hub actor and accepts connections.

use std::env;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_hub::server::{authenticator_for, open_store};
use chat_hub::{ChatConfig, ChatServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_hub=info")),
        )
        .init();

    let mut config = ChatConfig::from_env()?;

    // Bind address from command line overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.bind_addr = addr;
    }

    let store = open_store(&config).await?;
    let authenticator = authenticator_for(&config);

    // Start TCP listener
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("WebSocket Chat Hub listening on {}", config.bind_addr);

    let server = ChatServer::start(config, store, authenticator)?;
    info!("Hub actor started");

    server.run(listener).await;
    Ok(())
}
