//! Server wiring
//!
//! Builds the hub, the message store and the authenticator from a
//! `ChatConfig`, then runs the accept loop that spawns one handler per
//! connection.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::admission::{Authenticator, JwtAuthenticator, UsernameAuthenticator};
use crate::config::ChatConfig;
use crate::error::{AppError, StoreError};
use crate::handler::handle_connection;
use crate::hub::{Hub, HubHandle};
use crate::store::{JsonFileStore, MemoryStore, MessageStore};

/// A running hub plus everything a connection handler needs
pub struct ChatServer {
    hub: HubHandle,
    authenticator: Arc<dyn Authenticator>,
    config: Arc<ChatConfig>,
}

impl ChatServer {
    /// Validate the configuration and start the hub task
    pub fn start(
        config: ChatConfig,
        store: Arc<dyn MessageStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let (hub, handle) = Hub::new(config.hub.clone(), store);
        tokio::spawn(hub.run());

        Ok(Self {
            hub: handle,
            authenticator,
            config: Arc::new(config),
        })
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Connection accept loop
    ///
    /// Runs until the listener fails fatally; per-connection errors are
    /// logged and never stop the loop.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let hub = self.hub.clone();
                    let authenticator = Arc::clone(&self.authenticator);
                    let config = Arc::clone(&self.config);

                    // Spawn handler task for each connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, hub, authenticator, config).await
                        {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// File-backed store when a path is configured, in-memory otherwise
pub async fn open_store(config: &ChatConfig) -> Result<Arc<dyn MessageStore>, StoreError> {
    match &config.store_path {
        Some(path) => {
            let store = JsonFileStore::open(path, config.store_retain).await?;
            info!("Persisting messages to {}", store.path().display());
            Ok(Arc::new(store))
        }
        None => {
            info!("Keeping up to {} messages in memory", config.store_retain);
            Ok(Arc::new(MemoryStore::new(config.store_retain)))
        }
    }
}

/// Bearer tokens when a secret is configured, `?username=` otherwise
pub fn authenticator_for(config: &ChatConfig) -> Arc<dyn Authenticator> {
    match &config.jwt_secret {
        Some(secret) => {
            info!("Admitting connections with bearer tokens");
            Arc::new(JwtAuthenticator::new(secret.as_bytes()))
        }
        None => Arc::new(UsernameAuthenticator),
    }
}
