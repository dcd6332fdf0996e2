//! Broadcast WebSocket Chat Hub Library
//!
//! A WebSocket chat backend built with tokio-tungstenite using the Actor
//! pattern for state management.
//!
//! # Features
//! - Admission during the handshake (`?username=` or bearer token)
//! - Unique display names
//! - Broadcast chat with presence lists and join/leave notices
//! - Typing indicators and file references
//! - Message history from a pluggable store
//! - Keepalive pings, idle teardown and eviction of slow clients
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning the set of registered clients
//! - Each connection has a reader task and a writer task sharing a bounded
//!   outbound queue fed by the hub
//! - No locks around the registry - all changes go through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_hub::{ChatConfig, ChatServer, MemoryStore, UsernameAuthenticator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     let server = ChatServer::start(
//!         ChatConfig::default(),
//!         Arc::new(MemoryStore::new(1000)),
//!         Arc::new(UsernameAuthenticator),
//!     )?;
//!     server.run(listener).await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod handler;
pub mod hub;
pub mod keepalive;
pub mod message;
pub mod server;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use admission::{Authenticator, Claims, Identity, JwtAuthenticator, UsernameAuthenticator};
pub use client::{Client, ClientState};
pub use config::{ChatConfig, HubConfig};
pub use error::{AdmissionError, AppError, ConfigError, ProtocolError, SendError, StoreError};
pub use handler::handle_connection;
pub use hub::{Hub, HubCommand, HubHandle};
pub use keepalive::KeepalivePolicy;
pub use message::{Attachment, ClientMessage, ErrorCode, Message, MessageKind, Payload};
pub use server::ChatServer;
pub use store::{JsonFileStore, MemoryStore, MessageStore};
pub use types::{ClientId, Username};
