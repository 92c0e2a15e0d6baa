//! Room-based WebSocket Message Broker Library
//!
//! A real-time message broker built with tokio-tungstenite using the Actor
//! pattern for state management.
//!
//! # Features
//! - WebSocket connection handling
//! - Named rooms, created on first join and removed when empty
//! - A personal room per client, named after the client id
//! - Unicast (`emit`) and room broadcast with per-recipient dedup
//! - Listeners for named messages and for connect/disconnect/error events
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Broker` is the central actor owning the client and room registries
//! - Each connection runs a receive loop that submits requests to the broker
//! - No locks on the registries - all mutation goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use room_broker::{serve, Broker, BrokerConfig, Message};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let (broker, handle) = Broker::new(BrokerConfig::default());
//!
//!     handle.on("message", |client, _payload| async move {
//!         let id = client.id().clone();
//!         let _ = client.emit(Message::new("message", "Welcome!"), &id).await;
//!     });
//!
//!     tokio::spawn(broker.run());
//!     serve(listener, handle).await;
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod message;
pub mod room;
pub mod types;

// Re-export main types for convenience
pub use broker::{Broker, BrokerHandle, ClientInfo, RoomInfo};
pub use client::Client;
pub use config::BrokerConfig;
pub use error::{BrokerError, SendError};
pub use handler::{handle_connection, serve};
pub use listener::Listeners;
pub use message::{Content, Message, Route};
pub use room::Room;
pub use types::{ClientId, RoomId};
