//! Room Broker Demo Server - Entry Point
//!
//! Starts the TCP listener and Broker actor, wires a small set of demo
//! listeners, and accepts connections until Ctrl-C.
//!
//! Messages understood by the demo:
//! - `message`: echoed back to the sender
//! - `join` / `leave`: content is a room id string
//! - `say`: `{"room": "...", "text": "..."}` broadcast to `room`, or to
//!   every room when `room` is omitted

use std::env;

use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use room_broker::{serve, Broker, BrokerConfig, BrokerError, BrokerHandle, Message};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Deserialize)]
struct SayRequest {
    room: Option<String>,
    text: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=room_broker=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("room_broker=info")),
        )
        .init();

    // Get bind address from command line or use default
    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    // Start TCP listener
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket Broker listening on {}", addr);

    let (broker, handle) = Broker::new(BrokerConfig::default());
    register_listeners(&handle);
    let broker_task = tokio::spawn(broker.run());

    info!("Broker actor started");

    tokio::select! {
        _ = serve(listener, handle.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            let _ = handle.shutdown().await;
        }
    }

    if let Err(e) = broker_task.await? {
        error!("Broker failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn register_listeners(broker: &BrokerHandle) {
    broker.on_connect(|client| info!("Client {} has connected", client.id()));

    broker.on_disconnect(|client| {
        info!(
            "Client {} has disconnected from {} room(s)",
            client.id(),
            client.list_rooms().len()
        );
    });

    broker.on_error(|err| warn!("Error: {}", err));

    broker.on("message", |client, payload| async move {
        let id = client.id().clone();
        if let Err(e) = client.emit(Message::new("message", payload), &id).await {
            error!("Echo to {} failed: {}", id, e);
        }
    });

    broker.on("join", |client, payload| async move {
        let result = match serde_json::from_slice::<String>(&payload) {
            Ok(room) => client.join(room).await,
            Err(e) => client.report(BrokerError::Decoding(e)).await,
        };
        if let Err(e) = result {
            error!("Join for {} failed: {}", client.id(), e);
        }
    });

    broker.on("leave", |client, payload| async move {
        let result = match serde_json::from_slice::<String>(&payload) {
            Ok(room) => client.leave(room).await,
            Err(e) => client.report(BrokerError::Decoding(e)).await,
        };
        if let Err(e) = result {
            warn!("Leave for {} failed: {}", client.id(), e);
        }
    });

    broker.on("say", |client, payload| async move {
        let request = match serde_json::from_slice::<SayRequest>(&payload) {
            Ok(request) => request,
            Err(e) => {
                let _ = client.report(BrokerError::Decoding(e)).await;
                return;
            }
        };

        let message = Message::new("say", request.text);
        let result = match request.room {
            Some(room) => client.scoped_to(room).broadcast(message).await,
            None => client.broadcast(message).await,
        };
        if let Err(e) = result {
            error!("Broadcast from {} failed: {}", client.id(), e);
        }
    });
}
