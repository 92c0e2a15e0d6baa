//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, the outbound
//! writer task, and turning inbound frames into messages for the client's
//! receive loop.

use futures_util::{future, stream, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error, info};

use crate::broker::BrokerHandle;
use crate::error::BrokerError;
use crate::message::Message;

/// Accept connections until the broker stops
///
/// Each connection gets its own task running [`handle_connection`].
pub async fn serve(listener: TcpListener, broker: BrokerHandle) {
    loop {
        tokio::select! {
            _ = broker.closed() => {
                info!("Broker closed, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let broker = broker.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, broker).await {
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

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, registers the client with the broker
/// and runs its receive loop until the stream ends.
pub async fn handle_connection(stream: TcpStream, broker: BrokerHandle) -> Result<(), BrokerError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, ws_receiver) = ws_stream.split();

    // Broker -> client frames
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(broker.config().outbound_buffer);

    let client = broker.connect(frame_tx).await?;
    let client_id = client.id().clone();
    info!("Client {} connected from {}", client_id, peer_addr);

    // Ends when the broker drops the client's registry entry
    let write_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sender.send(WsMessage::Text(frame.into())).await.is_err() {
                debug!("WebSocket send failed, ending write task");
                break;
            }
        }
        debug!("Write task ended for client");

        // Send close frame when done
        let _ = ws_sender.close().await;
    });

    let result = client.listen(inbound(ws_receiver)).await;

    if let Err(e) = write_task.await {
        error!("Write task for {} failed: {}", client_id, e);
    }
    info!("Client {} disconnected", client_id);

    result
}

/// What a single WebSocket frame means for the receive loop
enum Inbound {
    Received(Result<Message, BrokerError>),
    Closed,
}

/// Decode WebSocket frames into messages, ending at close or a dead socket
///
/// A transport error that kills the socket is yielded before the stream ends.
fn inbound<S>(frames: S) -> impl Stream<Item = Result<Message, BrokerError>>
where
    S: Stream<Item = Result<WsMessage, WsError>>,
{
    frames
        .flat_map(|frame| stream::iter(classify(frame)))
        .take_while(|step| future::ready(!matches!(step, Inbound::Closed)))
        .filter_map(|step| {
            future::ready(match step {
                Inbound::Received(received) => Some(received),
                Inbound::Closed => None,
            })
        })
}

fn classify(frame: Result<WsMessage, WsError>) -> Vec<Inbound> {
    match frame {
        Ok(WsMessage::Text(text)) => vec![Inbound::Received(Message::from_frame(text.as_bytes()))],
        Ok(WsMessage::Binary(data)) => vec![Inbound::Received(Message::from_frame(&data))],
        Ok(WsMessage::Close(_)) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
            vec![Inbound::Closed]
        }
        // Ping/Pong - pong is handled automatically by tungstenite
        Ok(_) => Vec::new(),
        Err(e @ (WsError::Io(_) | WsError::Protocol(_))) => {
            vec![Inbound::Received(Err(e.into())), Inbound::Closed]
        }
        Err(e) => vec![Inbound::Received(Err(e.into()))],
    }
}
