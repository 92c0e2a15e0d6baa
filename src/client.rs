//! Client handle
//!
//! The application-facing view of one connected client: identity, room
//! membership, and the operations that ask the broker to route messages.
//! Every request is enqueued onto the broker's bounded command channel, so
//! a full channel makes the calling task wait.

use std::collections::BTreeSet;

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::broker::{BrokerCommand, BrokerHandle};
use crate::error::BrokerError;
use crate::message::Message;
use crate::types::{ClientId, RoomId};

/// Connected client handle
///
/// Cheap to clone. The broker registry owns the client's state; a handle
/// only reads the membership the broker publishes for it.
#[derive(Debug, Clone)]
pub struct Client {
    id: ClientId,
    /// Membership published by the broker for this client
    rooms: watch::Receiver<BTreeSet<RoomId>>,
    /// Every live room id, published by the broker
    room_index: watch::Receiver<BTreeSet<RoomId>>,
    /// Room the next broadcast is narrowed to
    routing: Option<RoomId>,
    broker: BrokerHandle,
}

impl Client {
    pub(crate) fn new(
        id: ClientId,
        rooms: watch::Receiver<BTreeSet<RoomId>>,
        room_index: watch::Receiver<BTreeSet<RoomId>>,
        broker: BrokerHandle,
    ) -> Self {
        Self {
            id,
            rooms,
            room_index,
            routing: None,
            broker,
        }
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// The broker this client is registered with
    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Rooms this client currently belongs to
    pub fn list_rooms(&self) -> Vec<RoomId> {
        self.rooms.borrow().iter().cloned().collect()
    }

    /// Room override applied to broadcasts from this handle
    pub fn routing_context(&self) -> Option<&RoomId> {
        self.routing.as_ref()
    }

    /// Ask the broker to add this client to `room_id`, creating it if needed
    pub async fn join(&self, room_id: impl Into<RoomId>) -> Result<(), BrokerError> {
        self.broker
            .submit(BrokerCommand::Join {
                client_id: self.id.clone(),
                room_id: room_id.into(),
            })
            .await
    }

    /// Ask the broker to remove this client from `room_id`
    ///
    /// The personal room cannot be left.
    pub async fn leave(&self, room_id: impl Into<RoomId>) -> Result<(), BrokerError> {
        let room_id = room_id.into();
        if room_id.is_personal_to(&self.id) {
            return Err(BrokerError::SelfRoom(room_id));
        }

        self.broker
            .submit(BrokerCommand::Leave {
                client_id: self.id.clone(),
                room_id,
            })
            .await
    }

    /// Send a message to one client
    ///
    /// An unknown recipient is not an error; the message is dropped.
    pub async fn emit(&self, message: Message, recipient: &ClientId) -> Result<(), BrokerError> {
        let message = message.into_unicast(self.id.clone(), recipient.clone());
        self.broker.submit(BrokerCommand::Unicast { message }).await
    }

    /// Send a message to every member of the target rooms except this client
    ///
    /// Targets the routing context if set, otherwise every room that exists
    /// right now. To receive it as well, `emit` to yourself.
    pub async fn broadcast(&self, message: Message) -> Result<(), BrokerError> {
        let rooms = match &self.routing {
            Some(room_id) => vec![room_id.clone()],
            None => self.room_index.borrow().iter().cloned().collect(),
        };
        let message = message.into_broadcast(self.id.clone(), rooms);
        self.broker.submit(BrokerCommand::Broadcast { message }).await
    }

    /// A copy of this handle whose broadcasts go to `room_id` only
    ///
    /// ```ignore
    /// client.scoped_to("lobby").broadcast(msg).await?;
    /// ```
    pub fn scoped_to(&self, room_id: impl Into<RoomId>) -> Client {
        Client {
            routing: Some(room_id.into()),
            ..self.clone()
        }
    }

    /// Hand a received message to its listener
    ///
    /// Messages without a listener are dropped. If the content cannot be
    /// encoded for the listener, the error goes to the error listener.
    pub async fn dispatch(&self, message: Message) -> Result<(), BrokerError> {
        let Some(listener) = self.broker.listeners().message(message.name()) else {
            trace!("No listener for '{}', dropping message from {}", message.name(), self.id);
            return Ok(());
        };

        match message.serialize_payload() {
            Ok(payload) => {
                listener(self.clone(), payload).await;
                Ok(())
            }
            Err(e) => self.report(e).await,
        }
    }

    /// Forward an error to the broker's error listener
    pub async fn report(&self, error: BrokerError) -> Result<(), BrokerError> {
        self.broker.submit(BrokerCommand::Error { error }).await
    }

    /// Receive loop
    ///
    /// Dispatches each decoded message in turn. Errors are reported and the
    /// loop keeps listening; only the end of the stream stops it, at which
    /// point the broker is told this client disconnected.
    pub async fn listen<S>(self, incoming: S) -> Result<(), BrokerError>
    where
        S: Stream<Item = Result<Message, BrokerError>>,
    {
        let mut incoming = std::pin::pin!(incoming);

        while let Some(received) = incoming.next().await {
            match received {
                Ok(message) => self.dispatch(message).await?,
                Err(e) => {
                    debug!("Receive error for {}: {}", self.id, e);
                    self.report(e).await?;
                }
            }
        }

        debug!("Stream ended for {}", self.id);
        self.broker.disconnect(&self.id).await
    }
}
