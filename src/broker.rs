//! Broker actor implementation
//!
//! The central actor that owns all shared state: the client registry and the
//! room registry. Uses the Actor pattern with an mpsc channel; every registry
//! read and write happens on the broker task, one command at a time.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, SendError};
use crate::listener::Listeners;
use crate::message::Message;
use crate::room::Room;
use crate::types::{ClientId, RoomId};

/// Commands sent from client handles to the broker actor
#[derive(Debug)]
pub(crate) enum BrokerCommand {
    /// New transport accepted; the broker assigns the identity
    Connect {
        outbound: mpsc::Sender<String>,
        reply: oneshot::Sender<Client>,
    },
    /// Stream ended or explicit teardown
    Disconnect { client_id: ClientId },
    /// Add a client to a room
    Join { client_id: ClientId, room_id: RoomId },
    /// Remove a client from a room
    Leave { client_id: ClientId, room_id: RoomId },
    /// Route a message to its recipient
    Unicast { message: Message },
    /// Route a message to its target rooms
    Broadcast { message: Message },
    /// Forward an error to the error listener
    Error { error: BrokerError },
    /// Read the registries
    Query(Query),
    /// Stop the broker loop
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Query {
    Client {
        client_id: ClientId,
        reply: oneshot::Sender<Option<ClientInfo>>,
    },
    Clients {
        reply: oneshot::Sender<Vec<ClientId>>,
    },
    Room {
        room_id: RoomId,
        reply: oneshot::Sender<Option<RoomInfo>>,
    },
    Rooms {
        reply: oneshot::Sender<Vec<RoomId>>,
    },
}

/// Snapshot of a registered client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ClientId,
    pub rooms: Vec<RoomId>,
}

/// Snapshot of a live room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub members: Vec<ClientId>,
}

/// Registry entry for a connected client
#[derive(Debug)]
struct ClientEntry {
    /// Rooms the client belongs to, published to its handles
    rooms: watch::Sender<BTreeSet<RoomId>>,
    /// Broker -> connection frame queue
    outbound: mpsc::Sender<String>,
}

impl ClientEntry {
    fn new(outbound: mpsc::Sender<String>) -> Self {
        let (rooms, _) = watch::channel(BTreeSet::new());
        Self { rooms, outbound }
    }

    /// Queue a frame without waiting
    fn send(&self, frame: String) -> Result<(), SendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }

    fn room_list(&self) -> Vec<RoomId> {
        self.rooms.borrow().iter().cloned().collect()
    }
}

/// The broker actor
///
/// Sole owner of the client and room registries. Runs until
/// [`BrokerHandle::shutdown`] is called or a registry invariant breaks.
pub struct Broker {
    /// All connected clients: ClientId -> ClientEntry
    clients: HashMap<ClientId, ClientEntry>,
    /// All live rooms: RoomId -> Room
    rooms: HashMap<RoomId, Room>,
    /// Live room ids, published for unscoped broadcasts
    room_index: watch::Sender<BTreeSet<RoomId>>,
    /// Minted into every client handle
    handle: BrokerHandle,
    /// Command receiver channel
    receiver: mpsc::Receiver<BrokerCommand>,
}

impl Broker {
    /// Create a broker and the handle used to reach it
    pub fn new(config: BrokerConfig) -> (Self, BrokerHandle) {
        let (commands, receiver) = mpsc::channel(config.command_buffer);
        let (room_index, _) = watch::channel(BTreeSet::new());
        let handle = BrokerHandle {
            commands,
            listeners: Arc::new(Listeners::new()),
            config,
        };

        let broker = Self {
            clients: HashMap::new(),
            rooms: HashMap::new(),
            room_index,
            handle: handle.clone(),
            receiver,
        };
        (broker, handle)
    }

    /// Run the broker event loop
    ///
    /// Per-message failures never end the loop. A broken registry invariant
    /// does, and is returned as [`BrokerError::Invariant`].
    pub async fn run(mut self) -> Result<(), BrokerError> {
        info!("Broker started");

        while let Some(cmd) = self.receiver.recv().await {
            match self.handle_command(cmd) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    error!("Broker stopped: {}", e);
                    return Err(e);
                }
            }
        }

        info!("Broker shutting down");
        Ok(())
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: BrokerCommand) -> Result<ControlFlow<()>, BrokerError> {
        match cmd {
            BrokerCommand::Connect { outbound, reply } => self.handle_connect(outbound, reply)?,
            BrokerCommand::Disconnect { client_id } => self.handle_disconnect(&client_id)?,
            BrokerCommand::Join { client_id, room_id } => self.join_room(&client_id, room_id)?,
            BrokerCommand::Leave { client_id, room_id } => self.leave_room(&client_id, &room_id)?,
            BrokerCommand::Unicast { message } => self.handle_unicast(message),
            BrokerCommand::Broadcast { message } => self.handle_broadcast(message)?,
            BrokerCommand::Error { error } => self.report(error),
            BrokerCommand::Query(query) => self.handle_query(query),
            BrokerCommand::Shutdown => return Ok(ControlFlow::Break(())),
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Handle new client connection
    ///
    /// The connect listener sees the client registered and already in its
    /// personal room.
    fn handle_connect(
        &mut self,
        outbound: mpsc::Sender<String>,
        reply: oneshot::Sender<Client>,
    ) -> Result<(), BrokerError> {
        let client_id = loop {
            let id = ClientId::new();
            if !self.clients.contains_key(&id) && !self.rooms.contains_key(id.as_str()) {
                break id;
            }
        };

        self.clients
            .insert(client_id.clone(), ClientEntry::new(outbound));
        self.join_room(&client_id, RoomId::personal(&client_id))?;
        info!("Client {} connected", client_id);

        let client = self.client_handle(&client_id)?;
        self.handle.listeners.notify_connect(&client);

        if reply.send(client).is_err() {
            debug!("Connection for {} went away before registration finished", client_id);
            self.handle_disconnect(&client_id)?;
        }

        debug!(
            "Total clients: {}, Total rooms: {}",
            self.clients.len(),
            self.rooms.len()
        );
        Ok(())
    }

    /// Handle client disconnection
    ///
    /// The disconnect listener runs before any state is removed. Personal
    /// rooms are collected like any other room once empty.
    fn handle_disconnect(&mut self, client_id: &ClientId) -> Result<(), BrokerError> {
        if !self.clients.contains_key(client_id) {
            debug!("Disconnect for unknown client {}", client_id);
            return Ok(());
        }

        let client = self.client_handle(client_id)?;
        self.handle.listeners.notify_disconnect(&client);

        for room_id in client.list_rooms() {
            self.leave_room(client_id, &room_id)?;
        }
        self.clients.remove(client_id);

        info!("Client {} disconnected", client_id);
        debug!(
            "Total clients: {}, Total rooms: {}",
            self.clients.len(),
            self.rooms.len()
        );
        Ok(())
    }

    /// Add a client to a room, creating the room if needed
    fn join_room(&mut self, client_id: &ClientId, room_id: RoomId) -> Result<(), BrokerError> {
        let Some(entry) = self.clients.get(client_id) else {
            debug!("Join from unknown client {} ignored", client_id);
            return Ok(());
        };

        let room = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                self.room_index.send_modify(|index| {
                    index.insert(room_id.clone());
                });
                debug!("Room {} created", room_id);
                vacant.insert(Room::new(room_id.clone()))
            }
        };

        let added_to_room = room.add_member(client_id.clone());
        let added_to_client = entry
            .rooms
            .send_if_modified(|rooms| rooms.insert(room_id.clone()));

        if added_to_room != added_to_client {
            return Err(BrokerError::Invariant(format!(
                "membership of {} in room {} is out of sync",
                client_id, room_id
            )));
        }
        if added_to_room {
            debug!("Client {} joined room {}", client_id, room_id);
        }
        Ok(())
    }

    /// Remove a client from a room, deleting the room once empty
    fn leave_room(&mut self, client_id: &ClientId, room_id: &RoomId) -> Result<(), BrokerError> {
        let Some(entry) = self.clients.get(client_id) else {
            debug!("Leave from unknown client {} ignored", client_id);
            return Ok(());
        };

        let was_member = entry.rooms.send_if_modified(|rooms| rooms.remove(room_id));

        let Some(room) = self.rooms.get_mut(room_id) else {
            if was_member {
                return Err(BrokerError::Invariant(format!(
                    "client {} belonged to missing room {}",
                    client_id, room_id
                )));
            }
            debug!("Client {} left unknown room {}", client_id, room_id);
            return Ok(());
        };

        if room.has_member(client_id) != was_member {
            return Err(BrokerError::Invariant(format!(
                "membership of {} in room {} is out of sync",
                client_id, room_id
            )));
        }
        if !was_member {
            debug!("Client {} is not in room {}", client_id, room_id);
            return Ok(());
        }

        let should_delete = room.remove_member(client_id);
        debug!("Client {} left room {}", client_id, room_id);

        if should_delete {
            self.rooms.remove(room_id);
            self.room_index.send_modify(|index| {
                index.remove(room_id);
            });
            debug!("Room {} deleted (empty)", room_id);
        }
        Ok(())
    }

    /// Handle a unicast message
    ///
    /// Unknown recipients are dropped silently.
    fn handle_unicast(&self, message: Message) {
        if !self.sender_registered(&message) {
            return;
        }
        let Some(recipient) = message.recipient() else {
            warn!("Unicast message '{}' has no recipient", message.name());
            return;
        };

        let Some(entry) = self.clients.get(recipient) else {
            debug!(
                "Recipient {} not connected, dropping '{}'",
                recipient,
                message.name()
            );
            return;
        };

        match message.to_frame() {
            Ok(frame) => deliver(recipient, entry, frame),
            Err(e) => self.report(e),
        }
    }

    /// Handle a broadcast message
    ///
    /// Each distinct member of the target rooms gets the message once; the
    /// sender never does.
    fn handle_broadcast(&self, message: Message) -> Result<(), BrokerError> {
        if !self.sender_registered(&message) {
            return Ok(());
        }
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.report(e);
                return Ok(());
            }
        };

        let mut delivered: HashSet<&ClientId> = HashSet::new();
        if let Some(sender) = message.sender() {
            delivered.insert(sender);
        }

        for room_id in message.target_rooms() {
            let Some(room) = self.rooms.get(room_id) else {
                debug!("Broadcast target room {} does not exist", room_id);
                continue;
            };

            for member in room.members() {
                if !delivered.insert(member) {
                    continue;
                }
                let entry = self.clients.get(member).ok_or_else(|| {
                    BrokerError::Invariant(format!(
                        "room {} lists unregistered client {}",
                        room_id, member
                    ))
                })?;
                deliver(member, entry, frame.clone());
            }
        }

        debug!(
            "Broadcast '{}' delivered to {} client(s)",
            message.name(),
            delivered.len() - usize::from(message.sender().is_some())
        );
        Ok(())
    }

    /// Messages routed by a client that has since disconnected are dropped
    fn sender_registered(&self, message: &Message) -> bool {
        match message.sender() {
            Some(sender) if !self.clients.contains_key(sender) => {
                debug!(
                    "Sender {} no longer connected, dropping '{}'",
                    sender,
                    message.name()
                );
                false
            }
            _ => true,
        }
    }

    /// Answer a registry query
    fn handle_query(&self, query: Query) {
        match query {
            Query::Client { client_id, reply } => {
                let info = self.clients.get(&client_id).map(|entry| ClientInfo {
                    id: client_id.clone(),
                    rooms: entry.room_list(),
                });
                let _ = reply.send(info);
            }
            Query::Clients { reply } => {
                let _ = reply.send(self.clients.keys().cloned().collect());
            }
            Query::Room { room_id, reply } => {
                let info = self.rooms.get(&room_id).map(|room| RoomInfo {
                    id: room.id.clone(),
                    members: room.list_members(),
                });
                let _ = reply.send(info);
            }
            Query::Rooms { reply } => {
                let _ = reply.send(self.rooms.keys().cloned().collect());
            }
        }
    }

    /// Forward an error to the error listener, or drop it
    fn report(&self, error: BrokerError) {
        if !self.handle.listeners.notify_error(&error) {
            debug!("No error listener, discarding: {}", error);
        }
    }

    /// Build a handle for a registered client
    fn client_handle(&self, client_id: &ClientId) -> Result<Client, BrokerError> {
        let entry = self.clients.get(client_id).ok_or_else(|| {
            BrokerError::Invariant(format!("client {} missing from registry", client_id))
        })?;

        Ok(Client::new(
            client_id.clone(),
            entry.rooms.subscribe(),
            self.room_index.subscribe(),
            self.handle.clone(),
        ))
    }
}

/// Queue a frame for one client; a full or closed queue drops it
fn deliver(client_id: &ClientId, entry: &ClientEntry, frame: String) {
    match entry.send(frame) {
        Ok(()) => {}
        Err(SendError::QueueFull) => {
            warn!("Outbound queue full for {}, dropping message", client_id);
        }
        Err(SendError::ChannelClosed) => {
            debug!("Outbound queue closed for {}", client_id);
        }
    }
}

/// Cloneable handle to a running broker
///
/// Registers listeners, accepts connections and answers registry queries.
/// Queries are served by the broker loop, so they must not be awaited from
/// inside a connect, disconnect or error listener.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<BrokerCommand>,
    listeners: Arc<Listeners>,
    config: BrokerConfig,
}

impl BrokerHandle {
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Register the handler for messages named `name`
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Client, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listeners.on(name, handler);
    }

    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.listeners.on_connect(handler);
    }

    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.listeners.on_disconnect(handler);
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&BrokerError) + Send + Sync + 'static,
    {
        self.listeners.on_error(handler);
    }

    /// Register a new connection whose frames go to `outbound`
    ///
    /// Resolves once the client is registered, in its personal room, and the
    /// connect listener has run.
    pub async fn connect(&self, outbound: mpsc::Sender<String>) -> Result<Client, BrokerError> {
        let (reply, response) = oneshot::channel();
        self.submit(BrokerCommand::Connect { outbound, reply }).await?;
        response.await.map_err(|_| BrokerError::BrokerClosed)
    }

    /// Tear a client down as if its stream had ended
    pub async fn disconnect(&self, client_id: &ClientId) -> Result<(), BrokerError> {
        self.submit(BrokerCommand::Disconnect {
            client_id: client_id.clone(),
        })
        .await
    }

    pub async fn client(&self, client_id: &ClientId) -> Result<Option<ClientInfo>, BrokerError> {
        let client_id = client_id.clone();
        self.query(|reply| Query::Client { client_id, reply }).await
    }

    /// Ids of every connected client
    pub async fn clients(&self) -> Result<Vec<ClientId>, BrokerError> {
        self.query(|reply| Query::Clients { reply }).await
    }

    pub async fn room(&self, room_id: impl Into<RoomId>) -> Result<Option<RoomInfo>, BrokerError> {
        let room_id = room_id.into();
        self.query(|reply| Query::Room { room_id, reply }).await
    }

    /// Ids of every live room
    pub async fn rooms(&self) -> Result<Vec<RoomId>, BrokerError> {
        self.query(|reply| Query::Rooms { reply }).await
    }

    /// Stop the broker loop, dropping every client
    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.submit(BrokerCommand::Shutdown).await
    }

    /// Resolves once the broker loop has stopped
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Query,
    ) -> Result<T, BrokerError> {
        let (reply, response) = oneshot::channel();
        self.submit(BrokerCommand::Query(build(reply))).await?;
        response.await.map_err(|_| BrokerError::BrokerClosed)
    }

    pub(crate) async fn submit(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BrokerError::BrokerClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::time::timeout;

    use super::*;

    fn start() -> BrokerHandle {
        let (broker, handle) = Broker::new(BrokerConfig::default());
        tokio::spawn(broker.run());
        handle
    }

    async fn connect(broker: &BrokerHandle) -> (Client, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(32);
        let client = broker.connect(tx).await.unwrap();
        (client, rx)
    }

    /// Wait until the broker has processed everything submitted so far
    async fn settle(broker: &BrokerHandle) {
        broker.rooms().await.unwrap();
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn sorted<T: Ord>(mut items: Vec<T>) -> Vec<T> {
        items.sort();
        items
    }

    #[tokio::test]
    async fn test_connect_joins_personal_room() {
        let broker = start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broker.on_connect(move |client| {
            sink.lock()
                .unwrap()
                .push((client.id().clone(), client.list_rooms()));
        });

        let (client, _rx) = connect(&broker).await;
        let personal = RoomId::personal(client.id());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(client.id().clone(), vec![personal.clone()])]
        );
        assert_eq!(client.list_rooms(), vec![personal.clone()]);
        assert_eq!(broker.clients().await.unwrap(), vec![client.id().clone()]);
        assert_eq!(
            broker.room(personal.clone()).await.unwrap(),
            Some(RoomInfo {
                id: personal.clone(),
                members: vec![client.id().clone()],
            })
        );
        assert_eq!(
            broker.client(client.id()).await.unwrap(),
            Some(ClientInfo {
                id: client.id().clone(),
                rooms: vec![personal],
            })
        );
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_delivers_once() {
        let broker = start();
        let (a, mut a_rx) = connect(&broker).await;
        let (b, mut b_rx) = connect(&broker).await;
        let (c, mut c_rx) = connect(&broker).await;

        for room in ["r1", "r2"] {
            a.join(room).await.unwrap();
            b.join(room).await.unwrap();
        }
        c.join("r2").await.unwrap();
        settle(&broker).await;

        a.broadcast(Message::new("news", "hello")).await.unwrap();
        settle(&broker).await;

        let expected = json!({"name": "news", "content": "hello"});
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec![expected.clone()]);
        assert_eq!(drain(&mut c_rx), vec![expected]);
    }

    #[tokio::test]
    async fn test_scoped_broadcast_targets_one_room() {
        let broker = start();
        let (a, mut a_rx) = connect(&broker).await;
        let (b, mut b_rx) = connect(&broker).await;
        let (c, mut c_rx) = connect(&broker).await;

        a.join("r1").await.unwrap();
        b.join("r1").await.unwrap();
        c.join("r2").await.unwrap();
        settle(&broker).await;

        a.scoped_to("r1").broadcast(Message::new("news", json!(1))).await.unwrap();
        a.scoped_to("missing").broadcast(Message::new("news", json!(2))).await.unwrap();
        settle(&broker).await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec![json!({"name": "news", "content": 1})]);
        assert!(drain(&mut c_rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let broker = start();
        let (a, _rx) = connect(&broker).await;

        a.join("lobby").await.unwrap();
        a.join("lobby").await.unwrap();
        settle(&broker).await;

        let lobby = broker.room("lobby").await.unwrap().unwrap();
        assert_eq!(lobby.members, vec![a.id().clone()]);
        assert_eq!(a.list_rooms().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_room_collected_after_leave() {
        let broker = start();
        let (a, _rx) = connect(&broker).await;

        a.join("x").await.unwrap();
        settle(&broker).await;
        assert!(broker.rooms().await.unwrap().contains(&RoomId::from("x")));

        a.leave("x").await.unwrap();
        settle(&broker).await;

        assert!(!broker.rooms().await.unwrap().contains(&RoomId::from("x")));
        assert!(broker.room("x").await.unwrap().is_none());
        assert_eq!(a.list_rooms(), vec![RoomId::personal(a.id())]);
    }

    #[tokio::test]
    async fn test_leave_room_not_joined_is_noop() {
        let broker = start();
        let (a, _a_rx) = connect(&broker).await;
        let (b, _b_rx) = connect(&broker).await;

        b.join("lobby").await.unwrap();
        a.leave("lobby").await.unwrap();
        a.leave("nowhere").await.unwrap();
        settle(&broker).await;

        let lobby = broker.room("lobby").await.unwrap().unwrap();
        assert_eq!(lobby.members, vec![b.id().clone()]);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_registries() {
        let broker = start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        broker.on_disconnect(move |client| {
            sink.lock().unwrap().push(client.list_rooms());
        });

        let (a, _a_rx) = connect(&broker).await;
        let (b, mut b_rx) = connect(&broker).await;
        a.join("lobby").await.unwrap();
        b.join("lobby").await.unwrap();
        b.join("solo").await.unwrap();
        settle(&broker).await;

        broker.disconnect(b.id()).await.unwrap();
        settle(&broker).await;

        let before_removal = seen.lock().unwrap().clone();
        assert_eq!(
            before_removal,
            vec![sorted(vec![
                RoomId::from("lobby"),
                RoomId::personal(b.id()),
                RoomId::from("solo"),
            ])]
        );

        assert_eq!(broker.clients().await.unwrap(), vec![a.id().clone()]);
        assert!(broker.client(b.id()).await.unwrap().is_none());
        assert_eq!(
            broker.room("lobby").await.unwrap().unwrap().members,
            vec![a.id().clone()]
        );
        assert_eq!(
            sorted(broker.rooms().await.unwrap()),
            sorted(vec![RoomId::from("lobby"), RoomId::personal(a.id())])
        );

        // Outbound queue closes with the registry entry
        assert!(b_rx.recv().await.is_none());

        // A second disconnect is ignored
        broker.disconnect(b.id()).await.unwrap();
        settle(&broker).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_emit_to_unknown_client_is_noop() {
        let broker = start();
        let (a, mut a_rx) = connect(&broker).await;

        a.emit(Message::new("hello", "anyone"), &ClientId::new())
            .await
            .unwrap();
        settle(&broker).await;

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(broker.clients().await.unwrap(), vec![a.id().clone()]);
    }

    #[tokio::test]
    async fn test_emit_delivers_to_recipient_only() {
        let broker = start();
        let (a, mut a_rx) = connect(&broker).await;
        let (b, mut b_rx) = connect(&broker).await;

        a.emit(Message::new("dm", json!({"text": "hi"})), b.id())
            .await
            .unwrap();
        a.emit(Message::new("note", "self"), a.id()).await.unwrap();
        settle(&broker).await;

        assert_eq!(
            drain(&mut b_rx),
            vec![json!({"name": "dm", "content": {"text": "hi"}})]
        );
        assert_eq!(
            drain(&mut a_rx),
            vec![json!({"name": "note", "content": "self"})]
        );
    }

    #[tokio::test]
    async fn test_binary_content_is_delivered() {
        let broker = start();
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        broker.on_error(move |err| {
            let _ = errors_tx.send(err.to_string());
        });

        let (a, _a_rx) = connect(&broker).await;
        let (b, mut b_rx) = connect(&broker).await;
        a.join("files").await.unwrap();
        b.join("files").await.unwrap();

        a.emit(Message::new("blob", vec![0xffu8, 0x00]), b.id())
            .await
            .unwrap();
        a.scoped_to("files")
            .broadcast(Message::new("blob", vec![0xfeu8]))
            .await
            .unwrap();
        settle(&broker).await;

        assert_eq!(
            drain(&mut b_rx),
            vec![
                json!({"name": "blob", "content": "/wA="}),
                json!({"name": "blob", "content": "/g=="}),
            ]
        );
        assert!(errors_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnected_sender_cannot_route() {
        let broker = start();
        let (a, _a_rx) = connect(&broker).await;
        let (b, mut b_rx) = connect(&broker).await;
        a.join("lobby").await.unwrap();
        b.join("lobby").await.unwrap();

        broker.disconnect(a.id()).await.unwrap();
        a.emit(Message::new("dm", "late"), b.id()).await.unwrap();
        a.scoped_to("lobby")
            .broadcast(Message::new("news", "late"))
            .await
            .unwrap();
        settle(&broker).await;

        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(broker.clients().await.unwrap(), vec![b.id().clone()]);
    }

    #[tokio::test]
    async fn test_full_command_channel_makes_submitters_wait() {
        let (broker, handle) = Broker::new(BrokerConfig {
            command_buffer: 1,
            ..BrokerConfig::default()
        });

        handle.disconnect(&ClientId::new()).await.unwrap();

        let unknown = ClientId::new();
        let waiting = handle.disconnect(&unknown);
        tokio::pin!(waiting);
        assert!(timeout(Duration::from_millis(50), &mut waiting).await.is_err());

        tokio::spawn(broker.run());
        timeout(Duration::from_secs(1), waiting)
            .await
            .expect("submit still blocked after the loop started")
            .unwrap();
        assert!(handle.clients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errors_without_listener_are_discarded() {
        let broker = start();
        let (a, _rx) = connect(&broker).await;

        a.report(BrokerError::BrokerClosed).await.unwrap();
        settle(&broker).await;
        assert_eq!(broker.clients().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_outbound_queue_drops_frames() {
        let broker = start();
        let (a, _a_rx) = connect(&broker).await;
        let (tx, mut slow_rx) = mpsc::channel(1);
        let slow = broker.connect(tx).await.unwrap();

        for n in 0..3 {
            a.emit(Message::new("n", json!(n)), slow.id()).await.unwrap();
        }
        settle(&broker).await;

        assert_eq!(drain(&mut slow_rx), vec![json!({"name": "n", "content": 0})]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (broker, handle) = Broker::new(BrokerConfig::default());
        let task = tokio::spawn(broker.run());
        let (a, mut a_rx) = connect(&handle).await;

        handle.shutdown().await.unwrap();
        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(result.is_ok());

        assert!(a_rx.recv().await.is_none());
        assert!(matches!(a.join("x").await, Err(BrokerError::BrokerClosed)));
        assert!(matches!(handle.rooms().await, Err(BrokerError::BrokerClosed)));
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_fatal() {
        let (mut broker, handle) = Broker::new(BrokerConfig::default());
        let mut ghosts = Room::new(RoomId::from("ghosts"));
        ghosts.add_member(ClientId::new());
        broker.rooms.insert(RoomId::from("ghosts"), ghosts);
        let task = tokio::spawn(broker.run());

        let (a, _rx) = connect(&handle).await;
        a.scoped_to("ghosts")
            .broadcast(Message::new("boo", "x"))
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ref e) if e.is_fatal()));
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let broker = start();

        let (a, mut a_rx) = connect(&broker).await;
        assert_eq!(broker.clients().await.unwrap(), vec![a.id().clone()]);
        assert_eq!(
            broker.room(RoomId::personal(a.id())).await.unwrap().unwrap().members,
            vec![a.id().clone()]
        );

        let (b, mut b_rx) = connect(&broker).await;
        assert_eq!(
            sorted(broker.clients().await.unwrap()),
            sorted(vec![a.id().clone(), b.id().clone()])
        );

        a.join("lobby").await.unwrap();
        b.join("lobby").await.unwrap();
        settle(&broker).await;

        a.scoped_to("lobby")
            .broadcast(Message::new("msg", "hi lobby"))
            .await
            .unwrap();
        settle(&broker).await;

        assert_eq!(
            drain(&mut b_rx),
            vec![json!({"name": "msg", "content": "hi lobby"})]
        );
        assert!(drain(&mut a_rx).is_empty());

        broker.disconnect(b.id()).await.unwrap();
        settle(&broker).await;

        assert_eq!(
            broker.room("lobby").await.unwrap().unwrap().members,
            vec![a.id().clone()]
        );
        assert!(broker.room(RoomId::personal(b.id())).await.unwrap().is_none());
    }
}
