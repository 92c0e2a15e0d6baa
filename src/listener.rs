//! Event listener registry
//!
//! Maps message names (and the fixed connect/disconnect/error events) to
//! handler functions. Registration is last-write-wins per key.
//!
//! Connect, disconnect and error listeners run in-line on the broker loop,
//! so a slow one stalls every client. Message listeners run in-line on the
//! receiving connection's task and only stall that connection's intake.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::client::Client;
use crate::error::BrokerError;

/// Handler for a named message: receives the client and the encoded content
pub type MessageListener = Arc<dyn Fn(Client, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handler for connect/disconnect events
pub type ConnectionListener = Arc<dyn Fn(&Client) + Send + Sync>;

/// Handler for errors from the asynchronous paths
pub type ErrorListener = Arc<dyn Fn(&BrokerError) + Send + Sync>;

/// Listener registry shared by the broker loop and every receive loop
#[derive(Default)]
pub struct Listeners {
    messages: DashMap<String, MessageListener>,
    connect: RwLock<Option<ConnectionListener>>,
    disconnect: RwLock<Option<ConnectionListener>>,
    error: RwLock<Option<ErrorListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for messages named `name`
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Client, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageListener =
            Arc::new(move |client: Client, payload: Vec<u8>| handler(client, payload).boxed());
        self.messages.insert(name.into(), handler);
    }

    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        let handler: ConnectionListener = Arc::new(handler);
        replace(&self.connect, handler);
    }

    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        let handler: ConnectionListener = Arc::new(handler);
        replace(&self.disconnect, handler);
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&BrokerError) + Send + Sync + 'static,
    {
        let handler: ErrorListener = Arc::new(handler);
        replace(&self.error, handler);
    }

    /// Look up the handler for a message name
    ///
    /// The handler is cloned out so no map lock is held while it runs.
    pub fn message(&self, name: &str) -> Option<MessageListener> {
        self.messages.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Invoke the connect listener, if any
    pub(crate) fn notify_connect(&self, client: &Client) {
        if let Some(handler) = current(&self.connect) {
            handler(client);
        }
    }

    /// Invoke the disconnect listener, if any
    pub(crate) fn notify_disconnect(&self, client: &Client) {
        if let Some(handler) = current(&self.disconnect) {
            handler(client);
        }
    }

    /// Invoke the error listener; without one the error is discarded
    pub(crate) fn notify_error(&self, err: &BrokerError) -> bool {
        match current(&self.error) {
            Some(handler) => {
                handler(err);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.messages.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("Listeners")
            .field("messages", &names)
            .field("connect", &current(&self.connect).is_some())
            .field("disconnect", &current(&self.disconnect).is_some())
            .field("error", &current(&self.error).is_some())
            .finish()
    }
}

fn replace<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, handler: Arc<T>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
}

fn current<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}
