//! Room struct definition
//!
//! Represents a named set of member clients.

use std::collections::HashSet;

use crate::types::{ClientId, RoomId};

/// Chat room
///
/// Pure membership bookkeeping. Only the broker loop mutates rooms; a room
/// that loses its last member is removed from the registry by the broker.
#[derive(Debug)]
pub struct Room {
    /// Room id for identification
    pub id: RoomId,
    /// Member clients
    members: HashSet<ClientId>,
}

impl Room {
    /// Create a new, empty room with the given id
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashSet::new(),
        }
    }

    /// Check if a client is in this room
    pub fn has_member(&self, client_id: &ClientId) -> bool {
        self.members.contains(client_id)
    }

    /// Snapshot of the member ids, in no particular order
    pub fn list_members(&self) -> Vec<ClientId> {
        self.members.iter().cloned().collect()
    }

    /// Iterate over members without copying
    pub fn members(&self) -> impl Iterator<Item = &ClientId> {
        self.members.iter()
    }

    /// Add a member
    ///
    /// Returns false if the client was already in the room.
    pub(crate) fn add_member(&mut self, client_id: ClientId) -> bool {
        self.members.insert(client_id)
    }

    /// Remove a member
    ///
    /// Returns true if the room should be deleted (no members left).
    pub(crate) fn remove_member(&mut self, client_id: &ClientId) -> bool {
        self.members.remove(client_id);
        self.members.is_empty()
    }
}
