//! Room membership: chat_id → identities currently subscribed.
//!
//! Derived state, never persisted. An identity is a member only while it
//! has an open connection and has joined since connecting; the router
//! purges it from every room when its connection goes away.

use std::collections::HashSet;

use dashmap::DashMap;

use parley_core::ids::ChatId;

#[derive(Default)]
pub struct RoomTable {
    rooms: DashMap<ChatId, HashSet<String>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity to a room. Idempotent; concurrent joins both land
    /// (the shard entry is locked for the update).
    pub fn join(&self, chat_id: &ChatId, email: &str) {
        self.rooms
            .entry(chat_id.clone())
            .or_default()
            .insert(email.to_string());
    }

    /// Remove an identity from one room.
    pub fn leave(&self, chat_id: &ChatId, email: &str) {
        if let Some(mut members) = self.rooms.get_mut(chat_id) {
            members.remove(email);
        }
        self.rooms.remove_if(chat_id, |_, members| members.is_empty());
    }

    /// Current members of a room.
    pub fn members(&self, chat_id: &ChatId) -> Vec<String> {
        self.rooms
            .get(chat_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, chat_id: &ChatId, email: &str) -> bool {
        self.rooms
            .get(chat_id)
            .map(|members| members.contains(email))
            .unwrap_or(false)
    }

    /// Remove an identity from every room it joined. Rooms left empty are
    /// dropped to bound memory.
    pub fn purge(&self, email: &str) {
        self.rooms.retain(|_, members| {
            members.remove(email);
            !members.is_empty()
        });
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
