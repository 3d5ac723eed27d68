//! Conversation membership, as seen by this crate.
//!
//! Membership is owned by an external service. The engine only asks one
//! question of it: is this caller a current participant?

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

/// Read-only view of conversation participants.
pub trait Membership: Send + Sync {
    /// Whether `participant` currently belongs to `conversation_id`.
    fn is_participant(&self, conversation_id: &str, participant: &str) -> bool;
}

/// In-process membership table.
///
/// Participant lists are kept ordered and deduplicated. Clones share the same
/// table, so a test can remove a participant while an engine holds another
/// handle.
#[derive(Debug, Clone, Default)]
pub struct StaticMembership {
    conversations: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl StaticMembership {
    /// Empty membership table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the participant set of a conversation.
    pub fn set<I, P>(&self, conversation_id: &str, participants: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let mut list: Vec<String> = participants.into_iter().map(Into::into).collect();
        list.sort();
        list.dedup();

        self.conversations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation_id.to_owned(), list);
    }

    /// Add a participant. Returns false if already present.
    pub fn add(&self, conversation_id: &str, participant: &str) -> bool {
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        let list = conversations.entry(conversation_id.to_owned()).or_default();

        match list.binary_search_by(|p| p.as_str().cmp(participant)) {
            Ok(_) => false,
            Err(index) => {
                list.insert(index, participant.to_owned());
                true
            },
        }
    }

    /// Remove a participant. Returns false if they were not present.
    pub fn remove(&self, conversation_id: &str, participant: &str) -> bool {
        let mut conversations = self.conversations.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = conversations.get_mut(conversation_id) else {
            return false;
        };

        match list.binary_search_by(|p| p.as_str().cmp(participant)) {
            Ok(index) => {
                list.remove(index);
                true
            },
            Err(_) => false,
        }
    }

    /// Current participants, ordered.
    pub fn participants(&self, conversation_id: &str) -> Vec<String> {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Membership for StaticMembership {
    fn is_participant(&self, conversation_id: &str, participant: &str) -> bool {
        self.conversations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .is_some_and(|list| list.binary_search_by(|p| p.as_str().cmp(participant)).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_orders_and_dedups() {
        let membership = StaticMembership::new();
        membership.set("conv-1", ["carol", "alice", "bob", "alice"]);

        assert_eq!(membership.participants("conv-1"), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn add_and_remove() {
        let membership = StaticMembership::new();

        assert!(membership.add("conv-1", "bob"));
        assert!(membership.add("conv-1", "alice"));
        assert!(!membership.add("conv-1", "alice"));
        assert!(membership.is_participant("conv-1", "alice"));

        assert!(membership.remove("conv-1", "alice"));
        assert!(!membership.remove("conv-1", "alice"));
        assert!(!membership.is_participant("conv-1", "alice"));
        assert_eq!(membership.participants("conv-1"), vec!["bob"]);
    }

    #[test]
    fn unknown_conversation_has_no_participants() {
        let membership = StaticMembership::new();

        assert!(!membership.is_participant("nope", "alice"));
        assert!(!membership.remove("nope", "alice"));
        assert!(membership.participants("nope").is_empty());
    }

    #[test]
    fn clones_share_table() {
        let membership = StaticMembership::new();
        let handle = membership.clone();

        handle.add("conv-1", "alice");
        assert!(membership.is_participant("conv-1", "alice"));
    }
}
