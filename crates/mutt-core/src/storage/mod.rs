//! Durable local state: identity, contacts, barks, conversations.
//!
//! All writes are insert-if-absent. A duplicate bark or message key is a
//! [`MuttError::StorageConflict`], never an overwrite. Every successful
//! write is announced on the change feed so observers never poll.
mod feed;
mod memory;
mod sqlite;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::MuttConfig;
use crate::crypto::LocalIdentity;
use crate::error::MuttError;
use crate::packet::Bark;
use crate::types::{BarkKey, Contact, Conversation, DawgIdentifier, Message, PublicKey, SharedSecret};

pub use feed::{ChangeFeed, ConversationSwitcher, ConversationUpdate, ConversationWatcher};
pub use memory::MemoryStorageManager;
pub use sqlite::SqliteStorageManager;

/// A committed change, published after the write succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageChange {
    ContactAdded(Uuid),
    ContactUpdated(Uuid),
    ContactRemoved(Uuid),
    MessageAppended { peer: Uuid, key: BarkKey },
}

/// Persistence seam of the backend.
///
/// Implementations must tolerate concurrent reads and appends from several
/// threads.
pub trait StorageManager: Send + Sync {
    // ── Local identity ──────────────────────────────────────────────

    fn load_local_identity(&self) -> Result<Option<LocalIdentity>, MuttError>;

    fn store_local_identity(&self, identity: &LocalIdentity) -> Result<(), MuttError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Insert if no contact with this uuid exists. Returns whether a record was created.
    fn insert_contact(&self, contact: &Contact) -> Result<bool, MuttError>;

    /// Replace the key material of an existing contact.
    fn rotate_contact_keys(
        &self,
        identity: &DawgIdentifier,
        shared_secret: Option<SharedSecret>,
    ) -> Result<(), MuttError>;

    fn get_contact(&self, uuid: Uuid) -> Result<Option<Contact>, MuttError>;

    fn get_contact_by_key(&self, key: &PublicKey) -> Result<Option<Contact>, MuttError>;

    /// Nicknames are not unique; every match is returned.
    fn get_contacts_by_nickname(&self, name: &str) -> Result<Vec<Contact>, MuttError>;

    fn get_all_contacts(&self) -> Result<Vec<Contact>, MuttError>;

    /// Returns whether a contact was removed.
    fn delete_contact(&self, uuid: Uuid) -> Result<bool, MuttError>;

    // ── Barks ───────────────────────────────────────────────────────

    /// Insert if absent; a duplicate key is a `StorageConflict`.
    fn insert_bark(&self, bark: &Bark, pending: bool) -> Result<(), MuttError>;

    fn has_bark(&self, key: &BarkKey) -> Result<bool, MuttError>;

    /// Barks from `src` to `dst`, highest sequence number first.
    fn get_barks(&self, src: &PublicKey, dst: &PublicKey) -> Result<Vec<Bark>, MuttError>;

    fn get_last_seq_num(&self, src: &PublicKey, dst: &PublicKey) -> Result<Option<u64>, MuttError>;

    /// Barks not yet handed to a transport, by recipient then sequence number.
    /// `None` lists every recipient.
    fn pending_barks(&self, dst: Option<&PublicKey>) -> Result<Vec<Bark>, MuttError>;

    fn mark_bark_sent(&self, key: &BarkKey) -> Result<(), MuttError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Append to the conversation with `peer`, creating it on first use.
    fn append_message(&self, peer: &DawgIdentifier, message: &Message) -> Result<(), MuttError>;

    fn get_conversation(&self, peer: Uuid) -> Result<Option<Conversation>, MuttError>;

    /// All conversations, oldest first.
    fn list_conversations(&self) -> Result<Vec<Conversation>, MuttError>;

    /// Messages with `peer`, oldest to newest.
    fn get_messages(&self, peer: Uuid) -> Result<Vec<Message>, MuttError>;

    // ── Change feed ─────────────────────────────────────────────────

    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

/// Open the store selected by `config.database_path`, in memory if unset.
pub fn open_storage(config: &MuttConfig) -> Result<Arc<dyn StorageManager>, MuttError> {
    match &config.database_path {
        Some(path) => Ok(Arc::new(SqliteStorageManager::open(path)?)),
        None => Ok(Arc::new(MemoryStorageManager::new())),
    }
}

/// Display order of a conversation.
///
/// Each author's messages stay in sequence order whatever their clocks say;
/// the per-author streams are then merged by timestamp, ties going to the
/// lower author key.
pub(crate) fn sort_messages(messages: &mut Vec<Message>) {
    let mut streams: BTreeMap<PublicKey, VecDeque<Message>> = BTreeMap::new();
    for message in messages.drain(..) {
        streams
            .entry(*message.author.public_key())
            .or_default()
            .push_back(message);
    }
    for stream in streams.values_mut() {
        stream.make_contiguous().sort_by_key(|m| m.order_num);
    }

    while let Some(author) = streams
        .iter()
        .filter_map(|(author, stream)| stream.front().map(|m| (m.timestamp, *author)))
        .min()
        .map(|(_, author)| author)
    {
        let Some(stream) = streams.get_mut(&author) else {
            break;
        };
        messages.extend(stream.pop_front());
        if stream.is_empty() {
            streams.remove(&author);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(author: &DawgIdentifier, ts: u64, seq: u64) -> Message {
        Message {
            author: author.clone(),
            recipient_key: PublicKey::from_bytes([0; 32]),
            plaintext: format!("{seq}"),
            order_num: seq,
            timestamp: ts,
        }
    }

    fn order(messages: &[Message]) -> Vec<(u64, u64, String)> {
        messages
            .iter()
            .map(|m| (m.timestamp, m.order_num, m.author.name().to_string()))
            .collect()
    }

    #[test]
    fn authors_interleave_by_timestamp() {
        let a = DawgIdentifier::new(Uuid::from_u128(1), "a", PublicKey::from_bytes([1; 32]));
        let b = DawgIdentifier::new(Uuid::from_u128(2), "b", PublicKey::from_bytes([2; 32]));
        let mut messages = vec![msg(&b, 10, 1), msg(&a, 12, 2), msg(&a, 5, 1), msg(&b, 20, 2)];
        sort_messages(&mut messages);
        assert_eq!(
            order(&messages),
            vec![
                (5, 1, "a".into()),
                (10, 1, "b".into()),
                (12, 2, "a".into()),
                (20, 2, "b".into()),
            ]
        );
    }

    #[test]
    fn sender_clock_going_backwards_keeps_sequence_order() {
        let a = DawgIdentifier::new(Uuid::from_u128(1), "a", PublicKey::from_bytes([1; 32]));
        let b = DawgIdentifier::new(Uuid::from_u128(2), "b", PublicKey::from_bytes([2; 32]));
        let mut messages = vec![
            msg(&a, 1_000_000, 2),
            msg(&a, 2_000_000, 1),
            msg(&b, 1_500_000, 1),
        ];
        sort_messages(&mut messages);
        assert_eq!(
            order(&messages),
            vec![
                (1_500_000, 1, "b".into()),
                (2_000_000, 1, "a".into()),
                (1_000_000, 2, "a".into()),
            ]
        );
    }

    #[test]
    fn open_storage_defaults_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_storage(&MuttConfig::new().in_memory()).unwrap();
        assert!(storage.load_local_identity().unwrap().is_none());

        let path = dir.path().join("mutt.db");
        let storage = open_storage(&MuttConfig::new().database_path(&path)).unwrap();
        assert!(storage.get_all_contacts().unwrap().is_empty());
        assert!(path.exists());
    }
}
