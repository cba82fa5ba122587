use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use uuid::Uuid;

use super::{sort_messages, ChangeFeed, StorageChange, StorageManager};
use crate::crypto::LocalIdentity;
use crate::error::MuttError;
use crate::packet::Bark;
use crate::types::{
    now_ms, BarkKey, Contact, Conversation, DawgIdentifier, Message, PublicKey, SharedSecret,
};

#[derive(Default)]
struct Inner {
    identity: Option<LocalIdentity>,
    contacts: BTreeMap<Uuid, Contact>,
    /// Bark plus its pending flag.
    barks: BTreeMap<BarkKey, (Bark, bool)>,
    conversations: BTreeMap<Uuid, Conversation>,
    messages: BTreeMap<Uuid, BTreeMap<BarkKey, Message>>,
}

/// Volatile store. Lost on restart.
#[derive(Default)]
pub struct MemoryStorageManager {
    inner: RwLock<Inner>,
    feed: ChangeFeed,
}

impl MemoryStorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bark_range(src: &PublicKey, dst: &PublicKey) -> std::ops::RangeInclusive<BarkKey> {
    BarkKey::new(*src, *dst, 0)..=BarkKey::new(*src, *dst, u64::MAX)
}

impl StorageManager for MemoryStorageManager {
    fn load_local_identity(&self) -> Result<Option<LocalIdentity>, MuttError> {
        Ok(self.read().identity.clone())
    }

    fn store_local_identity(&self, identity: &LocalIdentity) -> Result<(), MuttError> {
        self.write().identity = Some(identity.clone());
        Ok(())
    }

    fn insert_contact(&self, contact: &Contact) -> Result<bool, MuttError> {
        let created = {
            let mut inner = self.write();
            if inner.contacts.contains_key(&contact.uuid()) {
                false
            } else {
                inner.contacts.insert(contact.uuid(), contact.clone());
                true
            }
        };
        if created {
            self.feed.publish(StorageChange::ContactAdded(contact.uuid()));
        }
        Ok(created)
    }

    fn rotate_contact_keys(
        &self,
        identity: &DawgIdentifier,
        shared_secret: Option<SharedSecret>,
    ) -> Result<(), MuttError> {
        {
            let mut inner = self.write();
            let contact = inner
                .contacts
                .get_mut(&identity.uuid())
                .ok_or(MuttError::UnknownContact {
                    uuid: identity.uuid(),
                })?;
            contact.identity = identity.clone();
            contact.shared_secret = shared_secret;
        }
        self.feed.publish(StorageChange::ContactUpdated(identity.uuid()));
        Ok(())
    }

    fn get_contact(&self, uuid: Uuid) -> Result<Option<Contact>, MuttError> {
        Ok(self.read().contacts.get(&uuid).cloned())
    }

    fn get_contact_by_key(&self, key: &PublicKey) -> Result<Option<Contact>, MuttError> {
        Ok(self
            .read()
            .contacts
            .values()
            .find(|c| c.public_key() == key)
            .cloned())
    }

    fn get_contacts_by_nickname(&self, name: &str) -> Result<Vec<Contact>, MuttError> {
        Ok(self
            .read()
            .contacts
            .values()
            .filter(|c| c.identity.name() == name)
            .cloned()
            .collect())
    }

    fn get_all_contacts(&self) -> Result<Vec<Contact>, MuttError> {
        Ok(self.read().contacts.values().cloned().collect())
    }

    fn delete_contact(&self, uuid: Uuid) -> Result<bool, MuttError> {
        let removed = self.write().contacts.remove(&uuid).is_some();
        if removed {
            self.feed.publish(StorageChange::ContactRemoved(uuid));
        }
        Ok(removed)
    }

    fn insert_bark(&self, bark: &Bark, pending: bool) -> Result<(), MuttError> {
        let key = bark.key();
        let mut inner = self.write();
        if inner.barks.contains_key(&key) {
            return Err(MuttError::StorageConflict { key });
        }
        inner.barks.insert(key, (bark.clone(), pending));
        Ok(())
    }

    fn has_bark(&self, key: &BarkKey) -> Result<bool, MuttError> {
        Ok(self.read().barks.contains_key(key))
    }

    fn get_barks(&self, src: &PublicKey, dst: &PublicKey) -> Result<Vec<Bark>, MuttError> {
        Ok(self
            .read()
            .barks
            .range(bark_range(src, dst))
            .rev()
            .map(|(_, (bark, _))| bark.clone())
            .collect())
    }

    fn get_last_seq_num(&self, src: &PublicKey, dst: &PublicKey) -> Result<Option<u64>, MuttError> {
        Ok(self
            .read()
            .barks
            .range(bark_range(src, dst))
            .next_back()
            .map(|(key, _)| key.seq_num))
    }

    fn pending_barks(&self, dst: Option<&PublicKey>) -> Result<Vec<Bark>, MuttError> {
        let inner = self.read();
        let mut barks: Vec<Bark> = inner
            .barks
            .values()
            .filter(|(bark, pending)| *pending && dst.map_or(true, |d| &bark.dst == d))
            .map(|(bark, _)| bark.clone())
            .collect();
        barks.sort_by(|a, b| (a.dst, a.seq_num).cmp(&(b.dst, b.seq_num)));
        Ok(barks)
    }

    fn mark_bark_sent(&self, key: &BarkKey) -> Result<(), MuttError> {
        if let Some((_, pending)) = self.write().barks.get_mut(key) {
            *pending = false;
        }
        Ok(())
    }

    fn append_message(&self, peer: &DawgIdentifier, message: &Message) -> Result<(), MuttError> {
        let key = message.key();
        {
            let mut inner = self.write();
            let exists = inner
                .messages
                .get(&peer.uuid())
                .is_some_and(|log| log.contains_key(&key));
            if exists {
                return Err(MuttError::StorageConflict { key });
            }
            inner
                .conversations
                .entry(peer.uuid())
                .or_insert_with(|| Conversation {
                    peer: peer.clone(),
                    created_at: now_ms(),
                });
            inner
                .messages
                .entry(peer.uuid())
                .or_default()
                .insert(key, message.clone());
        }
        self.feed.publish(StorageChange::MessageAppended {
            peer: peer.uuid(),
            key,
        });
        Ok(())
    }

    fn get_conversation(&self, peer: Uuid) -> Result<Option<Conversation>, MuttError> {
        Ok(self.read().conversations.get(&peer).cloned())
    }

    fn list_conversations(&self) -> Result<Vec<Conversation>, MuttError> {
        let mut conversations: Vec<_> = self.read().conversations.values().cloned().collect();
        conversations.sort_by_key(|c| (c.created_at, c.peer.uuid()));
        Ok(conversations)
    }

    fn get_messages(&self, peer: Uuid) -> Result<Vec<Message>, MuttError> {
        let mut messages: Vec<Message> = self
            .read()
            .messages
            .get(&peer)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default();
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.feed.subscribe()
    }
}
