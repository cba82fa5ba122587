//! Scuttlemutt runtime. Ties transport, key exchange and storage into a
//! live event loop.
//!
//! [`Scuttlemutt::open`] spawns one task that owns all mutable protocol state
//! (endpoints, handshakes, retry backoff). The returned handle is cheap to
//! clone; writes go through the task as commands, reads go straight to
//! storage or to the published contact snapshot.
mod effect;
mod executor;
mod r#loop;
mod state;

#[cfg(test)]
mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use mutt_transport::{Transport, TransportEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::MuttConfig;
use crate::crypto::LocalIdentity;
use crate::error::MuttError;
use crate::storage::{ConversationSwitcher, ConversationWatcher, StorageManager};
use crate::types::{BarkKey, Contact, Conversation, DawgIdentifier, Message, PublicKey, SharedSecret};

use state::CoreState;

// ── Events (runtime → app) ──────────────────────────────────────────

/// Things the application may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuttEvent {
    EndpointDiscovered { endpoint: String },
    EndpointConnected { endpoint: String },
    EndpointLost { endpoint: String },
    KeyExchangeCompleted {
        endpoint: String,
        contact: DawgIdentifier,
        created: bool,
    },
    MessageReceived {
        from: DawgIdentifier,
        key: BarkKey,
        plaintext: String,
    },
    /// A bark reached the recipient's own endpoint; it is no longer pending.
    Delivered { key: BarkKey },
    /// A bark was handed to neighbours for relaying. It stays pending until
    /// the recipient's endpoint takes it.
    HandedToMesh { key: BarkKey },
    /// A bark stays pending and will be retried.
    DeliveryDeferred { key: BarkKey, reason: String },
    /// A pending bark will never be sent, e.g. its contact was deleted.
    DeliveryAbandoned { key: BarkKey, reason: String },
    /// A bark for someone else was forwarded.
    Relayed { key: BarkKey },
    /// An endpoint offered a key for a known contact that does not match the
    /// stored one. The contact is unchanged.
    KeyConflict {
        endpoint: String,
        contact: Uuid,
        offered: PublicKey,
    },
    /// A neighbour flooded the relay and is ignored from now on.
    EndpointBanned { endpoint: String, reason: String },
    /// Several contacts share a display name.
    NicknameCollision { name: String, uuids: Vec<Uuid> },
    Error { description: String },
}

/// What `send_message` did with the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub key: BarkKey,
    /// Handed to the transport now, directly or to the mesh; `false` means
    /// nothing was in range (or a note to self). A mesh hand-off stays
    /// pending until the recipient's endpoint takes the bark.
    pub dispatched: bool,
    /// The configured placeholder went out instead of the requested text.
    pub placeholder: bool,
}

// ── Contact snapshot ────────────────────────────────────────────────

/// Immutable view of all contacts, swapped whole on every change.
#[derive(Debug, Default)]
pub struct ContactIndex {
    by_uuid: HashMap<Uuid, Contact>,
}

impl ContactIndex {
    pub fn new(contacts: Vec<Contact>) -> Self {
        Self {
            by_uuid: contacts.into_iter().map(|c| (c.uuid(), c)).collect(),
        }
    }

    pub fn contains(&self, uuid: Uuid) -> bool {
        self.by_uuid.contains_key(&uuid)
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Contact> {
        self.by_uuid.get(&uuid)
    }

    /// All contacts, ordered by name then uuid.
    pub fn all(&self) -> Vec<Contact> {
        let mut contacts: Vec<_> = self.by_uuid.values().cloned().collect();
        contacts.sort_by(|a, b| {
            (a.identity.name(), a.uuid()).cmp(&(b.identity.name(), b.uuid()))
        });
        contacts
    }

    pub fn named(&self, name: &str) -> Vec<Contact> {
        self.all()
            .into_iter()
            .filter(|c| c.identity.name() == name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

// ── Commands (app → runtime) ────────────────────────────────────────

pub(crate) enum RuntimeCommand {
    SendMessage {
        plaintext: String,
        destination: Uuid,
        reply: oneshot::Sender<Result<SendReceipt, MuttError>>,
    },
    AddContact {
        identity: DawgIdentifier,
        shared_secret: Option<SharedSecret>,
        reply: oneshot::Sender<Result<bool, MuttError>>,
    },
    DeleteContact {
        uuid: Uuid,
        reply: oneshot::Sender<Result<bool, MuttError>>,
    },
    SendKeys {
        endpoint: String,
        reply: oneshot::Sender<Result<(), MuttError>>,
    },
    ConnectedEndpoints {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

// ── Handle ──────────────────────────────────────────────────────────

/// Entry point of the backend. Cheap to clone; all clones share one runtime.
#[derive(Clone)]
pub struct Scuttlemutt {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    storage: Arc<dyn StorageManager>,
    contacts: watch::Receiver<Arc<ContactIndex>>,
    local: DawgIdentifier,
    placeholder: Arc<str>,
    cancel: CancellationToken,
}

/// Returned by [`Scuttlemutt::open`].
pub struct MuttChannels {
    pub handle: Scuttlemutt,
    pub events: mpsc::Receiver<MuttEvent>,
}

impl Scuttlemutt {
    /// Start a backend instance over `transport`.
    ///
    /// Loads the local identity from `storage`, or generates one named `name`
    /// and persists it. The local identity is always a contact of itself.
    /// Must be called from within a tokio runtime.
    pub fn open<T: Transport>(
        transport: T,
        transport_events: mpsc::Receiver<TransportEvent>,
        storage: Arc<dyn StorageManager>,
        name: &str,
        config: MuttConfig,
    ) -> Result<MuttChannels, MuttError> {
        let local = match storage.load_local_identity()? {
            Some(local) => local,
            None => {
                let local = LocalIdentity::generate(name);
                storage.store_local_identity(&local)?;
                info!(identity = %local.identity(), "generated local identity");
                local
            }
        };
        let self_secret = local.shared_secret_with(local.identity())?;
        storage.insert_contact(&Contact::new(local.identity().clone(), Some(self_secret)))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let cancel = CancellationToken::new();
        let local_identity = local.identity().clone();
        let placeholder: Arc<str> = Arc::from(config.placeholder_text.as_str());

        let state = CoreState::new(local, storage.clone(), config, transport.max_payload_size())?;
        let contacts = state.subscribe_contacts();

        tokio::spawn(r#loop::runtime_loop(
            state,
            transport,
            transport_events,
            cmd_rx,
            event_tx,
            cancel.clone(),
        ));

        Ok(MuttChannels {
            handle: Scuttlemutt {
                cmd_tx,
                storage,
                contacts,
                local: local_identity,
                placeholder,
                cancel,
            },
            events: event_rx,
        })
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> RuntimeCommand,
    ) -> Result<R, MuttError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| MuttError::Shutdown)?;
        rx.await.map_err(|_| MuttError::Shutdown)
    }

    /// This device's identity.
    pub fn local_identity(&self) -> &DawgIdentifier {
        &self.local
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    // ── Messaging ───────────────────────────────────────────────────

    /// Encrypt, store and dispatch `plaintext` to the contact `destination`.
    ///
    /// Sequence numbers are allocated by the runtime task, so concurrent
    /// callers never share or skip one. Undeliverable barks stay pending
    /// and are retried.
    pub async fn send_message(
        &self,
        plaintext: &str,
        destination: Uuid,
    ) -> Result<SendReceipt, MuttError> {
        let plaintext = plaintext.to_string();
        self.request(|reply| RuntimeCommand::SendMessage {
            plaintext,
            destination,
            reply,
        })
        .await?
    }

    /// Like [`send_message`](Self::send_message), but oversized text is
    /// replaced by the configured placeholder instead of failing.
    pub async fn send_message_or_placeholder(
        &self,
        plaintext: &str,
        destination: Uuid,
    ) -> Result<SendReceipt, MuttError> {
        match self.send_message(plaintext, destination).await {
            Err(MuttError::PayloadTooLarge { size, max }) => {
                info!(size, max, "message too large, sending placeholder");
                let mut receipt = self.send_message(&self.placeholder, destination).await?;
                receipt.placeholder = true;
                Ok(receipt)
            }
            other => other,
        }
    }

    pub fn get_conversation(&self, other: Uuid) -> Result<Option<Conversation>, MuttError> {
        self.storage.get_conversation(other)
    }

    /// Messages of `conversation`, oldest first. Empty when there are none.
    pub fn get_messages_for_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<Message>, MuttError> {
        self.storage.get_messages(conversation.peer.uuid())
    }

    pub fn list_conversations(&self) -> Result<Vec<Conversation>, MuttError> {
        self.storage.list_conversations()
    }

    // ── Contacts ────────────────────────────────────────────────────

    /// Add a contact. Re-adding a known uuid is a no-op returning `false`.
    ///
    /// Without a secret one is derived from our key and the contact's key.
    pub async fn add_contact(
        &self,
        identity: DawgIdentifier,
        shared_secret: Option<SharedSecret>,
    ) -> Result<bool, MuttError> {
        self.request(|reply| RuntimeCommand::AddContact {
            identity,
            shared_secret,
            reply,
        })
        .await?
    }

    /// Remove a contact. Barks still pending for it are abandoned with a
    /// [`MuttEvent::DeliveryAbandoned`] each.
    pub async fn delete_contact(&self, uuid: Uuid) -> Result<bool, MuttError> {
        self.request(|reply| RuntimeCommand::DeleteContact { uuid, reply })
            .await?
    }

    pub fn have_contact(&self, uuid: Uuid) -> bool {
        self.contacts.borrow().contains(uuid)
    }

    pub fn contact(&self, uuid: Uuid) -> Option<Contact> {
        self.contacts.borrow().get(uuid).cloned()
    }

    pub fn contacts_named(&self, name: &str) -> Vec<Contact> {
        self.contacts.borrow().named(name)
    }

    pub fn all_contacts(&self) -> Vec<Contact> {
        self.contacts.borrow().all()
    }

    /// Snapshot stream; every change replaces the whole index.
    pub fn watch_contacts(&self) -> watch::Receiver<Arc<ContactIndex>> {
        self.contacts.clone()
    }

    // ── Endpoints ───────────────────────────────────────────────────

    /// Start a key exchange with a connected endpoint.
    pub async fn send_keys(&self, endpoint: &str) -> Result<(), MuttError> {
        let endpoint = endpoint.to_string();
        self.request(|reply| RuntimeCommand::SendKeys { endpoint, reply })
            .await?
    }

    pub async fn connected_endpoints(&self) -> Result<Vec<String>, MuttError> {
        self.request(|reply| RuntimeCommand::ConnectedEndpoints { reply })
            .await
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Follow one conversation until cancelled or shut down.
    pub fn watch_conversation(&self, peer: Uuid) -> ConversationWatcher {
        ConversationWatcher::new(peer, self.storage.subscribe(), self.cancel.child_token())
    }

    /// A switcher that keeps one conversation watcher alive at a time.
    pub fn conversation_switcher(&self) -> ConversationSwitcher {
        ConversationSwitcher::new(self.storage.clone(), self.cancel.child_token())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Stop the runtime and cancel every watcher created from this instance.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
