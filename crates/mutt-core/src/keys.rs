//! Key exchange with nearby endpoints.
//!
//! Each endpoint moves `Discovered → KeysSent → Trusted`. A key-exchange
//! packet carries the sender's identity and public key; the receiver derives
//! the shared secret and stores the sender as a contact.
//!
//! Simultaneous exchanges converge: the derived secret depends only on the
//! two static keys and uuids, and contacts are inserted only if absent.
//!
//! A known uuid is bound to the key it first presented. A packet offering a
//! different key for it is refused with [`MuttError::KeyConflict`]; the user
//! accepts a reinstalled peer by deleting the contact and exchanging again.
use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::crypto::LocalIdentity;
use crate::error::MuttError;
use crate::packet::{KeyExchangePacket, Packet};
use crate::storage::StorageManager;
use crate::types::{Contact, PublicKey};

/// Handshake progress with one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Discovered,
    KeysSent,
    Trusted,
}

/// Result of accepting a key-exchange packet.
#[derive(Debug, Clone)]
pub struct KeyExchangeOutcome {
    pub contact: Contact,
    /// A new contact record was stored.
    pub created: bool,
    /// An existing contact's key material changed.
    pub rotated: bool,
    /// Our own keys, to send back when the peer does not have them yet.
    pub reply: Option<Packet>,
}

pub struct KeyExchanger {
    local: LocalIdentity,
    states: HashMap<String, ExchangeState>,
}

impl KeyExchanger {
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local,
            states: HashMap::new(),
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn state(&self, endpoint: &str) -> Option<ExchangeState> {
        self.states.get(endpoint).copied()
    }

    pub fn discovered(&mut self, endpoint: &str) {
        self.states
            .entry(endpoint.to_string())
            .or_insert(ExchangeState::Discovered);
    }

    pub fn forget(&mut self, endpoint: &str) {
        self.states.remove(endpoint);
    }

    fn key_packet(&self, recipient: Option<PublicKey>, seq_num: u64) -> Packet {
        Packet::KeyExchange(KeyExchangePacket {
            sender: self.local.identity().clone(),
            recipient,
            seq_num,
        })
    }

    /// Open an exchange with `endpoint`. The caller transmits the packet.
    pub fn send_keys(&mut self, endpoint: &str) -> Packet {
        let state = self
            .states
            .entry(endpoint.to_string())
            .or_insert(ExchangeState::Discovered);
        if *state == ExchangeState::Discovered {
            *state = ExchangeState::KeysSent;
        }
        self.key_packet(None, 0)
    }

    fn validate(&self, packet: &KeyExchangePacket) -> Result<(), MuttError> {
        if packet.sender.uuid() == self.local.uuid() {
            return Err(MuttError::InvalidPacket {
                reason: "key exchange claims our own identity".into(),
            });
        }
        if let Some(recipient) = &packet.recipient {
            if recipient != self.local.public_key() {
                return Err(MuttError::InvalidPacket {
                    reason: format!("key exchange addressed to {}", recipient.short()),
                });
            }
        }
        Ok(())
    }

    /// Accept keys from a peer we have no contact for.
    pub fn receive_secret_key_for_new_contact(
        &mut self,
        endpoint: &str,
        packet: &KeyExchangePacket,
        storage: &dyn StorageManager,
    ) -> Result<KeyExchangeOutcome, MuttError> {
        self.validate(packet)?;
        let secret = self.local.shared_secret_with(&packet.sender)?;
        let contact = Contact::new(packet.sender.clone(), Some(secret));
        if !storage.insert_contact(&contact)? {
            // lost a race with another exchange for the same uuid
            let existing = storage
                .get_contact(contact.uuid())?
                .ok_or(MuttError::UnknownContact {
                    uuid: contact.uuid(),
                })?;
            return self.receive_secret_key(existing, endpoint, packet, storage);
        }
        info!(peer = %contact.identity, endpoint, "new contact from key exchange");
        Ok(self.finish(endpoint, packet, contact, true, false))
    }

    /// Accept keys from a peer we already know.
    ///
    /// Same key: a no-op, or the missing secret is derived. A different key
    /// is unauthenticated and refused; the stored contact is left untouched.
    pub fn receive_secret_key(
        &mut self,
        mut contact: Contact,
        endpoint: &str,
        packet: &KeyExchangePacket,
        storage: &dyn StorageManager,
    ) -> Result<KeyExchangeOutcome, MuttError> {
        self.validate(packet)?;
        let offered = *packet.sender.public_key();
        if contact.public_key() != &offered {
            warn!(
                peer = %contact.identity,
                endpoint,
                offered = %offered.short(),
                "refusing key change for known contact"
            );
            return Err(MuttError::KeyConflict {
                uuid: contact.uuid(),
                offered,
            });
        }
        if contact.shared_secret.is_some() {
            debug!(peer = %contact.identity, endpoint, "key exchange repeated, keys unchanged");
            return Ok(self.finish(endpoint, packet, contact, false, false));
        }

        let secret = self.local.shared_secret_with(&packet.sender)?;
        storage.rotate_contact_keys(&packet.sender, Some(secret.clone()))?;
        info!(peer = %packet.sender, endpoint, "shared secret derived for known contact");
        contact.identity = packet.sender.clone();
        contact.shared_secret = Some(secret);
        Ok(self.finish(endpoint, packet, contact, false, true))
    }

    /// Route a key-exchange packet to the new-contact or known-contact path.
    pub fn handle_packet(
        &mut self,
        endpoint: &str,
        packet: &KeyExchangePacket,
        storage: &dyn StorageManager,
    ) -> Result<KeyExchangeOutcome, MuttError> {
        match storage.get_contact(packet.sender.uuid())? {
            Some(contact) => self.receive_secret_key(contact, endpoint, packet, storage),
            None => self.receive_secret_key_for_new_contact(endpoint, packet, storage),
        }
    }

    fn finish(
        &mut self,
        endpoint: &str,
        packet: &KeyExchangePacket,
        contact: Contact,
        created: bool,
        rotated: bool,
    ) -> KeyExchangeOutcome {
        let previous = self
            .states
            .insert(endpoint.to_string(), ExchangeState::Trusted);
        // reply unless the peer already has our keys; an opening packet on a
        // trusted endpoint means the peer started over
        let needs_reply = match previous {
            None | Some(ExchangeState::Discovered) => true,
            Some(ExchangeState::KeysSent) => false,
            Some(ExchangeState::Trusted) => packet.recipient.is_none(),
        };
        let reply = needs_reply.then(|| self.key_packet(Some(*packet.sender.public_key()), 1));
        KeyExchangeOutcome {
            contact,
            created,
            rotated,
            reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::storage::MemoryStorageManager;
    use crate::types::DawgIdentifier;
    use uuid::Uuid;

    fn identity(seed: u8, name: &str) -> LocalIdentity {
        LocalIdentity::from_parts(Uuid::from_u128(seed as u128), name, [seed; 32])
    }

    fn body(packet: &Packet) -> &KeyExchangePacket {
        match packet {
            Packet::KeyExchange(p) => p,
            other => panic!("expected key exchange, got {other:?}"),
        }
    }

    #[test]
    fn unseen_peer_becomes_trusted_contact() {
        let mut alice = KeyExchanger::new(identity(1, "alice"));
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let bob_store = MemoryStorageManager::new();

        let opening = alice.send_keys("bob-ep");
        assert_eq!(alice.state("bob-ep"), Some(ExchangeState::KeysSent));

        let outcome = bob.handle_packet("alice-ep", body(&opening), &bob_store).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.contact.uuid(), Uuid::from_u128(1));
        assert_eq!(bob.state("alice-ep"), Some(ExchangeState::Trusted));
        assert_eq!(bob_store.get_all_contacts().unwrap().len(), 1);

        let reply = outcome.reply.expect("bob owes alice his keys");
        assert_eq!(body(&reply).recipient, Some(*alice.local().public_key()));

        let alice_store = MemoryStorageManager::new();
        let back = alice.handle_packet("bob-ep", body(&reply), &alice_store).unwrap();
        assert!(back.created);
        assert!(back.reply.is_none());
        assert_eq!(back.contact.shared_secret, outcome.contact.shared_secret);
    }

    #[test]
    fn simultaneous_exchange_converges() {
        let mut alice = KeyExchanger::new(identity(1, "alice"));
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let (alice_store, bob_store) = (MemoryStorageManager::new(), MemoryStorageManager::new());

        let from_alice = alice.send_keys("bob-ep");
        let from_bob = bob.send_keys("alice-ep");

        let at_bob = bob.handle_packet("alice-ep", body(&from_alice), &bob_store).unwrap();
        let at_alice = alice.handle_packet("bob-ep", body(&from_bob), &alice_store).unwrap();

        assert!(at_bob.reply.is_none());
        assert!(at_alice.reply.is_none());
        assert_eq!(at_bob.contact.shared_secret, at_alice.contact.shared_secret);
        assert_eq!(bob_store.get_all_contacts().unwrap().len(), 1);
        assert_eq!(alice_store.get_all_contacts().unwrap().len(), 1);
    }

    #[test]
    fn repeated_packet_is_idempotent() {
        let alice = KeyExchanger::new(identity(1, "alice"));
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let store = MemoryStorageManager::new();
        let packet = alice.key_packet(None, 0);

        let first = bob.handle_packet("a", body(&packet), &store).unwrap();
        let second = bob.handle_packet("a", body(&packet), &store).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert!(!second.rotated);
        assert_eq!(first.contact.shared_secret, second.contact.shared_secret);
        assert_eq!(store.get_all_contacts().unwrap().len(), 1);
    }

    #[test]
    fn new_key_for_known_uuid_refused() {
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let store = MemoryStorageManager::new();
        let uuid = Uuid::from_u128(1);

        let old = KeyPair::from_secret_bytes([1; 32]);
        let new = KeyPair::from_secret_bytes([9; 32]);
        let packet = |keys: &KeyPair| KeyExchangePacket {
            sender: DawgIdentifier::new(uuid, "alice", *keys.public_key()),
            recipient: None,
            seq_num: 0,
        };

        let first = bob.handle_packet("a", &packet(&old), &store).unwrap();
        let err = bob.handle_packet("m", &packet(&new), &store).unwrap_err();
        assert!(matches!(
            err,
            MuttError::KeyConflict { uuid: u, offered } if u == uuid && offered == *new.public_key()
        ));
        assert_eq!(bob.state("m"), None);

        let stored = store.get_contact(uuid).unwrap().unwrap();
        assert_eq!(stored.public_key(), old.public_key());
        assert_eq!(stored.shared_secret, first.contact.shared_secret);
    }

    #[test]
    fn known_key_without_secret_gets_one() {
        let alice = KeyExchanger::new(identity(1, "alice"));
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let store = MemoryStorageManager::new();
        store
            .insert_contact(&Contact::new(alice.local().identity().clone(), None))
            .unwrap();

        let outcome = bob
            .handle_packet("a", body(&alice.key_packet(None, 0)), &store)
            .unwrap();
        assert!(outcome.rotated);
        assert!(!outcome.created);
        let stored = store.get_contact(alice.local().uuid()).unwrap().unwrap();
        assert_eq!(stored.shared_secret, outcome.contact.shared_secret);
        assert!(stored.shared_secret.is_some());
    }

    #[test]
    fn own_identity_rejected() {
        let me = identity(1, "me");
        let mut exchanger = KeyExchanger::new(me.clone());
        let store = MemoryStorageManager::new();
        let packet = KeyExchangePacket {
            sender: me.identity().clone(),
            recipient: None,
            seq_num: 0,
        };
        assert!(matches!(
            exchanger.handle_packet("mirror", &packet, &store),
            Err(MuttError::InvalidPacket { .. })
        ));
        assert!(store.get_all_contacts().unwrap().is_empty());
    }

    #[test]
    fn packet_for_someone_else_rejected() {
        let alice = KeyExchanger::new(identity(1, "alice"));
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let store = MemoryStorageManager::new();
        let stray = alice.key_packet(Some(PublicKey::from_bytes([7; 32])), 1);
        assert!(bob.handle_packet("a", body(&stray), &store).is_err());
        assert_eq!(bob.state("a"), None);
    }

    #[test]
    fn trusted_endpoint_answers_fresh_opening() {
        let alice = KeyExchanger::new(identity(1, "alice"));
        let mut bob = KeyExchanger::new(identity(2, "bob"));
        let store = MemoryStorageManager::new();

        let opening = alice.key_packet(None, 0);
        bob.handle_packet("a", body(&opening), &store).unwrap();
        let again = bob.handle_packet("a", body(&opening), &store).unwrap();
        assert!(again.reply.is_some());

        let reply = alice.key_packet(Some(*bob.local().public_key()), 1);
        let quiet = bob.handle_packet("a", body(&reply), &store).unwrap();
        assert!(quiet.reply.is_none());
    }
}
