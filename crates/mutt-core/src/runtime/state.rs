use std::sync::Arc;
use std::time::Duration;

use mutt_transport::{EndpointId, TransportEvent};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MuttConfig;
use crate::crypto::LocalIdentity;
use crate::error::MuttError;
use crate::io::IoManager;
use crate::keys::KeyExchanger;
use crate::packet::{Bark, KeyExchangePacket, Packet};
use crate::spam::{SpamFilter, SpamLimits, Verdict};
use crate::storage::StorageManager;
use crate::types::{Contact, DawgIdentifier, Message, PublicKey, SharedSecret};

use super::effect::RuntimeEffect;
use super::{ContactIndex, MuttEvent, RuntimeCommand, SendReceipt};

/// Exponential backoff for pending-bark retries.
#[derive(Debug)]
pub(super) struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    next_at: Option<Instant>,
}

impl Backoff {
    pub(super) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
            next_at: None,
        }
    }

    pub(super) fn reset(&mut self) {
        self.current = self.base;
        self.next_at = None;
    }

    pub(super) fn due(&self, now: Instant) -> bool {
        self.next_at.map_or(true, |at| now >= at)
    }

    /// Schedule the next attempt and double the delay, up to the ceiling.
    pub(super) fn step(&mut self, now: Instant) {
        self.next_at = Some(now + self.current);
        self.current = (self.current * 2).min(self.max);
    }

    pub(super) fn current(&self) -> Duration {
        self.current
    }
}

/// All mutable protocol state of one instance.
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`; none of
/// them touches the network. Storage writes happen here, synchronously.
pub(super) struct CoreState {
    pub(super) config: MuttConfig,
    storage: Arc<dyn StorageManager>,
    io: IoManager,
    keys: KeyExchanger,
    contacts: watch::Sender<Arc<ContactIndex>>,
    spam: SpamFilter,
    pub(super) backoff: Backoff,
}

impl CoreState {
    pub(super) fn new(
        local: LocalIdentity,
        storage: Arc<dyn StorageManager>,
        config: MuttConfig,
        max_packet_size: usize,
    ) -> Result<Self, MuttError> {
        let index = ContactIndex::new(storage.get_all_contacts()?);
        let (contacts, _) = watch::channel(Arc::new(index));
        Ok(Self {
            backoff: Backoff::new(config.retry_interval, config.max_retry_interval),
            io: IoManager::new(max_packet_size),
            keys: KeyExchanger::new(local),
            spam: SpamFilter::new(SpamLimits::from_config(&config)),
            contacts,
            storage,
            config,
        })
    }

    pub(super) fn storage(&self) -> &dyn StorageManager {
        self.storage.as_ref()
    }

    pub(super) fn subscribe_contacts(&self) -> watch::Receiver<Arc<ContactIndex>> {
        self.contacts.subscribe()
    }

    fn local(&self) -> &LocalIdentity {
        self.keys.local()
    }

    fn local_key(&self) -> PublicKey {
        *self.local().public_key()
    }

    /// Rebuild and publish the contact snapshot from storage.
    fn refresh_contacts(&mut self) -> Result<(), MuttError> {
        let index = ContactIndex::new(self.storage.get_all_contacts()?);
        self.contacts.send_replace(Arc::new(index));
        Ok(())
    }

    fn nickname_check(&self, identity: &DawgIdentifier) -> Vec<RuntimeEffect> {
        match self.storage.get_contacts_by_nickname(identity.name()) {
            Ok(same) if same.len() > 1 => {
                let uuids: Vec<Uuid> = same.iter().map(Contact::uuid).collect();
                warn!(name = identity.name(), count = uuids.len(), "nickname shared by several contacts");
                vec![RuntimeEffect::Emit(MuttEvent::NicknameCollision {
                    name: identity.name().to_string(),
                    uuids,
                })]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![error_effect(format!("nickname lookup failed: {e}"))],
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    pub(super) fn handle_command(&mut self, cmd: RuntimeCommand) -> Vec<RuntimeEffect> {
        match cmd {
            RuntimeCommand::SendMessage {
                plaintext,
                destination,
                reply,
            } => {
                let (result, mut effects) = self.send_message(&plaintext, destination);
                effects.push(respond(reply, result));
                effects
            }
            RuntimeCommand::AddContact {
                identity,
                shared_secret,
                reply,
            } => {
                let (result, mut effects) = self.add_contact(identity, shared_secret);
                effects.push(respond(reply, result));
                effects
            }
            RuntimeCommand::DeleteContact { uuid, reply } => {
                let (result, mut effects) = match self.delete_contact(uuid) {
                    Ok((removed, effects)) => (Ok(removed), effects),
                    Err(e) => (Err(e), Vec::new()),
                };
                effects.push(respond(reply, result));
                effects
            }
            RuntimeCommand::SendKeys { endpoint, reply } => {
                let (result, mut effects) = match self.send_keys(&endpoint) {
                    Ok(effects) => (Ok(()), effects),
                    Err(e) => (Err(e), Vec::new()),
                };
                effects.push(respond(reply, result));
                effects
            }
            RuntimeCommand::ConnectedEndpoints { reply } => {
                vec![respond(reply, self.io.available_connections())]
            }
            // handled by the loop
            RuntimeCommand::Shutdown => Vec::new(),
        }
    }

    /// Encrypt, store and route one message.
    pub(super) fn send_message(
        &mut self,
        plaintext: &str,
        destination: Uuid,
    ) -> (Result<SendReceipt, MuttError>, Vec<RuntimeEffect>) {
        match self.try_send_message(plaintext, destination) {
            Ok((receipt, effects)) => (Ok(receipt), effects),
            Err(e) => (Err(e), Vec::new()),
        }
    }

    fn try_send_message(
        &mut self,
        plaintext: &str,
        destination: Uuid,
    ) -> Result<(SendReceipt, Vec<RuntimeEffect>), MuttError> {
        let chars = plaintext.chars().count();
        if chars > self.config.max_message_chars {
            return Err(MuttError::PayloadTooLarge {
                size: chars,
                max: self.config.max_message_chars,
            });
        }

        let contact = self
            .storage
            .get_contact(destination)?
            .ok_or(MuttError::UnknownContact { uuid: destination })?;
        let secret = contact
            .shared_secret
            .as_ref()
            .ok_or(MuttError::UnknownContact { uuid: destination })?;

        let src = self.local_key();
        let dst = *contact.public_key();
        let seq_num = self
            .storage
            .get_last_seq_num(&src, &dst)?
            .map_or(1, |last| last + 1);
        let bark = Bark::seal(src, dst, seq_num, plaintext, secret)?;

        let wire_size = Packet::Bark(bark.clone()).to_network_bytes()?.len();
        if wire_size > self.io.max_packet_size() {
            return Err(MuttError::PayloadTooLarge {
                size: wire_size,
                max: self.io.max_packet_size(),
            });
        }

        let to_self = destination == self.local().uuid();
        self.storage.insert_bark(&bark, !to_self)?;
        let message = Message {
            author: self.local().identity().clone(),
            recipient_key: dst,
            plaintext: plaintext.to_string(),
            order_num: seq_num,
            timestamp: bark.timestamp,
        };
        self.storage.append_message(&contact.identity, &message)?;

        let key = bark.key();
        debug!(%key, to = %contact.identity, "bark stored");
        if to_self {
            return Ok((
                SendReceipt {
                    key,
                    dispatched: false,
                    placeholder: false,
                },
                Vec::new(),
            ));
        }

        let mut effects = self.route_bark(&bark, destination, None)?;
        let dispatched = !effects.is_empty();
        if !dispatched {
            effects.push(RuntimeEffect::Emit(MuttEvent::DeliveryDeferred {
                key,
                reason: "no route to contact".into(),
            }));
        }
        Ok((
            SendReceipt {
                key,
                dispatched,
                placeholder: false,
            },
            effects,
        ))
    }

    /// Effects that hand `bark` to the network, or none when unreachable.
    ///
    /// Direct send when the contact's endpoint is connected; only that
    /// clears the pending flag. Otherwise a mesh hand-off to every connected
    /// endpoint, or to `mesh_to` alone, and the bark stays pending.
    fn route_bark(
        &self,
        bark: &Bark,
        destination: Uuid,
        mesh_to: Option<&str>,
    ) -> Result<Vec<RuntimeEffect>, MuttError> {
        let key = bark.key();
        let packet = Packet::Bark(bark.clone());

        if let Some(name) = self.io.endpoint_for_identity(destination) {
            let (target, data) = self.io.prepare_send(name, &packet)?;
            return Ok(vec![RuntimeEffect::SendWithFallback {
                target,
                data,
                on_success: vec![
                    RuntimeEffect::MarkSent(key),
                    RuntimeEffect::Emit(MuttEvent::Delivered { key }),
                ],
                on_failure: vec![RuntimeEffect::Emit(MuttEvent::DeliveryDeferred {
                    key,
                    reason: format!("send to {name} failed"),
                })],
            }]);
        }

        if !self.config.mesh_relay {
            return Ok(Vec::new());
        }
        let (targets, data) = match mesh_to {
            Some(name) => {
                let (target, data) = self.io.prepare_send(name, &packet)?;
                (vec![target], data)
            }
            None => self.io.prepare_broadcast(&packet, None)?,
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![RuntimeEffect::Broadcast {
            targets,
            data,
            on_success: vec![RuntimeEffect::Emit(MuttEvent::HandedToMesh { key })],
            on_failure: vec![RuntimeEffect::Emit(MuttEvent::DeliveryDeferred {
                key,
                reason: "every mesh send failed".into(),
            })],
        }])
    }

    /// Route pending barks, optionally only those for `dst`.
    fn flush_pending(&self, dst: Option<&PublicKey>, mesh_to: Option<&str>) -> Vec<RuntimeEffect> {
        let pending = match self.storage.pending_barks(dst) {
            Ok(pending) => pending,
            Err(e) => return vec![error_effect(format!("pending scan failed: {e}"))],
        };
        let mut effects = Vec::new();
        for bark in pending {
            let Ok(Some(contact)) = self.storage.get_contact_by_key(&bark.dst) else {
                continue;
            };
            match self.route_bark(&bark, contact.uuid(), mesh_to) {
                Ok(routed) => effects.extend(routed),
                Err(e) => effects.push(error_effect(format!("retry of {} failed: {e}", bark.key()))),
            }
        }
        effects
    }

    pub(super) fn add_contact(
        &mut self,
        identity: DawgIdentifier,
        shared_secret: Option<SharedSecret>,
    ) -> (Result<bool, MuttError>, Vec<RuntimeEffect>) {
        let secret = match shared_secret {
            Some(secret) => secret,
            None => match self.local().shared_secret_with(&identity) {
                Ok(secret) => secret,
                Err(e) => return (Err(e), Vec::new()),
            },
        };
        let created = match self
            .storage
            .insert_contact(&Contact::new(identity.clone(), Some(secret)))
        {
            Ok(created) => created,
            Err(e) => return (Err(e), Vec::new()),
        };
        if !created {
            return (Ok(false), Vec::new());
        }
        info!(contact = %identity, "contact added");
        if let Err(e) = self.refresh_contacts() {
            return (Err(e), Vec::new());
        }
        let mut effects = self.nickname_check(&identity);
        effects.extend(self.flush_pending(Some(identity.public_key()), None));
        (Ok(true), effects)
    }

    /// Remove a contact; its pending barks are abandoned and reported.
    pub(super) fn delete_contact(&mut self, uuid: Uuid) -> Result<(bool, Vec<RuntimeEffect>), MuttError> {
        let Some(contact) = self.storage.get_contact(uuid)? else {
            return Ok((false, Vec::new()));
        };
        if !self.storage.delete_contact(uuid)? {
            return Ok((false, Vec::new()));
        }
        self.io.forget_identity(uuid);
        self.refresh_contacts()?;
        info!(%uuid, "contact deleted");

        let mut effects = Vec::new();
        for bark in self.storage.pending_barks(Some(contact.public_key()))? {
            let key = bark.key();
            self.storage.mark_bark_sent(&key)?;
            effects.push(RuntimeEffect::Emit(MuttEvent::DeliveryAbandoned {
                key,
                reason: format!("contact {} deleted", contact.identity),
            }));
        }
        Ok((true, effects))
    }

    pub(super) fn send_keys(&mut self, endpoint: &str) -> Result<Vec<RuntimeEffect>, MuttError> {
        if !self.io.is_connected(endpoint) {
            return Err(MuttError::IoManager {
                endpoint: endpoint.to_string(),
                reason: "no available connection".into(),
            });
        }
        let packet = self.keys.send_keys(endpoint);
        let (target, data) = self.io.prepare_send(endpoint, &packet)?;
        debug!(endpoint, "sending keys");
        Ok(vec![RuntimeEffect::Send { target, data }])
    }

    // ── Transport events ────────────────────────────────────────────

    pub(super) fn handle_transport_event(&mut self, event: TransportEvent) -> Vec<RuntimeEffect> {
        match event {
            TransportEvent::EndpointDiscovered(endpoint) => {
                let name = endpoint.name().to_string();
                self.io.endpoint_discovered(endpoint);
                self.keys.discovered(&name);
                vec![RuntimeEffect::Emit(MuttEvent::EndpointDiscovered { endpoint: name })]
            }
            TransportEvent::EndpointConnected(endpoint) => {
                let name = endpoint.name().to_string();
                self.io.endpoint_discovered(endpoint.clone());
                if !self.io.add_available_connection(endpoint.id().clone(), &name) {
                    return Vec::new();
                }
                self.keys.discovered(&name);
                info!(endpoint = %name, "endpoint connected");

                let mut effects = vec![RuntimeEffect::Emit(MuttEvent::EndpointConnected {
                    endpoint: name.clone(),
                })];
                if self.config.auto_key_exchange {
                    match self.send_keys(&name) {
                        Ok(send) => effects.extend(send),
                        Err(e) => effects.push(error_effect(format!("key exchange with {name}: {e}"))),
                    }
                }
                if self.config.mesh_relay {
                    // only the newcomer: everyone else already has them
                    effects.extend(self.flush_pending(None, Some(&name)));
                }
                effects
            }
            TransportEvent::EndpointDisconnected { id } => self.endpoint_lost(&id),
            TransportEvent::ConnectionFailed { id, reason } => {
                let mut effects = vec![error_effect(format!("connection to {id} failed: {reason}"))];
                effects.extend(self.endpoint_lost(&id));
                effects
            }
            TransportEvent::Received { from, data } => {
                if let Err(e) = self.io.receive_bytes(&from, &data) {
                    debug!(endpoint = %from, error = %e, "dropping frame");
                    return vec![error_effect(format!("bad frame from {from}: {e}"))];
                }
                self.drain_received()
            }
        }
    }

    fn endpoint_lost(&mut self, id: &EndpointId) -> Vec<RuntimeEffect> {
        match self.io.remove_connection_by_id(id) {
            Some(name) => {
                self.keys.forget(&name);
                info!(endpoint = %name, "endpoint lost");
                vec![RuntimeEffect::Emit(MuttEvent::EndpointLost { endpoint: name })]
            }
            None => Vec::new(),
        }
    }

    /// Process every queued inbound packet.
    pub(super) fn drain_received(&mut self) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        while let Some((endpoint, packet)) = self.io.next_received() {
            match packet {
                Packet::KeyExchange(p) => effects.extend(self.handle_key_exchange(&endpoint, &p)),
                Packet::Bark(bark) => effects.extend(self.handle_bark(&endpoint, bark)),
            }
        }
        effects
    }

    fn handle_key_exchange(&mut self, endpoint: &str, packet: &KeyExchangePacket) -> Vec<RuntimeEffect> {
        let outcome = match self.keys.handle_packet(endpoint, packet, self.storage.as_ref()) {
            Ok(outcome) => outcome,
            Err(MuttError::KeyConflict { uuid, offered }) => {
                return vec![RuntimeEffect::Emit(MuttEvent::KeyConflict {
                    endpoint: endpoint.to_string(),
                    contact: uuid,
                    offered,
                })];
            }
            Err(e) => {
                warn!(endpoint, error = %e, "key exchange rejected");
                return vec![error_effect(format!("key exchange with {endpoint}: {e}"))];
            }
        };

        let uuid = outcome.contact.uuid();
        self.io.associate(endpoint, uuid);
        let mut effects = Vec::new();

        if outcome.created || outcome.rotated {
            if let Err(e) = self.refresh_contacts() {
                effects.push(error_effect(format!("contact refresh failed: {e}")));
            }
        }
        if outcome.created {
            effects.extend(self.nickname_check(&outcome.contact.identity));
        }
        if let Some(reply) = &outcome.reply {
            match self.io.prepare_send(endpoint, reply) {
                Ok((target, data)) => effects.push(RuntimeEffect::Send { target, data }),
                Err(e) => effects.push(error_effect(format!("key reply to {endpoint}: {e}"))),
            }
        }
        effects.push(RuntimeEffect::Emit(MuttEvent::KeyExchangeCompleted {
            endpoint: endpoint.to_string(),
            contact: outcome.contact.identity.clone(),
            created: outcome.created,
        }));

        self.backoff.reset();
        effects.extend(self.flush_pending(Some(outcome.contact.public_key()), None));
        effects
    }

    fn handle_bark(&mut self, endpoint: &str, bark: Bark) -> Vec<RuntimeEffect> {
        let key = bark.key();
        if self.spam.is_banned(endpoint) {
            debug!(%key, endpoint, "bark from banned endpoint dropped");
            return Vec::new();
        }
        if bark.dst != self.local_key() {
            return self.relay_bark(endpoint, bark);
        }

        match self.storage.has_bark(&key) {
            Ok(true) => {
                debug!(%key, "duplicate bark dropped");
                return Vec::new();
            }
            Ok(false) => {}
            Err(e) => return vec![error_effect(format!("bark lookup failed: {e}"))],
        }

        let contact = match self.storage.get_contact_by_key(&bark.src) {
            Ok(Some(contact)) => contact,
            Ok(None) => {
                debug!(%key, endpoint, "bark from unknown sender dropped");
                return vec![error_effect(format!("bark {key} from unknown sender"))];
            }
            Err(e) => return vec![error_effect(format!("contact lookup failed: {e}"))],
        };
        let Some(secret) = contact.shared_secret.as_ref() else {
            return vec![error_effect(format!("no shared secret with {}", contact.identity))];
        };
        let plaintext = match bark.open(secret) {
            Ok(plaintext) => plaintext,
            Err(e) => return vec![error_effect(format!("bark {key} rejected: {e}"))],
        };

        match self.storage.insert_bark(&bark, false) {
            Ok(()) => {}
            Err(MuttError::StorageConflict { .. }) => return Vec::new(),
            Err(e) => return vec![error_effect(format!("storing bark {key} failed: {e}"))],
        }
        let message = Message {
            author: contact.identity.clone(),
            recipient_key: bark.dst,
            plaintext: plaintext.clone(),
            order_num: bark.seq_num,
            timestamp: bark.timestamp,
        };
        if let Err(e) = self.storage.append_message(&contact.identity, &message) {
            return vec![error_effect(format!("storing message {key} failed: {e}"))];
        }

        debug!(%key, from = %contact.identity, "bark received");
        vec![RuntimeEffect::Emit(MuttEvent::MessageReceived {
            from: contact.identity,
            key,
            plaintext,
        })]
    }

    /// Forward a bark addressed to someone else, once.
    fn relay_bark(&mut self, endpoint: &str, mut bark: Bark) -> Vec<RuntimeEffect> {
        let key = bark.key();
        if !self.config.mesh_relay || bark.src == self.local_key() || bark.ttl == 0 {
            return Vec::new();
        }
        if let Verdict::Banned { reason } = self.spam.check(endpoint, &key, Instant::now()) {
            return reason
                .map(|reason| {
                    RuntimeEffect::Emit(MuttEvent::EndpointBanned {
                        endpoint: endpoint.to_string(),
                        reason,
                    })
                })
                .into_iter()
                .collect();
        }
        // remembering the bark is what makes each relay happen once
        match self.storage.insert_bark(&bark, false) {
            Ok(()) => {}
            Err(MuttError::StorageConflict { .. }) => return Vec::new(),
            Err(e) => return vec![error_effect(format!("storing relayed bark failed: {e}"))],
        }

        bark.ttl -= 1;
        match self.io.prepare_broadcast(&Packet::Bark(bark), Some(endpoint)) {
            Ok((targets, _)) if targets.is_empty() => Vec::new(),
            Ok((targets, data)) => {
                debug!(%key, hops = targets.len(), "relaying bark");
                vec![RuntimeEffect::Broadcast {
                    targets,
                    data,
                    on_success: vec![RuntimeEffect::Emit(MuttEvent::Relayed { key })],
                    on_failure: Vec::new(),
                }]
            }
            Err(e) => vec![error_effect(format!("relay of {key} failed: {e}"))],
        }
    }

    // ── Ticks ───────────────────────────────────────────────────────

    /// Retry pending barks when the backoff allows it.
    pub(super) fn tick_retry(&mut self, now: Instant) -> Vec<RuntimeEffect> {
        match self.storage.pending_barks(None) {
            Ok(pending) if pending.is_empty() => {
                self.backoff.reset();
                return Vec::new();
            }
            Ok(_) => {}
            Err(e) => return vec![error_effect(format!("pending scan failed: {e}"))],
        }
        if !self.backoff.due(now) {
            return Vec::new();
        }
        self.backoff.step(now);
        debug!(next_in = ?self.backoff.current(), "retrying pending barks");
        self.flush_pending(None, None)
    }
}

fn error_effect(description: String) -> RuntimeEffect {
    RuntimeEffect::Emit(MuttEvent::Error { description })
}

fn respond<R: Send + 'static>(reply: tokio::sync::oneshot::Sender<R>, value: R) -> RuntimeEffect {
    RuntimeEffect::Reply(Box::new(move || {
        let _ = reply.send(value);
    }))
}
