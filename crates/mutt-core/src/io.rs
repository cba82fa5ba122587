//! Endpoint bookkeeping between the transport and the protocol.
//!
//! Tracks which endpoints are connected (by advertised name), buffers
//! decoded inbound packets per endpoint, encodes outbound packets under the
//! size cap, and remembers which contact sits behind which endpoint once a
//! key exchange has succeeded.
use std::collections::{HashMap, VecDeque};

use mutt_transport::{Endpoint, EndpointId};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MuttError;
use crate::packet::{KeyExchangePacket, Packet};

pub struct IoManager {
    max_packet_size: usize,
    /// Connected endpoints: name → transport id.
    connections: HashMap<String, EndpointId>,
    /// Reverse of `connections`.
    names: HashMap<EndpointId, String>,
    /// Endpoints seen advertising, connected or not.
    discovered: HashMap<EndpointId, Endpoint>,
    /// Decoded packets waiting to be processed, per endpoint name.
    inbound: HashMap<String, VecDeque<Packet>>,
    /// Endpoint names with queued packets, in service order.
    rotation: VecDeque<String>,
    /// Endpoint name → contact uuid, set after key exchange and dropped with
    /// the connection. Names are not unique, so the binding never outlives it.
    identities: HashMap<String, Uuid>,
}

impl IoManager {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            connections: HashMap::new(),
            names: HashMap::new(),
            discovered: HashMap::new(),
            inbound: HashMap::new(),
            rotation: VecDeque::new(),
            identities: HashMap::new(),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    // ── Endpoint lifecycle ──────────────────────────────────────────

    pub fn endpoint_discovered(&mut self, endpoint: Endpoint) {
        self.discovered.insert(endpoint.id().clone(), endpoint);
    }

    pub fn discovered_endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<_> = self.discovered.values().cloned().collect();
        endpoints.sort_by(|a, b| a.id().cmp(b.id()));
        endpoints
    }

    /// Mark an endpoint connected. Returns `false` if it already was.
    ///
    /// A second device advertising a name already in use takes the name over
    /// and starts without an identity.
    pub fn add_available_connection(&mut self, id: EndpointId, name: &str) -> bool {
        if let Some(existing) = self.connections.get(name) {
            if existing == &id {
                return false;
            }
            warn!(name, old = %existing, new = %id, "endpoint name reused, replacing connection");
            self.names.remove(existing);
        }
        self.identities.remove(name);
        self.names.insert(id.clone(), name.to_string());
        self.connections.insert(name.to_string(), id);
        true
    }

    /// Forget a connection by name. Queued packets stay.
    pub fn remove_available_connection(&mut self, name: &str) -> Option<EndpointId> {
        let id = self.connections.remove(name)?;
        self.names.remove(&id);
        self.identities.remove(name);
        Some(id)
    }

    /// Forget a connection by transport id. Returns the name it was known under.
    pub fn remove_connection_by_id(&mut self, id: &EndpointId) -> Option<String> {
        self.discovered.remove(id);
        let name = self.names.remove(id)?;
        self.connections.remove(&name);
        self.identities.remove(&name);
        Some(name)
    }

    pub fn remove_all_available_connections(&mut self) {
        self.connections.clear();
        self.names.clear();
        self.identities.clear();
    }

    pub fn name_for(&self, id: &EndpointId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Names of connected endpoints, sorted.
    pub fn available_connections(&self) -> Vec<String> {
        let mut names: Vec<_> = self.connections.keys().cloned().collect();
        names.sort();
        names
    }

    // ── Identity association ────────────────────────────────────────

    pub fn associate(&mut self, name: &str, uuid: Uuid) {
        self.identities.insert(name.to_string(), uuid);
    }

    pub fn identity_for(&self, name: &str) -> Option<Uuid> {
        self.identities.get(name).copied()
    }

    /// Connected endpoint currently associated with `uuid`.
    pub fn endpoint_for_identity(&self, uuid: Uuid) -> Option<&str> {
        self.identities
            .iter()
            .filter(|(name, id)| **id == uuid && self.connections.contains_key(*name))
            .map(|(name, _)| name.as_str())
            .min()
    }

    pub fn forget_identity(&mut self, uuid: Uuid) {
        self.identities.retain(|_, id| *id != uuid);
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// Queue a decoded packet received from `name`.
    pub fn add_received_message(&mut self, name: &str, packet: Packet) {
        let queue = self.inbound.entry(name.to_string()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(name.to_string());
        }
        queue.push_back(packet);
    }

    /// Size-check and decode a raw frame from a connected endpoint, then queue it.
    pub fn receive_bytes(&mut self, from: &EndpointId, data: &[u8]) -> Result<(), MuttError> {
        if data.len() > self.max_packet_size {
            return Err(MuttError::PayloadTooLarge {
                size: data.len(),
                max: self.max_packet_size,
            });
        }
        let name = self
            .name_for(from)
            .ok_or_else(|| MuttError::IoManager {
                endpoint: from.to_string(),
                reason: "frame from unknown endpoint".into(),
            })?
            .to_string();
        let packet = Packet::from_network_bytes(data)?;
        debug!(endpoint = %name, kind = %packet.kind(), seq = packet.seq_num(), "packet received");
        self.add_received_message(&name, packet);
        Ok(())
    }

    /// Next queued packet, taking endpoints in turn.
    pub fn next_received(&mut self) -> Option<(String, Packet)> {
        while let Some(name) = self.rotation.pop_front() {
            let Some(queue) = self.inbound.get_mut(&name) else {
                continue;
            };
            let Some(packet) = queue.pop_front() else {
                continue;
            };
            if queue.is_empty() {
                self.inbound.remove(&name);
            } else {
                self.rotation.push_back(name.clone());
            }
            return Some((name, packet));
        }
        None
    }

    pub fn has_received(&self) -> bool {
        !self.rotation.is_empty()
    }

    /// The key-exchange body of `packet`, if it is one.
    pub fn is_key_exchange_packet(packet: &Packet) -> Option<&KeyExchangePacket> {
        match packet {
            Packet::KeyExchange(p) => Some(p),
            Packet::Bark(_) => None,
        }
    }

    // ── Outbound ────────────────────────────────────────────────────

    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, MuttError> {
        let bytes = packet.to_network_bytes()?;
        if bytes.len() > self.max_packet_size {
            return Err(MuttError::PayloadTooLarge {
                size: bytes.len(),
                max: self.max_packet_size,
            });
        }
        Ok(bytes)
    }

    /// Encode `packet` for the connected endpoint `name`.
    pub fn prepare_send(&self, name: &str, packet: &Packet) -> Result<(EndpointId, Vec<u8>), MuttError> {
        let id = self
            .connections
            .get(name)
            .ok_or_else(|| MuttError::IoManager {
                endpoint: name.to_string(),
                reason: "no available connection".into(),
            })?;
        Ok((id.clone(), self.encode(packet)?))
    }

    /// Encode `packet` once for every connected endpoint except `except`.
    pub fn prepare_broadcast(
        &self,
        packet: &Packet,
        except: Option<&str>,
    ) -> Result<(Vec<EndpointId>, Vec<u8>), MuttError> {
        let mut targets: Vec<_> = self
            .connections
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .map(|(_, id)| id.clone())
            .collect();
        targets.sort();
        Ok((targets, self.encode(packet)?))
    }
}
