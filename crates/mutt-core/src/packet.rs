use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{self, EncryptedPayload};
use crate::error::MuttError;
use crate::types::{now_ms, BarkKey, DawgIdentifier, PublicKey, SharedSecret};

/// Wire format version. Frames carrying any other version are rejected.
pub const WIRE_VERSION: u8 = 1;

/// Relay budget for a fresh bark.
pub const DEFAULT_TTL: u8 = 4;

/// Largest sequence number or timestamp a frame may carry. Storage keeps
/// both as signed 64-bit integers.
pub const MAX_WIRE_INT: u64 = i64::MAX as u64;

/// Packet kind, for logs and dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    KeyExchange,
    Bark,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::KeyExchange => f.write_str("key-exchange"),
            PacketKind::Bark => f.write_str("bark"),
        }
    }
}

/// Handshake packet carrying the sender's identity and public key.
///
/// `recipient` is `None` when the sender does not yet know who is on the
/// other end of the endpoint (first packet of an exchange).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangePacket {
    pub sender: DawgIdentifier,
    pub recipient: Option<PublicKey>,
    /// Handshake step: 0 for an opening packet, 1 for a reply.
    pub seq_num: u64,
}

/// One encrypted message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bark {
    pub src: PublicKey,
    pub dst: PublicKey,
    pub seq_num: u64,
    /// Sender clock, Unix milliseconds.
    pub timestamp: u64,
    /// Remaining relay hops. Not authenticated; relays decrement it.
    pub ttl: u8,
    pub payload: EncryptedPayload,
}

impl Bark {
    /// Encrypt `plaintext` from `src` to `dst` as bark number `seq_num`.
    pub fn seal(
        src: PublicKey,
        dst: PublicKey,
        seq_num: u64,
        plaintext: &str,
        secret: &SharedSecret,
    ) -> Result<Self, MuttError> {
        let timestamp = now_ms();
        let key = BarkKey::new(src, dst, seq_num);
        let payload = crypto::encrypt(
            secret,
            plaintext.as_bytes(),
            &crypto::bark_aad(&key, timestamp),
        )?;
        Ok(Self {
            src,
            dst,
            seq_num,
            timestamp,
            ttl: DEFAULT_TTL,
            payload,
        })
    }

    /// Decrypt the body. Fails if the header was altered or the secret is wrong.
    pub fn open(&self, secret: &SharedSecret) -> Result<String, MuttError> {
        let bytes = crypto::decrypt(
            secret,
            &self.payload,
            &crypto::bark_aad(&self.key(), self.timestamp),
        )?;
        String::from_utf8(bytes).map_err(|_| MuttError::InvalidPacket {
            reason: "bark body is not utf-8".into(),
        })
    }

    pub fn key(&self) -> BarkKey {
        BarkKey::new(self.src, self.dst, self.seq_num)
    }
}

/// Everything that travels between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    KeyExchange(KeyExchangePacket),
    Bark(Bark),
}

#[derive(Serialize)]
struct FrameRef<'a> {
    version: u8,
    packet: &'a Packet,
}

#[derive(Deserialize)]
struct Frame {
    version: u8,
    packet: Packet,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::KeyExchange(_) => PacketKind::KeyExchange,
            Packet::Bark(_) => PacketKind::Bark,
        }
    }

    /// Sender public key.
    pub fn src(&self) -> &PublicKey {
        match self {
            Packet::KeyExchange(p) => p.sender.public_key(),
            Packet::Bark(b) => &b.src,
        }
    }

    /// Recipient public key, when the sender knows it.
    pub fn dst(&self) -> Option<&PublicKey> {
        match self {
            Packet::KeyExchange(p) => p.recipient.as_ref(),
            Packet::Bark(b) => Some(&b.dst),
        }
    }

    pub fn seq_num(&self) -> u64 {
        match self {
            Packet::KeyExchange(p) => p.seq_num,
            Packet::Bark(b) => b.seq_num,
        }
    }

    /// Serialize to a versioned MessagePack frame.
    pub fn to_network_bytes(&self) -> Result<Vec<u8>, MuttError> {
        let frame = FrameRef {
            version: WIRE_VERSION,
            packet: self,
        };
        rmp_serde::to_vec(&frame).map_err(Into::into)
    }

    /// Parse a frame produced by [`to_network_bytes`](Packet::to_network_bytes).
    pub fn from_network_bytes(data: &[u8]) -> Result<Self, MuttError> {
        let frame: Frame = rmp_serde::from_slice(data)?;
        if frame.version != WIRE_VERSION {
            return Err(MuttError::InvalidPacket {
                reason: format!("unsupported wire version {}", frame.version),
            });
        }
        if let Packet::Bark(bark) = &frame.packet {
            if bark.seq_num > MAX_WIRE_INT || bark.timestamp > MAX_WIRE_INT {
                return Err(MuttError::InvalidPacket {
                    reason: format!("bark {} out of range (timestamp {})", bark.key(), bark.timestamp),
                });
            }
        }
        Ok(frame.packet)
    }
}
