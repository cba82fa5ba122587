use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// Longest plaintext a bark may carry, in characters.
pub const MAX_MESSAGE_CHARS: usize = 160;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── PublicKey ───────────────────────────────────────────────────────

/// X25519 public key. Displayed and parsed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 4 bytes as hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl FromStr for PublicKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

// ── Identity ────────────────────────────────────────────────────────

/// Durable identity of a user: uuid, display name, public key.
///
/// Equality and hashing use the uuid only. The name is a display label and
/// is neither unique nor authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DawgIdentifier {
    uuid: Uuid,
    name: String,
    public_key: PublicKey,
}

impl DawgIdentifier {
    pub fn new(uuid: Uuid, name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            uuid,
            name: name.into(),
            public_key,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl PartialEq for DawgIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Eq for DawgIdentifier {}

impl Hash for DawgIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl fmt::Display for DawgIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

/// Symmetric key shared with one contact.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

// ── Contacts & conversations ────────────────────────────────────────

/// A known peer plus the secret used to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub identity: DawgIdentifier,
    pub shared_secret: Option<SharedSecret>,
    pub added_at: u64,
}

impl Contact {
    pub fn new(identity: DawgIdentifier, shared_secret: Option<SharedSecret>) -> Self {
        Self {
            identity,
            shared_secret,
            added_at: now_ms(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.identity.uuid()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }
}

/// Pairwise history between the local identity and `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub peer: DawgIdentifier,
    pub created_at: u64,
}

/// Dedup and ordering key of a bark: (sender key, recipient key, seq).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarkKey {
    pub src: PublicKey,
    pub dst: PublicKey,
    pub seq_num: u64,
}

impl BarkKey {
    pub fn new(src: PublicKey, dst: PublicKey, seq_num: u64) -> Self {
        Self { src, dst, seq_num }
    }
}

impl fmt::Display for BarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.src.short(), self.dst.short(), self.seq_num)
    }
}

/// A decrypted message as shown in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub author: DawgIdentifier,
    pub recipient_key: PublicKey,
    pub plaintext: String,
    pub order_num: u64,
    pub timestamp: u64,
}

impl Message {
    pub fn key(&self) -> BarkKey {
        BarkKey::new(*self.author.public_key(), self.recipient_key, self.order_num)
    }
}
