use uuid::Uuid;

use crate::types::{BarkKey, PublicKey};

/// Backend errors for Scuttlemutt.
///
/// Wraps transport errors and adds the backend's own failure kinds
/// (contacts, storage, crypto, serialization).
#[derive(Debug, thiserror::Error)]
pub enum MuttError {
    #[error("unknown contact: {uuid}")]
    UnknownContact { uuid: Uuid },

    #[error("payload too large: {size} (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Endpoint missing or send failed. Retryable: the bark stays pending.
    #[error("io manager: {endpoint}: {reason}")]
    IoManager { endpoint: String, reason: String },

    #[error("storage conflict: {key} already exists")]
    StorageConflict { key: BarkKey },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A known contact was offered a key it was not bound to.
    #[error("key conflict: {uuid} offered unknown key {}", offered.short())]
    KeyConflict { uuid: Uuid, offered: PublicKey },

    #[error("invalid packet: {reason}")]
    InvalidPacket { reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] mutt_transport::TransportError),

    #[error("scuttlemutt is shut down")]
    Shutdown,
}

impl MuttError {
    /// Whether the operation may succeed later without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MuttError::IoManager { .. } | MuttError::Transport(_))
    }
}

impl From<rmp_serde::encode::Error> for MuttError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MuttError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MuttError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MuttError::Deserialization(e.to_string())
    }
}

impl From<rusqlite::Error> for MuttError {
    fn from(e: rusqlite::Error) -> Self {
        MuttError::Storage(e.to_string())
    }
}
