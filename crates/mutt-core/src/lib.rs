//! Scuttlemutt backend.
//!
//! Pairs nearby devices through a key exchange, sends end-to-end encrypted
//! text ("barks") over whatever [`mutt_transport::Transport`] is plugged in,
//! and keeps contacts, barks and conversations in local storage.
//!
//! Wire format: MessagePack (compact binary), versioned.
//! Crypto: X25519 + HKDF-SHA256 shared secrets, XChaCha20-Poly1305 barks.

pub mod config;
pub mod crypto;
pub mod error;
pub mod io;
pub mod keys;
pub mod packet;
pub mod runtime;
pub mod spam;
pub mod storage;
pub mod types;

pub use config::MuttConfig;
pub use crypto::{EncryptedPayload, KeyPair, LocalIdentity};
pub use error::MuttError;
pub use io::IoManager;
pub use keys::{ExchangeState, KeyExchangeOutcome, KeyExchanger};
pub use packet::{Bark, KeyExchangePacket, Packet, PacketKind};
pub use runtime::{ContactIndex, MuttChannels, MuttEvent, Scuttlemutt, SendReceipt};
pub use spam::{SpamFilter, SpamLimits, Verdict};
pub use storage::{
    open_storage, ConversationSwitcher, ConversationUpdate, ConversationWatcher,
    MemoryStorageManager, SqliteStorageManager, StorageChange, StorageManager,
};
pub use types::{
    BarkKey, Contact, Conversation, DawgIdentifier, Message, PublicKey, SharedSecret,
    MAX_MESSAGE_CHARS,
};
