use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use super::{sort_messages, ChangeFeed, StorageChange, StorageManager};
use crate::crypto::{EncryptedPayload, LocalIdentity};
use crate::error::MuttError;
use crate::packet::Bark;
use crate::types::{
    now_ms, BarkKey, Contact, Conversation, DawgIdentifier, Message, PublicKey, SharedSecret,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS local_identity (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    uuid TEXT NOT NULL,
    name TEXT NOT NULL,
    secret BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS contacts (
    uuid TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    public_key BLOB NOT NULL,
    shared_secret BLOB,
    added_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS contacts_by_key ON contacts(public_key);
CREATE INDEX IF NOT EXISTS contacts_by_name ON contacts(name);
CREATE TABLE IF NOT EXISTS barks (
    src BLOB NOT NULL,
    dst BLOB NOT NULL,
    seq_num INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    ttl INTEGER NOT NULL,
    nonce BLOB NOT NULL,
    ciphertext BLOB NOT NULL,
    pending INTEGER NOT NULL,
    PRIMARY KEY (src, dst, seq_num)
);
CREATE INDEX IF NOT EXISTS barks_pending ON barks(pending, dst, seq_num);
CREATE TABLE IF NOT EXISTS conversations (
    peer_uuid TEXT PRIMARY KEY,
    peer_name TEXT NOT NULL,
    peer_key BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    peer_uuid TEXT NOT NULL,
    author_uuid TEXT NOT NULL,
    author_name TEXT NOT NULL,
    author_key BLOB NOT NULL,
    recipient_key BLOB NOT NULL,
    order_num INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    plaintext TEXT NOT NULL,
    PRIMARY KEY (author_key, recipient_key, order_num)
);
CREATE INDEX IF NOT EXISTS messages_by_peer ON messages(peer_uuid);
";

const CONTACT_COLUMNS: &str = "uuid, name, public_key, shared_secret, added_at";
const BARK_COLUMNS: &str = "src, dst, seq_num, timestamp, ttl, nonce, ciphertext";

/// SQLite-backed store.
///
/// Integers are stored as `i64`; sequence numbers and timestamps never come
/// close to `i64::MAX`, so the casts round-trip.
pub struct SqliteStorageManager {
    conn: Mutex<Connection>,
    feed: ChangeFeed,
}

impl SqliteStorageManager {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MuttError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "opened scuttlemutt database");
        Self::with_connection(conn)
    }

    /// Private in-memory database, for tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self, MuttError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, MuttError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feed: ChangeFeed::new(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Row decoding ────────────────────────────────────────────────────

fn conversion_error(idx: usize, ty: Type, msg: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, msg.to_string().into())
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bytes32_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; 32]> {
    let blob: Vec<u8> = row.get(idx)?;
    blob.try_into()
        .map_err(|_| conversion_error(idx, Type::Blob, "expected 32 bytes"))
}

fn key_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<PublicKey> {
    bytes32_at(row, idx).map(PublicKey::from_bytes)
}

fn u64_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|v| v as u64)
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    let secret: Option<Vec<u8>> = row.get(3)?;
    let shared_secret = match secret {
        Some(blob) => Some(SharedSecret::from_bytes(
            blob.try_into()
                .map_err(|_| conversion_error(3, Type::Blob, "expected 32-byte secret"))?,
        )),
        None => None,
    };
    Ok(Contact {
        identity: DawgIdentifier::new(uuid_at(row, 0)?, row.get::<_, String>(1)?, key_at(row, 2)?),
        shared_secret,
        added_at: u64_at(row, 4)?,
    })
}

fn bark_from_row(row: &Row<'_>) -> rusqlite::Result<Bark> {
    let nonce: Vec<u8> = row.get(5)?;
    Ok(Bark {
        src: key_at(row, 0)?,
        dst: key_at(row, 1)?,
        seq_num: u64_at(row, 2)?,
        timestamp: u64_at(row, 3)?,
        ttl: row.get(4)?,
        payload: EncryptedPayload {
            nonce: nonce
                .try_into()
                .map_err(|_| conversion_error(5, Type::Blob, "expected 24-byte nonce"))?,
            ciphertext: row.get(6)?,
        },
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        peer: DawgIdentifier::new(uuid_at(row, 0)?, row.get::<_, String>(1)?, key_at(row, 2)?),
        created_at: u64_at(row, 3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        author: DawgIdentifier::new(uuid_at(row, 0)?, row.get::<_, String>(1)?, key_at(row, 2)?),
        recipient_key: key_at(row, 3)?,
        order_num: u64_at(row, 4)?,
        timestamp: u64_at(row, 5)?,
        plaintext: row.get(6)?,
    })
}

impl StorageManager for SqliteStorageManager {
    fn load_local_identity(&self) -> Result<Option<LocalIdentity>, MuttError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT uuid, name, secret FROM local_identity WHERE id = 0",
                [],
                |row| Ok((uuid_at(row, 0)?, row.get::<_, String>(1)?, bytes32_at(row, 2)?)),
            )
            .optional()?;
        Ok(row.map(|(uuid, name, secret)| LocalIdentity::from_parts(uuid, name, secret)))
    }

    fn store_local_identity(&self, identity: &LocalIdentity) -> Result<(), MuttError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO local_identity (id, uuid, name, secret) VALUES (0, ?1, ?2, ?3)",
            params![
                identity.uuid().to_string(),
                identity.identity().name(),
                identity.secret_bytes().to_vec()
            ],
        )?;
        Ok(())
    }

    fn insert_contact(&self, contact: &Contact) -> Result<bool, MuttError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO contacts (uuid, name, public_key, shared_secret, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                contact.uuid().to_string(),
                contact.identity.name(),
                contact.public_key().as_bytes().to_vec(),
                contact.shared_secret.as_ref().map(|s| s.as_bytes().to_vec()),
                contact.added_at as i64,
            ],
        )?;
        if inserted == 1 {
            self.feed.publish(StorageChange::ContactAdded(contact.uuid()));
        }
        Ok(inserted == 1)
    }

    fn rotate_contact_keys(
        &self,
        identity: &DawgIdentifier,
        shared_secret: Option<SharedSecret>,
    ) -> Result<(), MuttError> {
        let updated = self.conn().execute(
            "UPDATE contacts SET name = ?2, public_key = ?3, shared_secret = ?4 WHERE uuid = ?1",
            params![
                identity.uuid().to_string(),
                identity.name(),
                identity.public_key().as_bytes().to_vec(),
                shared_secret.as_ref().map(|s| s.as_bytes().to_vec()),
            ],
        )?;
        if updated == 0 {
            return Err(MuttError::UnknownContact {
                uuid: identity.uuid(),
            });
        }
        self.feed.publish(StorageChange::ContactUpdated(identity.uuid()));
        Ok(())
    }

    fn get_contact(&self, uuid: Uuid) -> Result<Option<Contact>, MuttError> {
        let conn = self.conn();
        let contact = conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE uuid = ?1"),
                [uuid.to_string()],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    fn get_contact_by_key(&self, key: &PublicKey) -> Result<Option<Contact>, MuttError> {
        let conn = self.conn();
        let contact = conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE public_key = ?1 ORDER BY uuid LIMIT 1"),
                [key.as_bytes().to_vec()],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    fn get_contacts_by_nickname(&self, name: &str) -> Result<Vec<Contact>, MuttError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE name = ?1 ORDER BY uuid"
        ))?;
        let rows = stmt.query_map([name], contact_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_all_contacts(&self) -> Result<Vec<Contact>, MuttError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY uuid"))?;
        let rows = stmt.query_map([], contact_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn delete_contact(&self, uuid: Uuid) -> Result<bool, MuttError> {
        let removed = self
            .conn()
            .execute("DELETE FROM contacts WHERE uuid = ?1", [uuid.to_string()])?;
        if removed > 0 {
            self.feed.publish(StorageChange::ContactRemoved(uuid));
        }
        Ok(removed > 0)
    }

    fn insert_bark(&self, bark: &Bark, pending: bool) -> Result<(), MuttError> {
        let inserted = self.conn().execute(
            &format!("INSERT OR IGNORE INTO barks ({BARK_COLUMNS}, pending) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                bark.src.as_bytes().to_vec(),
                bark.dst.as_bytes().to_vec(),
                bark.seq_num as i64,
                bark.timestamp as i64,
                bark.ttl,
                bark.payload.nonce.to_vec(),
                bark.payload.ciphertext,
                pending,
            ],
        )?;
        if inserted == 0 {
            return Err(MuttError::StorageConflict { key: bark.key() });
        }
        Ok(())
    }

    fn has_bark(&self, key: &BarkKey) -> Result<bool, MuttError> {
        let conn = self.conn();
        let found = conn
            .query_row(
                "SELECT 1 FROM barks WHERE src = ?1 AND dst = ?2 AND seq_num = ?3",
                params![key.src.as_bytes().to_vec(), key.dst.as_bytes().to_vec(), key.seq_num as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get_barks(&self, src: &PublicKey, dst: &PublicKey) -> Result<Vec<Bark>, MuttError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BARK_COLUMNS} FROM barks WHERE src = ?1 AND dst = ?2 ORDER BY seq_num DESC"
        ))?;
        let rows = stmt.query_map(
            params![src.as_bytes().to_vec(), dst.as_bytes().to_vec()],
            bark_from_row,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_last_seq_num(&self, src: &PublicKey, dst: &PublicKey) -> Result<Option<u64>, MuttError> {
        let last: Option<i64> = self.conn().query_row(
            "SELECT MAX(seq_num) FROM barks WHERE src = ?1 AND dst = ?2",
            params![src.as_bytes().to_vec(), dst.as_bytes().to_vec()],
            |row| row.get(0),
        )?;
        Ok(last.map(|v| v as u64))
    }

    fn pending_barks(&self, dst: Option<&PublicKey>) -> Result<Vec<Bark>, MuttError> {
        let conn = self.conn();
        let barks = match dst {
            Some(dst) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {BARK_COLUMNS} FROM barks WHERE pending = 1 AND dst = ?1 ORDER BY seq_num"
                ))?;
                let rows = stmt.query_map([dst.as_bytes().to_vec()], bark_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {BARK_COLUMNS} FROM barks WHERE pending = 1 ORDER BY dst, seq_num"
                ))?;
                let rows = stmt.query_map([], bark_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(barks)
    }

    fn mark_bark_sent(&self, key: &BarkKey) -> Result<(), MuttError> {
        self.conn().execute(
            "UPDATE barks SET pending = 0 WHERE src = ?1 AND dst = ?2 AND seq_num = ?3",
            params![key.src.as_bytes().to_vec(), key.dst.as_bytes().to_vec(), key.seq_num as i64],
        )?;
        Ok(())
    }

    fn append_message(&self, peer: &DawgIdentifier, message: &Message) -> Result<(), MuttError> {
        let key = message.key();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO conversations (peer_uuid, peer_name, peer_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    peer.uuid().to_string(),
                    peer.name(),
                    peer.public_key().as_bytes().to_vec(),
                    now_ms() as i64,
                ],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO messages
                 (peer_uuid, author_uuid, author_name, author_key, recipient_key, order_num, timestamp, plaintext)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    peer.uuid().to_string(),
                    message.author.uuid().to_string(),
                    message.author.name(),
                    message.author.public_key().as_bytes().to_vec(),
                    message.recipient_key.as_bytes().to_vec(),
                    message.order_num as i64,
                    message.timestamp as i64,
                    message.plaintext,
                ],
            )?;
            if inserted == 0 {
                // dropping `tx` rolls back the conversation insert too
                return Err(MuttError::StorageConflict { key });
            }
            tx.commit()?;
        }
        self.feed.publish(StorageChange::MessageAppended {
            peer: peer.uuid(),
            key,
        });
        Ok(())
    }

    fn get_conversation(&self, peer: Uuid) -> Result<Option<Conversation>, MuttError> {
        let conn = self.conn();
        let conversation = conn
            .query_row(
                "SELECT peer_uuid, peer_name, peer_key, created_at FROM conversations WHERE peer_uuid = ?1",
                [peer.to_string()],
                conversation_from_row,
            )
            .optional()?;
        Ok(conversation)
    }

    fn list_conversations(&self) -> Result<Vec<Conversation>, MuttError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT peer_uuid, peer_name, peer_key, created_at FROM conversations ORDER BY created_at, peer_uuid",
        )?;
        let rows = stmt.query_map([], conversation_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_messages(&self, peer: Uuid) -> Result<Vec<Message>, MuttError> {
        let mut messages = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT author_uuid, author_name, author_key, recipient_key, order_num, timestamp, plaintext
                 FROM messages WHERE peer_uuid = ?1",
            )?;
            let rows = stmt.query_map([peer.to_string()], message_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        sort_messages(&mut messages);
        Ok(messages)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutt.db");
        let identity = LocalIdentity::generate("Rex");
        {
            let store = SqliteStorageManager::open(&path).unwrap();
            assert!(store.load_local_identity().unwrap().is_none());
            store.store_local_identity(&identity).unwrap();
        }
        let store = SqliteStorageManager::open(&path).unwrap();
        let loaded = store.load_local_identity().unwrap().unwrap();
        assert_eq!(loaded.uuid(), identity.uuid());
        assert_eq!(loaded.public_key(), identity.public_key());
        assert_eq!(loaded.identity().name(), "Rex");
    }

    #[test]
    fn message_conflict_rolls_back() {
        let store = SqliteStorageManager::open_in_memory().unwrap();
        let me = DawgIdentifier::new(Uuid::new_v4(), "me", PublicKey::from_bytes([1; 32]));
        let peer = DawgIdentifier::new(Uuid::new_v4(), "peer", PublicKey::from_bytes([2; 32]));
        let message = Message {
            author: me,
            recipient_key: *peer.public_key(),
            plaintext: "hi".into(),
            order_num: 1,
            timestamp: 5,
        };
        store.append_message(&peer, &message).unwrap();
        assert!(matches!(
            store.append_message(&peer, &message),
            Err(MuttError::StorageConflict { .. })
        ));
        assert_eq!(store.get_messages(peer.uuid()).unwrap().len(), 1);
        assert_eq!(store.list_conversations().unwrap().len(), 1);
    }
}
