//! Key agreement and message encryption for Scuttlemutt.
//!
//! Each device holds one static X25519 key pair. Two contacts derive the
//! same 32-byte shared secret from their static keys; barks between them
//! are sealed with XChaCha20-Poly1305 under that secret, with the bark
//! header bound as associated data.
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::types::{BarkKey, DawgIdentifier, PublicKey, SharedSecret};
use crate::MuttError;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"scuttlemutt-bark-xchacha20poly1305-v1";

/// Static X25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: X25519Secret,
    public: PublicKey,
}

impl KeyPair {
    /// Fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        use chacha20poly1305::aead::rand_core::OsRng;
        Self::from_secret(X25519Secret::random_from_rng(OsRng))
    }

    /// Rebuild from persisted secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(X25519Secret::from(bytes))
    }

    fn from_secret(secret: X25519Secret) -> Self {
        let public = PublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// This device's identity plus its secret key.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    identity: DawgIdentifier,
    keys: KeyPair,
}

impl LocalIdentity {
    /// New identity with a random uuid and key pair.
    pub fn generate(name: impl Into<String>) -> Self {
        let keys = KeyPair::generate();
        let identity = DawgIdentifier::new(Uuid::new_v4(), name, *keys.public_key());
        Self { identity, keys }
    }

    /// Rebuild a persisted identity.
    pub fn from_parts(uuid: Uuid, name: impl Into<String>, secret: [u8; 32]) -> Self {
        let keys = KeyPair::from_secret_bytes(secret);
        let identity = DawgIdentifier::new(uuid, name, *keys.public_key());
        Self { identity, keys }
    }

    pub fn identity(&self) -> &DawgIdentifier {
        &self.identity
    }

    pub fn uuid(&self) -> Uuid {
        self.identity.uuid()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.keys.secret_bytes()
    }

    /// Shared secret with `peer`. See [`derive_shared_secret`].
    pub fn shared_secret_with(&self, peer: &DawgIdentifier) -> Result<SharedSecret, MuttError> {
        derive_shared_secret(&self.keys, self.uuid(), peer)
    }
}

/// Derive the symmetric secret shared by `local` and `peer`.
///
/// `HKDF-SHA256(DH(local, peer), salt = min(uuid) || max(uuid))`. Both sides
/// compute the same value no matter who initiated the exchange.
pub fn derive_shared_secret(
    local: &KeyPair,
    local_uuid: Uuid,
    peer: &DawgIdentifier,
) -> Result<SharedSecret, MuttError> {
    let peer_pk = X25519PublicKey::from(*peer.public_key().as_bytes());
    let dh = local.secret.diffie_hellman(&peer_pk);
    if !dh.was_contributory() {
        return Err(MuttError::Crypto(format!(
            "non-contributory key from {}",
            peer.public_key().short()
        )));
    }

    let (lo, hi) = if local_uuid <= peer.uuid() {
        (local_uuid, peer.uuid())
    } else {
        (peer.uuid(), local_uuid)
    };
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(lo.as_bytes());
    salt[16..].copy_from_slice(hi.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), dh.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| MuttError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(SharedSecret::from_bytes(key))
}

/// Sealed bark body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// XChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 24-byte random nonce.
    pub nonce: [u8; 24],
}

/// Associated data binding a bark body to its header.
pub fn bark_aad(key: &BarkKey, timestamp: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(80);
    aad.extend_from_slice(key.src.as_bytes());
    aad.extend_from_slice(key.dst.as_bytes());
    aad.extend_from_slice(&key.seq_num.to_be_bytes());
    aad.extend_from_slice(&timestamp.to_be_bytes());
    aad
}

/// Encrypt `plaintext` under `secret`, authenticating `aad`.
pub fn encrypt(
    secret: &SharedSecret,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<EncryptedPayload, MuttError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let cipher = XChaCha20Poly1305::new(&(*secret.as_bytes()).into());
    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| MuttError::Crypto(format!("encryption failed: {e}")))?;

    Ok(EncryptedPayload {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Decrypt a payload sealed by [`encrypt`] with the same secret and `aad`.
pub fn decrypt(
    secret: &SharedSecret,
    payload: &EncryptedPayload,
    aad: &[u8],
) -> Result<Vec<u8>, MuttError> {
    let cipher = XChaCha20Poly1305::new(&(*secret.as_bytes()).into());
    let nonce = XNonce::from(payload.nonce);
    cipher
        .decrypt(
            &nonce,
            Payload {
                msg: payload.ciphertext.as_ref(),
                aad,
            },
        )
        .map_err(|_| MuttError::Crypto("decryption failed: authentication error".into()))
}
