//! Integration tests: key exchange between two devices without a transport.
//!
//! Packets are handed from one `KeyExchanger` to the other directly; each
//! side keeps its contacts in its own store.
use mutt_core::{
    Bark, ExchangeState, KeyExchanger, LocalIdentity, MemoryStorageManager, MuttError, Packet,
    SqliteStorageManager, StorageManager,
};
use uuid::Uuid;

fn device(seed: u8, name: &str) -> KeyExchanger {
    KeyExchanger::new(LocalIdentity::from_parts(Uuid::from_u128(seed as u128), name, [seed; 32]))
}

fn body(packet: &Packet) -> &mutt_core::KeyExchangePacket {
    match packet {
        Packet::KeyExchange(p) => p,
        other => panic!("expected key exchange, got {other:?}"),
    }
}

/// One side opens, the other replies, both end up trusted with equal secrets.
#[test]
fn opening_and_reply_pair_two_devices() {
    let mut alice = device(1, "alice");
    let mut bob = device(2, "bob");
    let alice_db = MemoryStorageManager::new();
    let dir = tempfile::tempdir().unwrap();
    let bob_db = SqliteStorageManager::open(dir.path().join("bob.db")).unwrap();

    // ── Step 1: bob comes into range, alice opens ───────────────────────
    bob.discovered("alice");
    let opening = alice.send_keys("bob");
    assert_eq!(alice.state("bob"), Some(ExchangeState::KeysSent));

    // ── Step 2: bob stores alice and answers ────────────────────────────
    let outcome = bob.handle_packet("alice", body(&opening), &bob_db).unwrap();
    assert!(outcome.created);
    assert_eq!(bob.state("alice"), Some(ExchangeState::Trusted));
    let reply = outcome.reply.expect("bob answers an opening");
    assert_eq!(body(&reply).recipient.as_ref(), Some(alice.local().public_key()));

    // ── Step 3: alice stores bob, no further reply ──────────────────────
    let outcome = alice.handle_packet("bob", body(&reply), &alice_db).unwrap();
    assert!(outcome.created);
    assert!(outcome.reply.is_none());

    let a_secret = alice_db.get_contact(bob.local().uuid()).unwrap().unwrap().shared_secret.unwrap();
    let b_secret = bob_db.get_contact(alice.local().uuid()).unwrap().unwrap().shared_secret.unwrap();
    assert_eq!(a_secret, b_secret);

    // the secrets actually interoperate
    let bark = Bark::seal(*alice.local().public_key(), *bob.local().public_key(), 1, "sniff", &a_secret).unwrap();
    assert_eq!(bark.open(&b_secret).unwrap(), "sniff");
}

/// A device that reinstalls keeps its uuid but gets a new key. Nothing
/// proves the new key belongs to the same dog, so it is refused until the
/// user deletes the contact; the next exchange then starts from scratch.
#[test]
fn reinstalled_peer_needs_contact_deleted() {
    let mut alice = device(1, "alice");
    let db = MemoryStorageManager::new();

    let mut old_bob = device(2, "bob");
    let opening = old_bob.send_keys("alice");
    alice.handle_packet("bob", body(&opening), &db).unwrap();
    let old_secret = db.get_contact(old_bob.local().uuid()).unwrap().unwrap().shared_secret.unwrap();

    let mut new_bob = KeyExchanger::new(LocalIdentity::from_parts(Uuid::from_u128(2), "bob", [42; 32]));
    let opening = new_bob.send_keys("alice");
    let err = alice.handle_packet("bob", body(&opening), &db).unwrap_err();
    assert!(matches!(err, MuttError::KeyConflict { uuid, .. } if uuid == Uuid::from_u128(2)));
    let kept = db.get_contact(Uuid::from_u128(2)).unwrap().unwrap();
    assert_eq!(kept.public_key(), old_bob.local().public_key());
    assert_eq!(kept.shared_secret.as_ref(), Some(&old_secret));

    assert!(db.delete_contact(Uuid::from_u128(2)).unwrap());
    let outcome = alice.handle_packet("bob", body(&opening), &db).unwrap();
    assert!(outcome.created);

    let contact = db.get_contact(new_bob.local().uuid()).unwrap().unwrap();
    assert_eq!(contact.public_key(), new_bob.local().public_key());
    let new_secret = contact.shared_secret.unwrap();
    assert_ne!(new_secret, old_secret);

    let stale = Bark::seal(*old_bob.local().public_key(), *alice.local().public_key(), 1, "old", &old_secret).unwrap();
    assert!(matches!(stale.open(&new_secret), Err(MuttError::Crypto(_))));
}

/// Packets claiming to be us, or addressed to another key, change nothing.
#[test]
fn forged_packets_leave_storage_untouched() {
    let mut alice = device(1, "alice");
    let db = MemoryStorageManager::new();

    let mut impostor = device(1, "alice?");
    let opening = impostor.send_keys("alice");
    assert!(matches!(
        alice.handle_packet("x", body(&opening), &db),
        Err(MuttError::InvalidPacket { .. })
    ));

    // bob answers carol; the answer is addressed to carol's key
    let mut bob = device(2, "bob");
    let carol = device(3, "carol");
    let outcome = bob.handle_packet("carol", body(&carol_opening(&carol)), &MemoryStorageManager::new()).unwrap();
    let misdirected = outcome.reply.unwrap();
    assert!(matches!(
        alice.handle_packet("bob", body(&misdirected), &db),
        Err(MuttError::InvalidPacket { .. })
    ));

    assert!(db.get_all_contacts().unwrap().is_empty());
    assert_eq!(alice.state("x"), None);
}

fn carol_opening(carol: &KeyExchanger) -> Packet {
    Packet::KeyExchange(mutt_core::KeyExchangePacket {
        sender: carol.local().identity().clone(),
        recipient: None,
        seq_num: 0,
    })
}
