//! End-to-end messaging over the in-memory loopback network.
//!
//! Each device runs a full `Scuttlemutt` runtime; devices find each other
//! through `LoopbackNetwork::link` and exchange keys on their own.
use std::sync::Arc;
use std::time::Duration;

use mutt_core::{
    Bark, ConversationUpdate, Conversation, MemoryStorageManager, MuttConfig, MuttError, MuttEvent, Packet,
    Scuttlemutt, SqliteStorageManager, StorageManager,
};
use mutt_transport::{EndpointId, LoopbackNetwork, Transport, TransportConfig};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Dog {
    handle: Scuttlemutt,
    events: mpsc::Receiver<MuttEvent>,
    id: EndpointId,
}

impl Dog {
    fn uuid(&self) -> Uuid {
        self.handle.local_identity().uuid()
    }

    /// Next event matching `pred`, skipping everything else.
    async fn wait_for(&mut self, pred: impl Fn(&MuttEvent) -> bool) -> MuttEvent {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("runtime stopped");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_key_exchange(&mut self) -> MuttEvent {
        self.wait_for(|e| matches!(e, MuttEvent::KeyExchangeCompleted { .. })).await
    }

    async fn wait_for_message(&mut self) -> String {
        match self.wait_for(|e| matches!(e, MuttEvent::MessageReceived { .. })).await {
            MuttEvent::MessageReceived { plaintext, .. } => plaintext,
            _ => unreachable!(),
        }
    }
}

fn spawn_dog_with(network: &LoopbackNetwork, name: &str, storage: Arc<dyn StorageManager>, config: MuttConfig) -> Dog {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let (transport, transport_events) = network.join(name, TransportConfig::new());
    let id = transport.local_endpoint().id().clone();
    let channels = Scuttlemutt::open(transport, transport_events, storage, name, config).expect("open");
    Dog {
        handle: channels.handle,
        events: channels.events,
        id,
    }
}

fn spawn_dog(network: &LoopbackNetwork, name: &str) -> Dog {
    spawn_dog_with(network, name, Arc::new(MemoryStorageManager::new()), MuttConfig::new().in_memory())
}

async fn paired(network: &LoopbackNetwork) -> (Dog, Dog) {
    let mut a = spawn_dog(network, "alice");
    let mut b = spawn_dog(network, "bob");
    network.link(&a.id, &b.id).await.unwrap();
    a.wait_for_key_exchange().await;
    b.wait_for_key_exchange().await;
    (a, b)
}

#[tokio::test]
async fn key_exchange_then_message() {
    let network = LoopbackNetwork::new();
    let (mut a, mut b) = paired(&network).await;

    assert!(b.handle.have_contact(a.uuid()));
    assert!(a.handle.have_contact(b.uuid()));
    // every device is also its own contact
    assert_eq!(b.handle.all_contacts().len(), 2);

    let receipt = b.handle.send_message("hi alice", a.uuid()).await.unwrap();
    assert_eq!(receipt.key.seq_num, 1);
    assert!(receipt.dispatched);

    assert_eq!(a.wait_for_message().await, "hi alice");

    let conversation = a.handle.get_conversation(b.uuid()).unwrap().expect("conversation");
    let messages = a.handle.get_messages_for_conversation(&conversation).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].author.uuid(), b.uuid());

    let delivered = b.wait_for(|e| matches!(e, MuttEvent::Delivered { .. })).await;
    assert_eq!(delivered, MuttEvent::Delivered { key: receipt.key });
    assert!(b.handle.storage().pending_barks(None).unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_bark_stored_once() {
    let network = LoopbackNetwork::new();
    let (a, mut b) = paired(&network).await;

    let secret = a.handle.contact(b.uuid()).unwrap().shared_secret.unwrap();
    let a_key = *a.handle.local_identity().public_key();
    let b_key = *b.handle.local_identity().public_key();
    let bark = Bark::seal(a_key, b_key, 5, "only once", &secret).unwrap();
    let frame = Packet::Bark(bark).to_network_bytes().unwrap();

    network.inject(&a.id, &b.id, frame.clone()).await.unwrap();
    network.inject(&a.id, &b.id, frame).await.unwrap();
    a.handle.send_message("after", b.uuid()).await.unwrap();

    assert_eq!(b.wait_for_message().await, "only once");
    // the replay produced no second event
    assert_eq!(b.wait_for_message().await, "after");

    let barks = b.handle.storage().get_barks(&a_key, &b_key).unwrap();
    let seqs: Vec<u64> = barks.iter().map(|bark| bark.seq_num).collect();
    assert_eq!(seqs, vec![5, 1]);
    let messages = b.handle.storage().get_messages(a.uuid()).unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn conversation_without_messages_is_empty() {
    let network = LoopbackNetwork::new();
    let (a, b) = paired(&network).await;

    assert!(a.handle.get_conversation(b.uuid()).unwrap().is_none());
    let conversation = Conversation {
        peer: b.handle.local_identity().clone(),
        created_at: 0,
    };
    assert!(a.handle.get_messages_for_conversation(&conversation).unwrap().is_empty());
    assert!(a.handle.list_conversations().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_sends_get_distinct_sequence_numbers() {
    let network = LoopbackNetwork::new();
    let (a, b) = paired(&network).await;

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let handle = a.handle.clone();
            let to = b.uuid();
            tokio::spawn(async move { handle.send_message(&format!("msg {i}"), to).await })
        })
        .collect();
    let mut seqs = Vec::new();
    for task in tasks {
        seqs.push(task.await.unwrap().unwrap().key.seq_num);
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn unknown_destination_rejected() {
    let network = LoopbackNetwork::new();
    let a = spawn_dog(&network, "alice");
    let err = a.handle.send_message("anyone?", Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, MuttError::UnknownContact { .. }));
}

#[tokio::test]
async fn pending_bark_delivered_after_reconnect() {
    let network = LoopbackNetwork::new();
    let (mut a, mut b) = paired(&network).await;

    network.unlink(&a.id, &b.id).await.unwrap();
    a.wait_for(|e| matches!(e, MuttEvent::EndpointLost { .. })).await;

    let receipt = a.handle.send_message("are you there?", b.uuid()).await.unwrap();
    assert!(!receipt.dispatched);
    assert_eq!(a.handle.storage().pending_barks(None).unwrap().len(), 1);

    network.link(&a.id, &b.id).await.unwrap();
    assert_eq!(b.wait_for_message().await, "are you there?");
    a.wait_for(|e| matches!(e, MuttEvent::Delivered { .. })).await;
    assert!(a.handle.storage().pending_barks(None).unwrap().is_empty());
}

/// A neighbour that is not next to the recipient takes the bark, yet the
/// sender keeps it pending and delivers it once the recipient is back.
#[tokio::test]
async fn mesh_handoff_stays_pending_until_recipient_reached() {
    let network = LoopbackNetwork::new();
    let (mut a, mut b) = paired(&network).await;
    network.unlink(&a.id, &b.id).await.unwrap();
    a.wait_for(|e| matches!(e, MuttEvent::EndpointLost { .. })).await;

    let mut carol = spawn_dog(&network, "carol");
    network.link(&a.id, &carol.id).await.unwrap();
    carol.wait_for_key_exchange().await;

    let receipt = a.handle.send_message("for bob", b.uuid()).await.unwrap();
    assert!(receipt.dispatched);
    a.wait_for(|e| matches!(e, MuttEvent::HandedToMesh { key } if *key == receipt.key))
        .await;
    assert_eq!(a.handle.storage().pending_barks(None).unwrap().len(), 1);

    network.link(&a.id, &b.id).await.unwrap();
    assert_eq!(b.wait_for_message().await, "for bob");
    a.wait_for(|e| matches!(e, MuttEvent::Delivered { key } if *key == receipt.key))
        .await;
    assert!(a.handle.storage().pending_barks(None).unwrap().is_empty());
}

#[tokio::test]
async fn bark_relayed_through_intermediate_device() {
    let network = LoopbackNetwork::new();
    let mut a = spawn_dog(&network, "alice");
    let mut relay = spawn_dog(&network, "rover");
    let mut c = spawn_dog(&network, "carol");
    network.link(&a.id, &relay.id).await.unwrap();
    network.link(&relay.id, &c.id).await.unwrap();
    a.wait_for_key_exchange().await;
    c.wait_for_key_exchange().await;

    // alice and carol were introduced out of band
    assert!(a.handle.add_contact(c.handle.local_identity().clone(), None).await.unwrap());
    assert!(c.handle.add_contact(a.handle.local_identity().clone(), None).await.unwrap());

    let receipt = a.handle.send_message("via rover", c.uuid()).await.unwrap();
    assert!(receipt.dispatched);
    assert_eq!(c.wait_for_message().await, "via rover");
    relay
        .wait_for(|e| matches!(e, MuttEvent::Relayed { key } if *key == receipt.key))
        .await;
    // the relay cannot read it
    assert!(relay.handle.get_conversation(a.uuid()).unwrap().is_none());
}

#[tokio::test]
async fn oversized_text_replaced_by_placeholder() {
    let network = LoopbackNetwork::new();
    let (a, mut b) = paired(&network).await;

    let long = "a".repeat(200);
    let err = a.handle.send_message(&long, b.uuid()).await.unwrap_err();
    assert!(matches!(err, MuttError::PayloadTooLarge { size: 200, max: 160 }));

    let receipt = a.handle.send_message_or_placeholder(&long, b.uuid()).await.unwrap();
    assert!(receipt.placeholder);
    assert_eq!(receipt.key.seq_num, 1);
    assert_eq!(b.wait_for_message().await, "Message too big, message not sent.");
}

#[tokio::test]
async fn watcher_sees_new_messages() {
    let network = LoopbackNetwork::new();
    let (a, b) = paired(&network).await;

    let mut watcher = b.handle.watch_conversation(a.uuid());
    let receipt = a.handle.send_message("ping", b.uuid()).await.unwrap();
    let update = timeout(WAIT, watcher.changed()).await.unwrap();
    assert_eq!(update, Some(ConversationUpdate::Appended(receipt.key)));
}

#[tokio::test]
async fn switching_conversations_cancels_previous_watcher() {
    let network = LoopbackNetwork::new();
    let (a, b) = paired(&network).await;

    let mut switcher = a.handle.conversation_switcher();
    let mut first = switcher.switch_to(b.uuid());
    let second = switcher.switch_to(a.uuid());
    assert_eq!(first.changed().await, None);
    assert!(!second.is_cancelled());
    assert_eq!(switcher.active(), Some(a.uuid()));
}

#[tokio::test]
async fn shutdown_cancels_watchers_and_rejects_commands() {
    let network = LoopbackNetwork::new();
    let (a, b) = paired(&network).await;

    let mut watcher = a.handle.watch_conversation(b.uuid());
    a.handle.shutdown().await;
    assert!(a.handle.is_shut_down());
    assert_eq!(timeout(WAIT, watcher.changed()).await.unwrap(), None);

    let err = a.handle.send_message("too late", b.uuid()).await.unwrap_err();
    assert!(matches!(err, MuttError::Shutdown));
}

#[tokio::test]
async fn identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.db");
    let network = LoopbackNetwork::new();

    let first = {
        let storage = Arc::new(SqliteStorageManager::open(&path).unwrap());
        let dog = spawn_dog_with(&network, "alice", storage, MuttConfig::new().database_path(&path));
        let identity = dog.handle.local_identity().clone();
        dog.handle.shutdown().await;
        identity
    };

    let storage = Arc::new(SqliteStorageManager::open(&path).unwrap());
    let dog = spawn_dog_with(&network, "ignored", storage, MuttConfig::new().database_path(&path));
    assert_eq!(dog.handle.local_identity(), &first);
    assert_eq!(dog.handle.local_identity().name(), "alice");
    assert_eq!(dog.handle.local_identity().public_key(), first.public_key());
}
