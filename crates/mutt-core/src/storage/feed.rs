use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{StorageChange, StorageManager};
use crate::types::BarkKey;

/// Buffered changes per subscriber before it starts lagging.
const FEED_CAPACITY: usize = 256;

/// Broadcast side of the storage change feed.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<StorageChange>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    /// Announce a committed change. No subscribers is fine.
    pub fn publish(&self, change: StorageChange) {
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.tx.subscribe()
    }
}

/// What a [`ConversationWatcher`] saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationUpdate {
    /// A message with this key was appended.
    Appended(BarkKey),
    /// Changes were missed; reload the whole conversation.
    Resync,
}

/// Follows one conversation until cancelled.
pub struct ConversationWatcher {
    peer: Uuid,
    rx: broadcast::Receiver<StorageChange>,
    cancel: CancellationToken,
}

impl ConversationWatcher {
    pub fn new(peer: Uuid, rx: broadcast::Receiver<StorageChange>, cancel: CancellationToken) -> Self {
        Self { peer, rx, cancel }
    }

    pub fn peer(&self) -> Uuid {
        self.peer
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the next change to this conversation.
    ///
    /// Returns `None` once cancelled or when the store is gone.
    pub async fn changed(&mut self) -> Option<ConversationUpdate> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                res = self.rx.recv() => match res {
                    Ok(StorageChange::MessageAppended { peer, key }) if peer == self.peer => {
                        return Some(ConversationUpdate::Appended(key));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(peer = %self.peer, missed, "conversation watcher lagged");
                        return Some(ConversationUpdate::Resync);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// Keeps at most one live [`ConversationWatcher`].
///
/// Switching to another conversation cancels the previous watcher before the
/// new one is handed out.
pub struct ConversationSwitcher {
    storage: Arc<dyn StorageManager>,
    parent: CancellationToken,
    active: Option<(Uuid, CancellationToken)>,
}

impl ConversationSwitcher {
    pub fn new(storage: Arc<dyn StorageManager>, parent: CancellationToken) -> Self {
        Self {
            storage,
            parent,
            active: None,
        }
    }

    pub fn switch_to(&mut self, peer: Uuid) -> ConversationWatcher {
        if let Some((_, previous)) = self.active.take() {
            previous.cancel();
        }
        let token = self.parent.child_token();
        self.active = Some((peer, token.clone()));
        ConversationWatcher::new(peer, self.storage.subscribe(), token)
    }

    pub fn active(&self) -> Option<Uuid> {
        self.active.as_ref().map(|(peer, _)| *peer)
    }

    pub fn close(&mut self) {
        if let Some((_, token)) = self.active.take() {
            token.cancel();
        }
    }
}

impl Drop for ConversationSwitcher {
    fn drop(&mut self) {
        self.close();
    }
}
