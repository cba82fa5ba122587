//! Effect executor, the only place that touches I/O.
//!
//! - Send / SendWithFallback / Broadcast -> transport.send()
//! - MarkSent -> storage
//! - Emit -> event channel
//! - Reply -> command responder

use mutt_transport::Transport;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::storage::StorageManager;

use super::effect::RuntimeEffect;
use super::MuttEvent;

/// Execute `effects` in order.
pub(super) async fn execute_effects<T: Transport>(
    effects: Vec<RuntimeEffect>,
    transport: &T,
    storage: &dyn StorageManager,
    event_tx: &mpsc::Sender<MuttEvent>,
) {
    for effect in effects {
        match effect {
            RuntimeEffect::Send { target, data } => {
                if let Err(e) = transport.send(&target, &data).await {
                    warn!(%target, error = %e, "send failed");
                    emit(
                        event_tx,
                        MuttEvent::Error {
                            description: format!("send to {target} failed: {e}"),
                        },
                    );
                }
            }
            RuntimeEffect::SendWithFallback {
                target,
                data,
                on_success,
                on_failure,
            } => {
                let next = match transport.send(&target, &data).await {
                    Ok(()) => on_success,
                    Err(e) => {
                        debug!(%target, error = %e, "send failed, running fallback");
                        on_failure
                    }
                };
                Box::pin(execute_effects(next, transport, storage, event_tx)).await;
            }
            RuntimeEffect::Broadcast {
                targets,
                data,
                on_success,
                on_failure,
            } => {
                let mut delivered = 0usize;
                for target in &targets {
                    match transport.send(target, &data).await {
                        Ok(()) => delivered += 1,
                        Err(e) => debug!(%target, error = %e, "broadcast leg failed"),
                    }
                }
                let next = if delivered > 0 { on_success } else { on_failure };
                Box::pin(execute_effects(next, transport, storage, event_tx)).await;
            }
            RuntimeEffect::MarkSent(key) => {
                if let Err(e) = storage.mark_bark_sent(&key) {
                    warn!(%key, error = %e, "could not clear pending flag");
                }
            }
            RuntimeEffect::Emit(event) => emit(event_tx, event),
            RuntimeEffect::Reply(respond) => respond(),
        }
    }
}

/// Never block the runtime on a slow consumer.
fn emit(event_tx: &mpsc::Sender<MuttEvent>, event: MuttEvent) {
    if event_tx.try_send(event).is_err() {
        debug!("event channel full or closed, event dropped");
    }
}
