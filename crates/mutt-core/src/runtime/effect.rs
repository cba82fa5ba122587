use std::fmt;

use mutt_transport::EndpointId;

use crate::types::BarkKey;

use super::MuttEvent;

/// Deferred reply to a command, run after the effects before it.
pub(super) type Responder = Box<dyn FnOnce() + Send>;

/// Intent produced by [`CoreState`](super::state::CoreState).
///
/// Every `handle_*` / `tick_*` method returns a `Vec<RuntimeEffect>`; the
/// loop hands them to the executor, the only place that touches the transport.
pub(super) enum RuntimeEffect {
    /// Fire and forget.
    Send { target: EndpointId, data: Vec<u8> },

    /// Try one endpoint, then run whichever follow-up applies.
    SendWithFallback {
        target: EndpointId,
        data: Vec<u8>,
        on_success: Vec<RuntimeEffect>,
        on_failure: Vec<RuntimeEffect>,
    },

    /// Same frame to several endpoints; success means at least one took it.
    Broadcast {
        targets: Vec<EndpointId>,
        data: Vec<u8>,
        on_success: Vec<RuntimeEffect>,
        on_failure: Vec<RuntimeEffect>,
    },

    /// Clear the pending flag of a stored bark.
    MarkSent(BarkKey),

    Emit(MuttEvent),

    Reply(Responder),
}

impl fmt::Debug for RuntimeEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeEffect::Send { target, data } => f
                .debug_struct("Send")
                .field("target", target)
                .field("len", &data.len())
                .finish(),
            RuntimeEffect::SendWithFallback {
                target,
                on_success,
                on_failure,
                ..
            } => f
                .debug_struct("SendWithFallback")
                .field("target", target)
                .field("on_success", on_success)
                .field("on_failure", on_failure)
                .finish(),
            RuntimeEffect::Broadcast { targets, .. } => {
                f.debug_struct("Broadcast").field("targets", targets).finish()
            }
            RuntimeEffect::MarkSent(key) => f.debug_tuple("MarkSent").field(key).finish(),
            RuntimeEffect::Emit(event) => f.debug_tuple("Emit").field(event).finish(),
            RuntimeEffect::Reply(_) => f.write_str("Reply"),
        }
    }
}
