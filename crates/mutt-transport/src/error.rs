use crate::EndpointId;

/// Errors returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),

    #[error("frame too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown device {0}")]
    UnknownDevice(EndpointId),

    #[error("transport is closed")]
    Closed,
}
