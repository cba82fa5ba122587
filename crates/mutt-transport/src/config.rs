/// Configuration for a transport attached to a [`LoopbackNetwork`](crate::LoopbackNetwork).
///
/// ```rust
/// use mutt_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_payload_size(4096)
///     .event_buffer(64);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest accepted outbound frame, in bytes.
    pub(crate) max_payload_size: usize,
    /// Capacity of the event channel handed to the consumer.
    pub(crate) event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Defaults: 32 KiB frames, 256 buffered events.
    ///
    /// `SCUTTLEMUTT_MAX_PAYLOAD` overrides the frame cap when set to a valid number.
    pub fn new() -> Self {
        let max_payload_size = std::env::var("SCUTTLEMUTT_MAX_PAYLOAD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(32 * 1024);

        Self {
            max_payload_size,
            event_buffer: 256,
        }
    }

    /// Set the maximum outbound frame size.
    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Set the event channel capacity (minimum 1).
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }
}
