//! Scuttlemutt transport layer.
//!
//! A nearby-device transport is an unreliable, unordered byte channel between
//! named endpoints. This crate defines the narrow interface the backend
//! consumes ([`Transport`] plus a stream of [`TransportEvent`]s) and an
//! in-memory [`LoopbackNetwork`] that simulates a room full of devices.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mutt_transport::{LoopbackNetwork, Transport, TransportConfig, TransportEvent};
//!
//! # async fn example() -> Result<(), mutt_transport::TransportError> {
//! let network = LoopbackNetwork::new();
//! let (alice, _alice_events) = network.join("alice", TransportConfig::new());
//! let (bob, mut bob_events) = network.join("bob", TransportConfig::new());
//! network.link(alice.local_endpoint().id(), bob.local_endpoint().id()).await?;
//!
//! alice.send(bob.local_endpoint().id(), b"woof").await?;
//! while let Some(event) = bob_events.recv().await {
//!     if let TransportEvent::Received { data, .. } = event {
//!         assert_eq!(data, b"woof");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod loopback;

pub use config::TransportConfig;
pub use error::TransportError;
pub use loopback::{LoopbackNetwork, LoopbackTransport, SentFrame};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport-level handle to a nearby device.
///
/// Opaque to the backend: it is never an identity, and only becomes tied to
/// a contact once a key exchange over it succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A discovered device: its transport id plus the name it advertises.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    id: EndpointId,
    name: String,
}

impl Endpoint {
    pub fn new(id: EndpointId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    /// Advertised endpoint name. Not unique, not authenticated.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lifecycle and data events raised by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A device came into range and advertised itself.
    EndpointDiscovered(Endpoint),
    /// A connection to the device is up; sends to it may now succeed.
    EndpointConnected(Endpoint),
    /// The connection is gone.
    EndpointDisconnected { id: EndpointId },
    /// Connecting to a discovered device failed.
    ConnectionFailed { id: EndpointId, reason: String },
    /// A frame arrived from a connected device.
    Received { from: EndpointId, data: Vec<u8> },
}

/// Outbound half of a nearby-device transport.
///
/// Inbound traffic and lifecycle changes arrive separately as
/// [`TransportEvent`]s on the receiver handed out with the transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one frame to a connected endpoint.
    async fn send(&self, to: &EndpointId, data: &[u8]) -> Result<(), TransportError>;

    /// Largest frame [`send`](Transport::send) accepts.
    fn max_payload_size(&self) -> usize;

    /// The endpoint this transport advertises to others.
    fn local_endpoint(&self) -> &Endpoint;
}
