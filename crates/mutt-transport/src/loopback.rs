//! In-memory nearby-device network.
//!
//! Every device joining a [`LoopbackNetwork`] gets a [`LoopbackTransport`]
//! and an event receiver. Devices only reach each other once linked, which
//! stands in for "in radio range and connected".

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{Endpoint, EndpointId, Transport, TransportConfig, TransportError, TransportEvent};

/// How many delivered frames the network remembers for inspection.
const SENT_HISTORY: usize = 4096;

/// A frame the network accepted for delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentFrame {
    pub from: EndpointId,
    pub to: EndpointId,
    pub data: Vec<u8>,
}

struct Device {
    endpoint: Endpoint,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct NetworkInner {
    devices: HashMap<EndpointId, Device>,
    links: HashSet<(EndpointId, EndpointId)>,
    sent: VecDeque<SentFrame>,
    lossy: HashSet<EndpointId>,
    dropped: u64,
    next_id: u64,
}

impl NetworkInner {
    fn device(&self, id: &EndpointId) -> Result<&Device, TransportError> {
        self.devices
            .get(id)
            .ok_or_else(|| TransportError::UnknownDevice(id.clone()))
    }

    fn record(&mut self, frame: SentFrame) {
        if self.sent.len() == SENT_HISTORY {
            self.sent.pop_front();
        }
        self.sent.push_back(frame);
    }
}

fn link_key(a: &EndpointId, b: &EndpointId) -> (EndpointId, EndpointId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

async fn notify(tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if tx.send(event).await.is_err() {
        debug!("loopback: event receiver dropped");
    }
}

/// Shared in-memory medium. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a device advertising `name`. Endpoint ids are unique per network.
    pub fn join(
        &self,
        name: &str,
        config: TransportConfig,
    ) -> (LoopbackTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(config.event_buffer);
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = EndpointId::new(format!("{name}-{}", inner.next_id));
        let endpoint = Endpoint::new(id.clone(), name);
        inner.devices.insert(
            id,
            Device {
                endpoint: endpoint.clone(),
                events: tx,
            },
        );
        debug!(endpoint = %endpoint.id(), "loopback: device joined");

        let transport = LoopbackTransport {
            network: self.clone(),
            endpoint,
            max_payload_size: config.max_payload_size,
        };
        (transport, rx)
    }

    /// Bring two devices in range and connect them.
    ///
    /// Each side sees `EndpointDiscovered` then `EndpointConnected` for the
    /// other. Linking an already-linked pair is a no-op.
    pub async fn link(&self, a: &EndpointId, b: &EndpointId) -> Result<(), TransportError> {
        if a == b {
            return Ok(());
        }
        let (ep_a, tx_a, ep_b, tx_b) = {
            let mut inner = self.lock();
            let da = inner.device(a)?;
            let db = inner.device(b)?;
            let pair = (
                da.endpoint.clone(),
                da.events.clone(),
                db.endpoint.clone(),
                db.events.clone(),
            );
            if !inner.links.insert(link_key(a, b)) {
                return Ok(());
            }
            pair
        };

        notify(&tx_a, TransportEvent::EndpointDiscovered(ep_b.clone())).await;
        notify(&tx_b, TransportEvent::EndpointDiscovered(ep_a.clone())).await;
        notify(&tx_a, TransportEvent::EndpointConnected(ep_b)).await;
        notify(&tx_b, TransportEvent::EndpointConnected(ep_a)).await;
        Ok(())
    }

    /// Take two devices out of range of each other.
    pub async fn unlink(&self, a: &EndpointId, b: &EndpointId) -> Result<(), TransportError> {
        let (tx_a, tx_b) = {
            let mut inner = self.lock();
            let tx_a = inner.device(a)?.events.clone();
            let tx_b = inner.device(b)?.events.clone();
            if !inner.links.remove(&link_key(a, b)) {
                return Ok(());
            }
            (tx_a, tx_b)
        };

        notify(&tx_a, TransportEvent::EndpointDisconnected { id: b.clone() }).await;
        notify(&tx_b, TransportEvent::EndpointDisconnected { id: a.clone() }).await;
        Ok(())
    }

    /// Remove a device from the network, disconnecting all of its links.
    pub async fn leave(&self, id: &EndpointId) -> Result<(), TransportError> {
        let peers: Vec<(EndpointId, mpsc::Sender<TransportEvent>)> = {
            let mut inner = self.lock();
            if inner.devices.remove(id).is_none() {
                return Err(TransportError::UnknownDevice(id.clone()));
            }
            let dropped: Vec<_> = inner
                .links
                .iter()
                .filter(|(x, y)| x == id || y == id)
                .cloned()
                .collect();
            let mut peers = Vec::with_capacity(dropped.len());
            for link in dropped {
                inner.links.remove(&link);
                let peer = if &link.0 == id { link.1 } else { link.0 };
                if let Some(device) = inner.devices.get(&peer) {
                    peers.push((peer, device.events.clone()));
                }
            }
            peers
        };

        for (_, tx) in peers {
            notify(&tx, TransportEvent::EndpointDisconnected { id: id.clone() }).await;
        }
        Ok(())
    }

    /// Tell `to` that a connection attempt to `from` failed.
    pub async fn fail_connection(
        &self,
        to: &EndpointId,
        from: &EndpointId,
        reason: &str,
    ) -> Result<(), TransportError> {
        let tx = self.lock().device(to)?.events.clone();
        notify(
            &tx,
            TransportEvent::ConnectionFailed {
                id: from.clone(),
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(())
    }

    /// Deliver a raw frame to `to` as if `from` had sent it, link or not.
    ///
    /// Used to replay captured frames (duplicate delivery) in tests.
    pub async fn inject(
        &self,
        from: &EndpointId,
        to: &EndpointId,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        let tx = self.lock().device(to)?.events.clone();
        tx.send(TransportEvent::Received {
            from: from.clone(),
            data,
        })
        .await
        .map_err(|_| TransportError::Closed)
    }

    /// Silently lose every frame `id` sends from now on (or stop losing them).
    ///
    /// Sends still report success, like a radio that never hears back.
    pub fn set_dropping(&self, id: &EndpointId, dropping: bool) {
        let mut inner = self.lock();
        if dropping {
            inner.lossy.insert(id.clone());
        } else {
            inner.lossy.remove(id);
        }
    }

    /// Frames lost to [`set_dropping`](Self::set_dropping) so far.
    pub fn dropped_frames(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_linked(&self, a: &EndpointId, b: &EndpointId) -> bool {
        self.lock().links.contains(&link_key(a, b))
    }

    /// Frames accepted for delivery, oldest first (bounded history).
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.lock().sent.iter().cloned().collect()
    }
}

/// One device's handle on a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    endpoint: Endpoint,
    max_payload_size: usize,
}

impl LoopbackTransport {
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, to: &EndpointId, data: &[u8]) -> Result<(), TransportError> {
        if data.len() > self.max_payload_size {
            return Err(TransportError::PayloadTooLarge {
                size: data.len(),
                max: self.max_payload_size,
            });
        }

        let target = {
            let mut inner = self.network.lock();
            if !inner.links.contains(&link_key(self.endpoint.id(), to)) {
                return Err(TransportError::NotConnected(to.clone()));
            }
            let tx = inner
                .devices
                .get(to)
                .map(|d| d.events.clone())
                .ok_or_else(|| TransportError::NotConnected(to.clone()))?;
            if inner.lossy.contains(self.endpoint.id()) {
                inner.dropped += 1;
                debug!(from = %self.endpoint.id(), %to, "loopback: frame dropped");
                return Ok(());
            }
            inner.record(SentFrame {
                from: self.endpoint.id().clone(),
                to: to.clone(),
                data: data.to_vec(),
            });
            tx
        };

        target
            .send(TransportEvent::Received {
                from: self.endpoint.id().clone(),
                data: data.to_vec(),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (
        LoopbackNetwork,
        (LoopbackTransport, mpsc::Receiver<TransportEvent>),
        (LoopbackTransport, mpsc::Receiver<TransportEvent>),
    ) {
        let net = LoopbackNetwork::new();
        let a = net.join("alice", TransportConfig::new().max_payload_size(64));
        let b = net.join("bob", TransportConfig::new().max_payload_size(64));
        (net, a, b)
    }

    #[tokio::test]
    async fn link_announces_both_sides() {
        let (net, (a, mut a_rx), (b, mut b_rx)) = pair();
        net.link(a.local_endpoint().id(), b.local_endpoint().id())
            .await
            .unwrap();

        assert_eq!(
            a_rx.recv().await.unwrap(),
            TransportEvent::EndpointDiscovered(b.local_endpoint().clone())
        );
        assert_eq!(
            a_rx.recv().await.unwrap(),
            TransportEvent::EndpointConnected(b.local_endpoint().clone())
        );
        assert_eq!(
            b_rx.recv().await.unwrap(),
            TransportEvent::EndpointDiscovered(a.local_endpoint().clone())
        );
        assert!(net.is_linked(b.local_endpoint().id(), a.local_endpoint().id()));
    }

    #[tokio::test]
    async fn send_requires_link() {
        let (_net, (a, _a_rx), (b, _b_rx)) = pair();
        let err = a.send(b.local_endpoint().id(), b"hi").await.unwrap_err();
        assert_eq!(
            err,
            TransportError::NotConnected(b.local_endpoint().id().clone())
        );
    }

    #[tokio::test]
    async fn send_delivers_and_records() {
        let (net, (a, _a_rx), (b, mut b_rx)) = pair();
        net.link(a.local_endpoint().id(), b.local_endpoint().id())
            .await
            .unwrap();
        a.send(b.local_endpoint().id(), b"woof").await.unwrap();

        // discovered + connected, then the frame
        b_rx.recv().await.unwrap();
        b_rx.recv().await.unwrap();
        assert_eq!(
            b_rx.recv().await.unwrap(),
            TransportEvent::Received {
                from: a.local_endpoint().id().clone(),
                data: b"woof".to_vec(),
            }
        );

        let frames = net.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].to, b.local_endpoint().id());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (net, (a, _a_rx), (b, _b_rx)) = pair();
        net.link(a.local_endpoint().id(), b.local_endpoint().id())
            .await
            .unwrap();
        let err = a.send(b.local_endpoint().id(), &[0u8; 65]).await.unwrap_err();
        assert_eq!(err, TransportError::PayloadTooLarge { size: 65, max: 64 });
        assert!(net.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn dropping_device_loses_frames_quietly() {
        let (net, (a, _a_rx), (b, mut b_rx)) = pair();
        let (ida, idb) = (a.local_endpoint().id(), b.local_endpoint().id());
        net.link(ida, idb).await.unwrap();
        b_rx.recv().await.unwrap();
        b_rx.recv().await.unwrap();

        net.set_dropping(ida, true);
        a.send(idb, b"lost").await.unwrap();
        assert_eq!(net.dropped_frames(), 1);
        assert!(net.sent_frames().is_empty());
        assert!(b_rx.try_recv().is_err());

        net.set_dropping(ida, false);
        a.send(idb, b"heard").await.unwrap();
        assert!(matches!(
            b_rx.recv().await.unwrap(),
            TransportEvent::Received { data, .. } if data == b"heard"
        ));
    }

    #[tokio::test]
    async fn unlink_disconnects() {
        let (net, (a, mut a_rx), (b, _b_rx)) = pair();
        let (ida, idb) = (a.local_endpoint().id(), b.local_endpoint().id());
        net.link(ida, idb).await.unwrap();
        net.unlink(ida, idb).await.unwrap();

        a_rx.recv().await.unwrap();
        a_rx.recv().await.unwrap();
        assert_eq!(
            a_rx.recv().await.unwrap(),
            TransportEvent::EndpointDisconnected { id: idb.clone() }
        );
        assert!(a.send(idb, b"x").await.is_err());
    }

    #[tokio::test]
    async fn leave_notifies_peers() {
        let (net, (a, _a_rx), (b, mut b_rx)) = pair();
        net.link(a.local_endpoint().id(), b.local_endpoint().id())
            .await
            .unwrap();
        net.leave(a.local_endpoint().id()).await.unwrap();

        b_rx.recv().await.unwrap();
        b_rx.recv().await.unwrap();
        assert_eq!(
            b_rx.recv().await.unwrap(),
            TransportEvent::EndpointDisconnected {
                id: a.local_endpoint().id().clone()
            }
        );
        assert!(matches!(
            net.leave(a.local_endpoint().id()).await,
            Err(TransportError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn inject_bypasses_links() {
        let (net, (a, _a_rx), (b, mut b_rx)) = pair();
        net.inject(a.local_endpoint().id(), b.local_endpoint().id(), vec![1, 2])
            .await
            .unwrap();
        assert!(matches!(
            b_rx.recv().await.unwrap(),
            TransportEvent::Received { data, .. } if data == vec![1, 2]
        ));
    }

    #[tokio::test]
    async fn endpoint_ids_are_unique() {
        let net = LoopbackNetwork::new();
        let (a, _) = net.join("rex", TransportConfig::new());
        let (b, _) = net.join("rex", TransportConfig::new());
        assert_ne!(a.local_endpoint().id(), b.local_endpoint().id());
        assert_eq!(a.local_endpoint().name(), b.local_endpoint().name());
    }
}
