//! A handful of backend instances sharing one loopback network.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mutt_core::{MemoryStorageManager, MuttConfig, MuttEvent, Scuttlemutt};
use mutt_transport::{EndpointId, LoopbackNetwork, Transport, TransportConfig};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use uuid::Uuid;

pub struct Device {
    pub name: String,
    pub id: EndpointId,
    pub handle: Scuttlemutt,
}

impl Device {
    pub fn uuid(&self) -> Uuid {
        self.handle.local_identity().uuid()
    }
}

/// Event counts across all devices.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tally {
    pub connected: u64,
    pub lost: u64,
    pub key_exchanges: u64,
    pub received: u64,
    pub delivered: u64,
    pub mesh_handoffs: u64,
    pub deferred: u64,
    pub abandoned: u64,
    pub relayed: u64,
    pub key_conflicts: u64,
    pub bans: u64,
    pub nickname_collisions: u64,
    pub errors: u64,
}

impl Tally {
    fn record(&mut self, event: &MuttEvent) {
        match event {
            MuttEvent::EndpointDiscovered { .. } => {}
            MuttEvent::EndpointConnected { .. } => self.connected += 1,
            MuttEvent::EndpointLost { .. } => self.lost += 1,
            MuttEvent::KeyExchangeCompleted { .. } => self.key_exchanges += 1,
            MuttEvent::MessageReceived { .. } => self.received += 1,
            MuttEvent::Delivered { .. } => self.delivered += 1,
            MuttEvent::HandedToMesh { .. } => self.mesh_handoffs += 1,
            MuttEvent::DeliveryDeferred { .. } => self.deferred += 1,
            MuttEvent::DeliveryAbandoned { .. } => self.abandoned += 1,
            MuttEvent::Relayed { .. } => self.relayed += 1,
            MuttEvent::KeyConflict { .. } => self.key_conflicts += 1,
            MuttEvent::EndpointBanned { .. } => self.bans += 1,
            MuttEvent::NicknameCollision { .. } => self.nickname_collisions += 1,
            MuttEvent::Error { .. } => self.errors += 1,
        }
    }
}

pub struct Sim {
    pub network: LoopbackNetwork,
    pub devices: Vec<Device>,
    pub tally: Tally,
    config: MuttConfig,
    wait: Duration,
    events_tx: mpsc::Sender<(usize, MuttEvent)>,
    events_rx: mpsc::Receiver<(usize, MuttEvent)>,
}

impl Sim {
    pub fn new(config: MuttConfig, wait: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(1024);
        Self {
            network: LoopbackNetwork::new(),
            devices: Vec::new(),
            tally: Tally::default(),
            config,
            wait,
            events_tx,
            events_rx,
        }
    }

    /// Start a backend instance with its own in-memory store.
    pub fn add_device(&mut self, name: &str) -> Result<usize> {
        let (transport, transport_events) = self.network.join(name, TransportConfig::new());
        let id = transport.local_endpoint().id().clone();
        let channels = Scuttlemutt::open(
            transport,
            transport_events,
            Arc::new(MemoryStorageManager::new()),
            name,
            self.config.clone(),
        )
        .with_context(|| format!("starting {name}"))?;

        let index = self.devices.len();
        let tx = self.events_tx.clone();
        let mut events = channels.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((index, event)).await.is_err() {
                    break;
                }
            }
        });

        self.devices.push(Device {
            name: name.to_string(),
            id,
            handle: channels.handle,
        });
        Ok(index)
    }

    pub async fn link(&self, a: usize, b: usize) -> Result<()> {
        self.network.link(&self.devices[a].id, &self.devices[b].id).await?;
        Ok(())
    }

    pub async fn unlink(&self, a: usize, b: usize) -> Result<()> {
        self.network.unlink(&self.devices[a].id, &self.devices[b].id).await?;
        Ok(())
    }

    /// Count events until `done` holds, failing after the configured wait.
    pub async fn wait_until(&mut self, what: &str, done: impl Fn(&Tally) -> bool) -> Result<()> {
        let deadline = Instant::now() + self.wait;
        while !done(&self.tally) {
            match timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some((index, event))) => {
                    debug!(device = %self.devices[index].name, ?event, "event");
                    self.tally.record(&event);
                }
                Ok(None) => bail!("every device stopped while waiting for {what}"),
                Err(_) => bail!("timed out after {:?} waiting for {what} ({:?})", self.wait, self.tally),
            }
        }
        Ok(())
    }

    /// Count whatever is already queued without waiting.
    pub fn drain(&mut self) {
        while let Ok((_, event)) = self.events_rx.try_recv() {
            self.tally.record(&event);
        }
    }

    pub async fn shutdown(&mut self) {
        for device in &self.devices {
            device.handle.shutdown().await;
        }
        self.drain();
    }
}
