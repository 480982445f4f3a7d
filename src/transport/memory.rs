//! In-process transport.
//!
//! Wires the same topology as the TCP transport without sockets: client
//! publishers feed a bounded mpsc channel the relay drains, and the relay
//! rebroadcasts every message on a broadcast channel all subscribers share.
//! Used by tests and by embedders that want the bus inside one process.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{BusPublisher, BusSubscriber, CHANNEL_CAPACITY};
use crate::core::{BusError, Result};

/// Shared wiring for one in-process bus.
///
/// `publisher()` and `subscriber()` hand out client endpoints any number of
/// times; `relay_endpoints()` hands out the relay's receive/publish pair and
/// can only be called once, there is exactly one relay per bus.
pub struct MemoryBus {
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Option<mpsc::Receiver<Vec<u8>>>,
    outbound_tx: broadcast::Sender<Vec<u8>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, _) = broadcast::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            outbound_tx,
        }
    }

    /// Client write endpoint, feeds the relay.
    pub fn publisher(&self) -> MemoryPublisher {
        MemoryPublisher {
            tx: self.inbound_tx.clone(),
        }
    }

    /// Client read endpoint. Only messages relayed after this call are
    /// delivered; late joiners do not see history.
    pub fn subscriber(&self) -> MemorySubscriber {
        MemorySubscriber {
            rx: self.outbound_tx.subscribe(),
        }
    }

    /// The relay's receive/publish pair.
    pub fn relay_endpoints(&mut self) -> Result<(Box<dyn BusSubscriber>, Box<dyn BusPublisher>)> {
        let rx = self.inbound_rx.take().ok_or_else(|| {
            BusError::TransportError("relay endpoints already taken".to_string())
        })?;
        Ok((
            Box::new(HubReceiver { rx }),
            Box::new(HubSender {
                tx: self.outbound_tx.clone(),
            }),
        ))
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Client write endpoint of a [`MemoryBus`].
pub struct MemoryPublisher {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl BusPublisher for MemoryPublisher {
    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        self.tx
            .send(payload.to_vec())
            .await
            .map_err(|_| BusError::TransportError("bus hub is gone".to_string()))
    }
}

/// Client read endpoint of a [`MemoryBus`].
pub struct MemorySubscriber {
    rx: broadcast::Receiver<Vec<u8>>,
}

#[async_trait]
impl BusSubscriber for MemorySubscriber {
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(payload)) => return Ok(Some(payload)),
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BusError::ConnectionClosed)
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    // A slow consumer loses the oldest messages and keeps
                    // going; that mirrors how the TCP side sheds load.
                    warn!(skipped, "in-process subscriber lagged");
                }
            }
        }
    }
}

struct HubReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl BusSubscriber for HubReceiver {
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(BusError::ConnectionClosed),
        }
    }
}

struct HubSender {
    tx: broadcast::Sender<Vec<u8>>,
}

#[async_trait]
impl BusPublisher for HubSender {
    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        // Zero subscribers is not an error, pub-sub publishes are fire and
        // forget.
        let _ = self.tx.send(payload.to_vec());
        Ok(())
    }
}
