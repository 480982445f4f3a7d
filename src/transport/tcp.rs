//! TCP transport.
//!
//! The relay owns two listening sockets. Clients that want to publish
//! connect to the inbound port and write frames; clients that want to
//! receive connect to the outbound port and read frames. The relay side
//! aggregates all inbound connections into one stream of messages and fans
//! every outgoing message out to all outbound connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::frame::{read_frame, write_frame};
use super::{BusPublisher, BusSubscriber, CHANNEL_CAPACITY};
use crate::core::{BusError, Result};

/// Frames queued per subscriber connection; a subscriber that falls this
/// far behind starts losing frames.
const SUBSCRIBER_QUEUE: usize = 64;

/// How long one frame write to a subscriber may stall before the
/// connection is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect_with_timeout(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| BusError::TransportError(format!("connect to {addr} timed out")))?
        .map_err(|e| BusError::TransportError(format!("connect to {addr}: {e}")))?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Reads frames off a stream and forwards them into a channel until the
/// peer hangs up, the stream fails, or the channel's receiver is dropped.
async fn pump_frames(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        tokio::select! {
            res = read_frame(&mut stream) => match res {
                Ok(Some(payload)) => {
                    if tx.send(payload).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!(%peer, "bus stream closed");
                    return;
                }
                Err(e) => {
                    warn!(%peer, "bus stream failed: {e}");
                    return;
                }
            },
            _ = tx.closed() => return,
        }
    }
}

/// Client write endpoint, a connection to the relay's inbound port.
pub struct TcpPublisher {
    stream: TcpStream,
}

impl TcpPublisher {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = connect_with_timeout(addr, connect_timeout).await?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl BusPublisher for TcpPublisher {
    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload).await
    }
}

/// Client read endpoint, a connection to the relay's outbound port.
///
/// A background task owns the socket and forwards whole frames into a
/// channel, so a wait loop can poll with short timeouts without ever
/// tearing a frame apart mid-read.
pub struct TcpSubscriber {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl TcpSubscriber {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = connect_with_timeout(addr, connect_timeout).await?;
        let peer = stream.peer_addr()?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump_frames(stream, peer, tx));
        Ok(Self { rx })
    }
}

#[async_trait]
impl BusSubscriber for TcpSubscriber {
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(BusError::ConnectionClosed),
        }
    }
}

/// Relay receive side: accepts publisher connections and merges their
/// frames into one stream.
pub struct TcpInboundHub {
    rx: mpsc::Receiver<Vec<u8>>,
    local_addr: SocketAddr,
}

impl TcpInboundHub {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::TransportError(format!("bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!(%peer, "publisher connected");
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(pump_frames(stream, peer, tx.clone()));
                        }
                        Err(e) => warn!("accept failed on inbound port: {e}"),
                    },
                    // Hub dropped; stop accepting and release the port.
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(Self { rx, local_addr })
    }

    /// Actual bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl BusSubscriber for TcpInboundHub {
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(BusError::ConnectionClosed),
        }
    }
}

/// Hub-side handle to one subscriber connection's writer task.
struct OutboundConn {
    peer: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

/// Writes queued frames to one subscriber until the peer goes away, a
/// write stalls past [`WRITE_TIMEOUT`], or the hub is dropped.
async fn drain_frames(mut stream: TcpStream, peer: SocketAddr, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut stream, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%peer, "subscriber write failed: {e}");
                return;
            }
            Err(_) => {
                warn!(%peer, "subscriber stopped reading, disconnecting it");
                return;
            }
        }
    }
}

/// Relay publish side: accepts subscriber connections and fans every
/// message out to all of them.
///
/// Each connection drains through its own bounded queue, so one stuck
/// subscriber never stalls the rest: a lagging subscriber loses frames,
/// one that stops reading altogether is disconnected after
/// [`WRITE_TIMEOUT`].
pub struct TcpOutboundHub {
    conns: Arc<Mutex<Vec<OutboundConn>>>,
    local_addr: SocketAddr,
    // Held only so the accept task notices when the hub is dropped.
    _accept_guard: mpsc::Sender<()>,
}

impl TcpOutboundHub {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::TransportError(format!("bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let conns: Arc<Mutex<Vec<OutboundConn>>> = Arc::new(Mutex::new(Vec::new()));
        let (guard_tx, mut guard_rx) = mpsc::channel::<()>(1);

        let accept_conns = Arc::clone(&conns);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!(%peer, "subscriber connected");
                            let _ = stream.set_nodelay(true);
                            let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
                            tokio::spawn(drain_frames(stream, peer, rx));
                            accept_conns.lock().await.push(OutboundConn { peer, tx });
                        }
                        Err(e) => warn!("accept failed on outbound port: {e}"),
                    },
                    _ = guard_rx.recv() => return,
                }
            }
        });

        Ok(Self {
            conns,
            local_addr,
            _accept_guard: guard_tx,
        })
    }

    /// Actual bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn subscriber_count(&self) -> usize {
        self.conns.lock().await.len()
    }
}

#[async_trait]
impl BusPublisher for TcpOutboundHub {
    async fn publish(&mut self, payload: &[u8]) -> Result<()> {
        let mut conns = self.conns.lock().await;
        if conns.is_empty() {
            return Ok(());
        }

        // Hand the frame to every writer task without ever awaiting a
        // socket; a dead or stuck consumer must never stall the bus.
        let mut pruned = 0;
        conns.retain(|conn| match conn.tx.try_send(payload.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A subscriber this far behind loses the frame but keeps
                // its connection.
                warn!(peer = %conn.peer, "subscriber lagging, frame dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                pruned += 1;
                false
            }
        });
        if pruned > 0 {
            warn!(pruned, "pruned dead subscriber connection(s)");
        }

        Ok(())
    }
}
