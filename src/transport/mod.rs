//! Pluggable message transports.
//!
//! The relay and the client only ever see the two traits below; whether the
//! bytes travel over TCP or stay inside the process is wired up at
//! construction time.

pub mod frame;
pub mod memory;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;

use crate::core::Result;

/// Buffered messages per channel before a producer is slowed down or a slow
/// consumer starts losing messages.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Write side of the bus.
#[async_trait]
pub trait BusPublisher: Send {
    /// Publish one raw message. An error here means the transport is gone,
    /// not that nobody is listening; publishing to zero subscribers
    /// succeeds.
    async fn publish(&mut self, payload: &[u8]) -> Result<()>;
}

/// Read side of the bus.
#[async_trait]
pub trait BusSubscriber: Send {
    /// Wait up to `timeout` for the next raw message. `Ok(None)` means the
    /// poll window elapsed with nothing to deliver; an error means the
    /// transport is gone and further polling is pointless.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use memory::MemoryBus;
pub use tcp::{TcpInboundHub, TcpOutboundHub, TcpPublisher, TcpSubscriber};
