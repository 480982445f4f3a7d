//! The central relay.
//!
//! Every message published to the bus lands here once. The relay folds it
//! into the command ledger when it parses as an envelope, hands it to an
//! optional observer, and republishes the original bytes to all subscribers
//! untouched. Messages that do not parse still flow, the bus carries them
//! as opaque payloads.

use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::core::{BusError, Envelope, Result, StopToken};
use crate::ledger::{CommandLedger, LedgerEntry};
use crate::transport::{BusPublisher, BusSubscriber, MemoryBus, TcpInboundHub, TcpOutboundHub};

/// What the relay saw in one inbound message, as passed to an observer.
#[derive(Debug, Clone)]
pub enum RelayedMessage {
    /// Payload parsed as an envelope.
    Envelope(Envelope),
    /// Payload that did not parse; relayed verbatim anyway.
    Raw(Vec<u8>),
}

type MessageObserver = Box<dyn Fn(&RelayedMessage) + Send + Sync>;

/// Control surface over a running relay.
///
/// Cheap to clone; monitoring code and shutdown hooks each keep one.
#[derive(Clone)]
pub struct RelayHandle {
    ledger: CommandLedger,
    stop: StopToken,
    finished_grace: Duration,
}

impl RelayHandle {
    /// Ordered copy of the command queue.
    pub fn snapshot(&self) -> Result<Vec<LedgerEntry>> {
        self.ledger.snapshot()
    }

    pub fn queue_len(&self) -> Result<usize> {
        self.ledger.len()
    }

    /// Evict finished rows past their grace period right now, without
    /// waiting for the relay's own sweep. Returns the number removed.
    pub fn evict_expired(&self) -> Result<usize> {
        self.ledger.evict_expired(self.finished_grace)
    }

    /// Ask the relay loop to exit; it notices within one poll interval.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

/// The relay loop plus the state it owns.
pub struct RelayServer {
    subscriber: Box<dyn BusSubscriber>,
    publisher: Box<dyn BusPublisher>,
    ledger: CommandLedger,
    stop: StopToken,
    observer: Option<MessageObserver>,
    config: RelayConfig,
}

impl RelayServer {
    /// Build a relay over an already constructed transport pair.
    pub fn new(
        subscriber: Box<dyn BusSubscriber>,
        publisher: Box<dyn BusPublisher>,
        config: RelayConfig,
    ) -> Result<Self> {
        config.validate().map_err(BusError::ConfigError)?;
        Ok(Self {
            subscriber,
            publisher,
            ledger: CommandLedger::new(),
            stop: StopToken::new(),
            observer: None,
            config,
        })
    }

    /// Bind the two TCP ports and build a relay over them.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate().map_err(BusError::ConfigError)?;
        let inbound = TcpInboundHub::bind(&config.inbound_addr()).await?;
        let outbound = TcpOutboundHub::bind(&config.outbound_addr()).await?;
        info!(
            inbound = %inbound.local_addr(),
            outbound = %outbound.local_addr(),
            "relay listening"
        );
        Self::new(Box::new(inbound), Box::new(outbound), config)
    }

    /// Build a relay over an in-process bus.
    pub fn in_process(bus: &mut MemoryBus, config: RelayConfig) -> Result<Self> {
        let (subscriber, publisher) = bus.relay_endpoints()?;
        Self::new(subscriber, publisher, config)
    }

    /// Install an observer that sees every inbound message after the ledger
    /// has been updated and before it is republished.
    pub fn with_observer(
        mut self,
        observer: impl Fn(&RelayedMessage) + Send + Sync + 'static,
    ) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            ledger: self.ledger.clone(),
            stop: self.stop.clone(),
            finished_grace: self.config.finished_grace,
        }
    }

    /// Drive the relay until it is stopped or the transport dies. The stop
    /// flag is set on every exit path, so handle holders always observe the
    /// shutdown.
    pub async fn run(mut self) -> Result<()> {
        let result = self.run_loop().await;
        self.stop.stop();
        match &result {
            Ok(()) => info!("relay stopped"),
            Err(e) => error!("relay terminated: {e}"),
        }
        result
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut last_sweep = Instant::now();

        while !self.stop.is_stopped() {
            match self
                .subscriber
                .recv_timeout(self.config.poll_interval)
                .await
            {
                Ok(Some(payload)) => self.process_frame(&payload).await?,
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            if last_sweep.elapsed() >= self.config.sweep_interval {
                let evicted = self.ledger.evict_expired(self.config.finished_grace)?;
                if evicted > 0 {
                    debug!(evicted, "evicted finished command rows");
                }
                last_sweep = Instant::now();
            }
        }

        Ok(())
    }

    async fn process_frame(&mut self, payload: &[u8]) -> Result<()> {
        let message = match Envelope::decode(payload) {
            Ok(envelope) => {
                self.ledger.apply(&envelope)?;
                debug!(
                    reply_type = %envelope.reply_type,
                    command = %envelope.command,
                    correlation_id = %envelope.correlation_id,
                    "relaying"
                );
                RelayedMessage::Envelope(envelope)
            }
            Err(e) => {
                debug!("relaying undecodable payload: {e}");
                RelayedMessage::Raw(payload.to_vec())
            }
        };

        if let Some(observer) = &self.observer {
            observer(&message);
        }

        // Republish the bytes exactly as they arrived. The ledger and the
        // observer are taps, not filters.
        self.publisher.publish(payload).await
    }
}
