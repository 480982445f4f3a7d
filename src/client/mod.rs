//! Bus client.
//!
//! One type serves both roles on the bus. A commander publishes SENT
//! envelopes and polls its subscription for the matching reply; a component
//! runs [`BusClient::listen_and_process`] with a [`CommandHandler`] and
//! answers commands addressed to it with RCV, optional FDB progress, and a
//! terminal ACK or ERR.
//!
//! Because the relay rebroadcasts everything to everyone, a client sees its
//! own messages and everyone else's. All filtering happens here, by
//! correlation id on the commander side and by addressee on the component
//! side.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::core::{BusError, Envelope, ReplyType, Result, StopToken};
use crate::transport::{BusPublisher, BusSubscriber, MemoryBus, TcpPublisher, TcpSubscriber};

/// Handler outcome: `Ok` becomes an ACK reply, `Err` becomes an ERR reply.
/// Either way the payload travels in the envelope's `reply` field.
pub type HandlerResult = std::result::Result<String, String>;

/// What a commander waits for after publishing a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// Fire and forget.
    NoWait,
    /// Block until a reply of exactly this type arrives for the command,
    /// or the timeout runs out.
    Reply(ReplyType),
}

/// Command logic run by a listening component.
///
/// Simple synchronous handlers can use [`FnHandler`] instead of
/// implementing this directly.
#[async_trait]
pub trait CommandHandler: Send {
    /// Execute one command. Progress can be streamed through `feedback`
    /// while the work runs; the returned outcome becomes the terminal
    /// reply.
    async fn handle(
        &mut self,
        feedback: &mut FeedbackSender<'_>,
        command: &Envelope,
    ) -> HandlerResult;
}

/// Adapter turning a plain closure into a [`CommandHandler`] for
/// components that never send progress reports.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: FnMut(&Envelope) -> HandlerResult + Send,
{
    async fn handle(
        &mut self,
        _feedback: &mut FeedbackSender<'_>,
        command: &Envelope,
    ) -> HandlerResult {
        (self.0)(command)
    }
}

/// Borrowed publisher a handler streams FDB progress through.
pub struct FeedbackSender<'a> {
    publisher: &'a mut dyn BusPublisher,
    comp_type: &'a str,
    command: &'a Envelope,
}

impl FeedbackSender<'_> {
    /// Publish one FDB progress report for the command being handled.
    pub async fn send(&mut self, feedback: &str) -> Result<()> {
        let envelope =
            Envelope::reply(self.command, feedback, ReplyType::Fdb).with_comp_type(self.comp_type);
        self.publisher.publish(&envelope.encode()?).await
    }
}

// TCP subscriptions register with the relay's accept loop asynchronously;
// give that a moment so the first command's replies are not missed.
const CONNECT_SETTLE: Duration = Duration::from_millis(100);

/// A connected bus participant.
pub struct BusClient {
    publisher: Box<dyn BusPublisher>,
    subscriber: Box<dyn BusSubscriber>,
    config: BusConfig,
    stop: StopToken,
}

impl BusClient {
    /// Connect to a relay over TCP.
    pub async fn connect(config: BusConfig) -> Result<Self> {
        config.validate().map_err(BusError::ConfigError)?;
        let publisher =
            TcpPublisher::connect(&config.inbound_addr(), config.connect_timeout).await?;
        let subscriber =
            TcpSubscriber::connect(&config.outbound_addr(), config.connect_timeout).await?;
        info!(
            inbound = %config.inbound_addr(),
            outbound = %config.outbound_addr(),
            "connected to relay"
        );
        tokio::time::sleep(CONNECT_SETTLE).await;
        Ok(Self {
            publisher: Box::new(publisher),
            subscriber: Box::new(subscriber),
            config,
            stop: StopToken::new(),
        })
    }

    /// Attach to an in-process bus.
    pub fn in_process(bus: &MemoryBus, config: BusConfig) -> Result<Self> {
        config.validate().map_err(BusError::ConfigError)?;
        Ok(Self {
            publisher: Box::new(bus.publisher()),
            subscriber: Box::new(bus.subscriber()),
            config,
            stop: StopToken::new(),
        })
    }

    /// Token that interrupts this client's wait and listen loops from
    /// another task.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Publish a command and wait for its ACK, with the configured default
    /// timeout. `Ok(None)` means the wait timed out; the command may still
    /// be running somewhere.
    pub async fn send_command(
        &mut self,
        component: &str,
        command: &str,
        arg1: &str,
        arg2: &str,
    ) -> Result<Option<Envelope>> {
        let timeout = self.config.command_timeout;
        self.send_command_wait(
            component,
            command,
            arg1,
            arg2,
            WaitFor::Reply(ReplyType::Ack),
            timeout,
        )
        .await
    }

    /// Publish a command and wait according to `wait_for`.
    ///
    /// The wait matches on reply type exactly: waiting for an ACK ignores
    /// an ERR for the same command, which then surfaces as a timeout.
    pub async fn send_command_wait(
        &mut self,
        component: &str,
        command: &str,
        arg1: &str,
        arg2: &str,
        wait_for: WaitFor,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let envelope = self.publish_command(component, command, arg1, arg2).await?;
        match wait_for {
            WaitFor::NoWait => Ok(None),
            WaitFor::Reply(wanted) => {
                self.wait_for_reply(&envelope.correlation_id, wanted, timeout, None)
                    .await
            }
        }
    }

    /// Publish a command, stream FDB progress to `on_feedback`, and wait
    /// for the ACK with the configured default timeout.
    pub async fn send_command_with(
        &mut self,
        component: &str,
        command: &str,
        arg1: &str,
        arg2: &str,
        mut on_feedback: impl FnMut(&Envelope) + Send,
    ) -> Result<Option<Envelope>> {
        let timeout = self.config.command_timeout;
        let envelope = self.publish_command(component, command, arg1, arg2).await?;
        self.wait_for_reply(
            &envelope.correlation_id,
            ReplyType::Ack,
            timeout,
            Some(&mut on_feedback),
        )
        .await
    }

    /// Publish a command and return without waiting. The returned envelope
    /// carries the correlation id in case the caller wants to watch the
    /// bus itself.
    pub async fn send_no_wait(
        &mut self,
        component: &str,
        command: &str,
        arg1: &str,
        arg2: &str,
    ) -> Result<Envelope> {
        self.publish_command(component, command, arg1, arg2).await
    }

    /// Re-send a command until its ACK payload equals `expected_reply`.
    ///
    /// Every attempt is a fresh command with a fresh correlation id. The
    /// comparison is exact and case sensitive, `"TRUE"` does not match
    /// `"true"`. Returns `Ok(false)` when the overall timeout runs out
    /// first.
    pub async fn send_command_until(
        &mut self,
        component: &str,
        command: &str,
        expected_reply: &str,
    ) -> Result<bool> {
        info!(component, command, expected_reply, "repeating command until reply matches");
        let deadline = Instant::now() + self.config.overall_timeout;

        while Instant::now() < deadline {
            if self.stop.is_stopped() {
                return Ok(false);
            }
            let attempt_timeout = self.config.attempt_timeout;
            let response = self
                .send_command_wait(
                    component,
                    command,
                    "",
                    "",
                    WaitFor::Reply(ReplyType::Ack),
                    attempt_timeout,
                )
                .await?;
            if let Some(reply) = response {
                if reply.reply == expected_reply {
                    return Ok(true);
                }
                debug!(got = %reply.reply, "reply did not match, retrying");
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }

        info!(component, command, expected_reply, "gave up waiting for matching reply");
        Ok(false)
    }

    /// Publish an FDB progress report for a command someone else sent.
    /// Useful for observers; handlers inside [`listen_and_process`] get a
    /// [`FeedbackSender`] instead.
    ///
    /// [`listen_and_process`]: BusClient::listen_and_process
    pub async fn send_feedback(&mut self, original: &Envelope, feedback: &str) -> Result<()> {
        let envelope =
            Envelope::reply(original, feedback, ReplyType::Fdb).with_comp_type(&self.config.comp_type);
        self.publisher.publish(&envelope.encode()?).await
    }

    /// Serve commands addressed to `identity` until stopped.
    ///
    /// For each matching SENT envelope the listener publishes an RCV
    /// receipt, runs the handler, and publishes the terminal ACK or ERR. A
    /// failing handler fails its command, never this loop; undecodable and
    /// unrelated messages are skipped.
    pub async fn listen_and_process<H: CommandHandler>(
        &mut self,
        identity: &str,
        handler: &mut H,
    ) -> Result<()> {
        info!(identity, "listening for commands");

        loop {
            if self.stop.is_stopped() {
                info!(identity, "listener stopped");
                return Ok(());
            }

            let payload = match self
                .subscriber
                .recv_timeout(self.config.poll_interval)
                .await?
            {
                Some(payload) => payload,
                None => continue,
            };
            let envelope = match Envelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("skipping undecodable message: {e}");
                    continue;
                }
            };
            if envelope.reply_type != ReplyType::Sent || !envelope.is_addressed_to(identity) {
                continue;
            }

            info!(
                identity,
                command = %envelope.command,
                correlation_id = %envelope.correlation_id,
                "processing command"
            );

            let receipt =
                Envelope::reply(&envelope, "", ReplyType::Rcv).with_comp_type(&self.config.comp_type);
            self.publisher.publish(&receipt.encode()?).await?;

            let outcome = {
                let mut feedback = FeedbackSender {
                    publisher: self.publisher.as_mut(),
                    comp_type: &self.config.comp_type,
                    command: &envelope,
                };
                handler.handle(&mut feedback, &envelope).await
            };

            let terminal = match outcome {
                Ok(result) => Envelope::reply(&envelope, &result, ReplyType::Ack),
                Err(failure) => {
                    warn!(
                        identity,
                        command = %envelope.command,
                        "handler failed: {failure}"
                    );
                    Envelope::reply(&envelope, &failure, ReplyType::Err)
                }
            }
            .with_comp_type(&self.config.comp_type);
            self.publisher.publish(&terminal.encode()?).await?;
        }
    }

    async fn publish_command(
        &mut self,
        component: &str,
        command: &str,
        arg1: &str,
        arg2: &str,
    ) -> Result<Envelope> {
        let envelope = Envelope::command(component, "", command, arg1, arg2)
            .with_comp_type(&self.config.comp_type);
        info!(
            component,
            command,
            correlation_id = %envelope.correlation_id,
            "sending command"
        );
        self.publisher.publish(&envelope.encode()?).await?;
        Ok(envelope)
    }

    /// Poll the subscription until a reply of type `wanted` arrives for
    /// `correlation_id` or the deadline passes. FDB envelopes for the same
    /// command are streamed to `on_feedback` when one is given; everything
    /// else, including other reply types for this very command, is skipped.
    async fn wait_for_reply(
        &mut self,
        correlation_id: &str,
        wanted: ReplyType,
        timeout: Duration,
        mut on_feedback: Option<&mut (dyn FnMut(&Envelope) + Send)>,
    ) -> Result<Option<Envelope>> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if self.stop.is_stopped() {
                return Ok(None);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let poll = self.config.poll_interval.min(remaining);
            let payload = match self.subscriber.recv_timeout(poll).await? {
                Some(payload) => payload,
                None => continue,
            };

            let envelope = match Envelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("skipping undecodable message: {e}");
                    continue;
                }
            };
            if envelope.correlation_id != correlation_id {
                continue;
            }

            if envelope.reply_type == wanted {
                debug!(
                    correlation_id,
                    reply_type = %envelope.reply_type,
                    reply = %envelope.reply,
                    "reply received"
                );
                return Ok(Some(envelope));
            }
            if envelope.reply_type == ReplyType::Fdb {
                if let Some(observer) = on_feedback.as_mut() {
                    observer(&envelope);
                }
            }
        }

        debug!(correlation_id, wanted = %wanted, "timed out waiting for reply");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_handler_adapts_closures() {
        let mut bus = MemoryBus::new();
        let (_relay_rx, _relay_tx) = bus.relay_endpoints().unwrap();
        let mut publisher: Box<dyn BusPublisher> = Box::new(bus.publisher());

        let command = Envelope::command("motor", "", "echo", "hello", "");
        let mut feedback = FeedbackSender {
            publisher: publisher.as_mut(),
            comp_type: "rust_client",
            command: &command,
        };

        let mut handler = FnHandler(|cmd: &Envelope| Ok(format!("echo {}", cmd.arg1)));
        let outcome = handler.handle(&mut feedback, &command).await;
        assert_eq!(outcome, Ok("echo hello".to_string()));
    }

    #[tokio::test]
    async fn test_feedback_sender_publishes_fdb_for_the_command() {
        let mut bus = MemoryBus::new();
        let (mut relay_rx, _relay_tx) = bus.relay_endpoints().unwrap();
        let mut publisher: Box<dyn BusPublisher> = Box::new(bus.publisher());

        let command = Envelope::command("motor", "", "move_long", "10", "");
        let mut feedback = FeedbackSender {
            publisher: publisher.as_mut(),
            comp_type: "bench_rig",
            command: &command,
        };
        feedback.send("halfway there").await.unwrap();

        let raw = relay_rx
            .recv_timeout(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::decode(&raw).unwrap();
        assert_eq!(envelope.reply_type, ReplyType::Fdb);
        assert_eq!(envelope.reply, "halfway there");
        assert_eq!(envelope.correlation_id, command.correlation_id);
        assert_eq!(envelope.comp_type, "bench_rig");
    }

    #[tokio::test]
    async fn test_in_process_rejects_invalid_config() {
        let bus = MemoryBus::new();
        let bad = BusConfig::default().outbound_port(7000).inbound_port(7000);
        assert!(BusClient::in_process(&bus, bad).is_err());
    }
}
