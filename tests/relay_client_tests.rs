/// End-to-end command flow tests over the in-process bus
///
/// A relay plus one or more clients wired through a MemoryBus, exercising
/// the full SENT -> RCV -> FDB -> ACK/ERR lifecycle without sockets.
/// Run with: cargo test --test relay_client_tests
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cmdbus::client::{CommandHandler, FeedbackSender, HandlerResult};
use cmdbus::core::ReplyType;
use cmdbus::transport::BusPublisher;
use cmdbus::{
    BusClient, BusConfig, CommandStatus, Envelope, FnHandler, MemoryBus, RelayConfig, RelayHandle,
    RelayServer, WaitFor,
};

fn bus_config() -> BusConfig {
    BusConfig::new("localhost")
        .poll_interval(Duration::from_millis(5))
        .command_timeout(Duration::from_secs(2))
}

fn relay_config() -> RelayConfig {
    RelayConfig::new("localhost").poll_interval(Duration::from_millis(5))
}

fn start_relay(bus: &mut MemoryBus, config: RelayConfig) -> RelayHandle {
    let relay = RelayServer::in_process(bus, config).unwrap();
    let handle = relay.handle();
    tokio::spawn(relay.run());
    handle
}

#[tokio::test]
async fn test_command_round_trip_is_acknowledged() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut listener = BusClient::in_process(&bus, bus_config().comp_type("motor_rig")).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(|_cmd: &Envelope| Ok("Position Reached".to_string()));
        listener.listen_and_process("motor_X", &mut handler).await
    });

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let reply = commander
        .send_command("motor_X", "move_long", "", "")
        .await
        .unwrap()
        .expect("command should be acknowledged");

    assert_eq!(reply.reply_type, ReplyType::Ack);
    assert_eq!(reply.reply, "Position Reached");
    assert_eq!(reply.component, "motor_X");
    assert_eq!(reply.comp_type, "motor_rig");

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_wait_times_out_when_nobody_answers() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let started = std::time::Instant::now();
    let reply = commander
        .send_command_wait(
            "motor_X",
            "move_long",
            "",
            "",
            WaitFor::Reply(ReplyType::Ack),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(reply.is_none(), "no responder, the wait must time out");
    assert!(
        elapsed >= Duration::from_millis(190),
        "wait returned early after {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(1),
        "wait overshot its timeout, took {elapsed:?}"
    );

    // The relay still recorded the attempt.
    let rows = relay.snapshot().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, CommandStatus::Pending);
    assert_eq!(rows[0].envelope.command, "move_long");
    relay.stop();
}

#[tokio::test]
async fn test_no_wait_sentinel_returns_immediately() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    // Nobody listens; a fire-and-forget send must not care.
    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let started = std::time::Instant::now();
    let reply = commander
        .send_command_wait(
            "motor_X",
            "move_long",
            "",
            "",
            WaitFor::NoWait,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert!(reply.is_none(), "fire and forget never yields a reply");
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "the no-wait sentinel must not sit out the timeout"
    );

    // The command still went out on the bus.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let rows = relay.snapshot().unwrap();
        if let Some(row) = rows.iter().find(|row| row.envelope.command == "move_long") {
            assert_eq!(row.status, CommandStatus::Pending);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay never saw the fire-and-forget command"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    relay.stop();
}

#[tokio::test]
async fn test_send_no_wait_hands_back_the_sent_envelope() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let sent = commander
        .send_no_wait("motor_X", "status_get", "7", "")
        .await
        .unwrap();

    assert_eq!(sent.reply_type, ReplyType::Sent);
    assert_eq!(sent.component, "motor_X");
    assert!(!sent.correlation_id.is_empty());

    // The id lets the caller track the command on the relay.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let rows = relay.snapshot().unwrap();
        if let Some(row) = rows
            .iter()
            .find(|row| row.envelope.correlation_id == sent.correlation_id)
        {
            assert_eq!(row.status, CommandStatus::Pending);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay never recorded the command"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    relay.stop();
}

#[tokio::test]
async fn test_addressing_matches_component_or_physical_name() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(|_cmd: &Envelope| Ok("here".to_string()));
        listener.listen_and_process("motor_X", &mut handler).await
    });

    // Addressed by physical name instead of the component field.
    let mut publisher = bus.publisher();
    let command = Envelope::command("", "motor_X", "status_get", "", "");
    publisher.publish(&command.encode().unwrap()).await.unwrap();

    // The listener must have answered the physically addressed command.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let rows = relay.snapshot().unwrap();
        let row = rows
            .iter()
            .find(|row| row.envelope.correlation_id == command.correlation_id);
        if let Some(row) = row {
            if row.status == CommandStatus::Finished {
                assert_eq!(row.envelope.reply, "here");
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "physically addressed command was never acknowledged"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_commands_for_other_components_are_ignored() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let handled = Arc::new(AtomicUsize::new(0));
    let handled_clone = Arc::clone(&handled);
    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(move |_cmd: &Envelope| {
            handled_clone.fetch_add(1, Ordering::SeqCst);
            Ok("yes".to_string())
        });
        listener.listen_and_process("motor_X", &mut handler).await
    });

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let reply = commander
        .send_command_wait(
            "motor_Y",
            "status_get",
            "",
            "",
            WaitFor::Reply(ReplyType::Ack),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    assert!(reply.is_none(), "motor_X must not answer for motor_Y");
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_repeat_until_retries_until_reply_matches() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = Arc::clone(&attempts);
    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(move |_cmd: &Envelope| {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            Ok(if n >= 2 { "TRUE" } else { "FALSE" }.to_string())
        });
        listener.listen_and_process("motor_X", &mut handler).await
    });

    let config = bus_config()
        .attempt_timeout(Duration::from_millis(500))
        .retry_interval(Duration::from_millis(10))
        .overall_timeout(Duration::from_secs(5));
    let mut commander = BusClient::in_process(&bus, config).unwrap();
    let success = commander
        .send_command_until("motor_X", "status_get", "TRUE")
        .await
        .unwrap();

    assert!(success);
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "two FALSE replies then TRUE");

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_repeat_until_gives_up_after_overall_timeout() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(|_cmd: &Envelope| Ok("FALSE".to_string()));
        listener.listen_and_process("motor_X", &mut handler).await
    });

    let config = bus_config()
        .attempt_timeout(Duration::from_millis(100))
        .retry_interval(Duration::from_millis(10))
        .overall_timeout(Duration::from_millis(300));
    let mut commander = BusClient::in_process(&bus, config).unwrap();
    let success = commander
        .send_command_until("motor_X", "status_get", "TRUE")
        .await
        .unwrap();

    assert!(!success, "reply never matches, the loop must give up");

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_failing_handler_replies_err_and_keeps_listening() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(|cmd: &Envelope| {
            if cmd.command == "explode" {
                Err("boom".to_string())
            } else {
                Ok("fine".to_string())
            }
        });
        listener.listen_and_process("motor_X", &mut handler).await
    });

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let err_reply = commander
        .send_command_wait(
            "motor_X",
            "explode",
            "",
            "",
            WaitFor::Reply(ReplyType::Err),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
        .expect("handler failure should come back as ERR");
    assert_eq!(err_reply.reply_type, ReplyType::Err);
    assert_eq!(err_reply.reply, "boom");

    // The listener loop must survive its handler's failure.
    let ok_reply = commander
        .send_command("motor_X", "status_get", "", "")
        .await
        .unwrap()
        .expect("listener should still answer after a failed command");
    assert_eq!(ok_reply.reply, "fine");

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

struct SteppedWorker;

#[async_trait]
impl CommandHandler for SteppedWorker {
    async fn handle(
        &mut self,
        feedback: &mut FeedbackSender<'_>,
        _command: &Envelope,
    ) -> HandlerResult {
        for step in 1..=3 {
            feedback
                .send(&format!("step {step}/3"))
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok("done".to_string())
    }
}

#[tokio::test]
async fn test_feedback_streams_to_the_commander_while_waiting() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        listener
            .listen_and_process("motor_X", &mut SteppedWorker)
            .await
    });

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let mut progress = Vec::new();
    let reply = commander
        .send_command_with("motor_X", "move_long", "", "", |fdb| {
            progress.push(fdb.reply.clone());
        })
        .await
        .unwrap()
        .expect("stepped command should be acknowledged");

    assert_eq!(reply.reply, "done");
    assert_eq!(progress, vec!["step 1/3", "step 2/3", "step 3/3"]);

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_waiting_for_fdb_returns_the_first_progress_report() {
    let mut bus = MemoryBus::new();
    let relay = start_relay(&mut bus, relay_config());

    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        listener
            .listen_and_process("motor_X", &mut SteppedWorker)
            .await
    });

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    let reply = commander
        .send_command_wait(
            "motor_X",
            "move_long",
            "",
            "",
            WaitFor::Reply(ReplyType::Fdb),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
        .expect("the first progress report should satisfy the wait");

    assert_eq!(reply.reply_type, ReplyType::Fdb);
    assert_eq!(
        reply.reply, "step 1/3",
        "the wait must end on the first FDB, not the last"
    );

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}

#[tokio::test]
async fn test_acknowledged_commands_finish_and_get_evicted() {
    let mut bus = MemoryBus::new();
    // Sweep far in the future so eviction below is driven by the handle.
    let config = relay_config()
        .sweep_interval(Duration::from_secs(60))
        .finished_grace(Duration::from_millis(20));
    let relay = start_relay(&mut bus, config);

    let mut listener = BusClient::in_process(&bus, bus_config()).unwrap();
    let listener_stop = listener.stop_token();
    let listener_task = tokio::spawn(async move {
        let mut handler = FnHandler(|_cmd: &Envelope| Ok("done".to_string()));
        listener.listen_and_process("motor_X", &mut handler).await
    });

    let mut commander = BusClient::in_process(&bus, bus_config()).unwrap();
    commander
        .send_command("motor_X", "move_long", "", "")
        .await
        .unwrap()
        .expect("command should be acknowledged");

    let rows = relay.snapshot().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, CommandStatus::Finished);
    assert_eq!(rows[0].envelope.reply, "done");
    assert_eq!(rows[0].envelope.reply_type, ReplyType::Ack);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(relay.evict_expired().unwrap(), 1);
    assert_eq!(relay.queue_len().unwrap(), 0);

    listener_stop.stop();
    listener_task.await.unwrap().unwrap();
    relay.stop();
}
