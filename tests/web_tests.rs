/// HTTP monitor tests
///
/// Drives the monitor router directly with tower's oneshot, no sockets,
/// backed by a live in-process relay.
/// Run with: cargo test --test web_tests
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use cmdbus::transport::BusPublisher;
use cmdbus::web::build_router;
use cmdbus::{Envelope, MemoryBus, RelayConfig, RelayHandle, RelayServer};
use serde_json::Value;
use tower::ServiceExt;

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn decode_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn start_relay(bus: &mut MemoryBus) -> RelayHandle {
    let config = RelayConfig::new("localhost").poll_interval(Duration::from_millis(5));
    let relay = RelayServer::in_process(bus, config).unwrap();
    let handle = relay.handle();
    tokio::spawn(relay.run());
    handle
}

async fn wait_for_queue(handle: &RelayHandle, wanted: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while handle.queue_len().unwrap() != wanted {
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay never ingested {wanted} command(s)"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_health_reports_ok_and_queue_depth() {
    let mut bus = MemoryBus::new();
    let handle = start_relay(&mut bus);
    let router = build_router(handle.clone());

    let response = router.clone().oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue"], 0);

    let mut publisher = bus.publisher();
    let command = Envelope::command("motor_X", "", "move_long", "", "");
    publisher.publish(&command.encode().unwrap()).await.unwrap();
    wait_for_queue(&handle, 1).await;

    let response = router.oneshot(get_request("/health")).await.unwrap();
    let body = decode_json(response).await;
    assert_eq!(body["queue"], 1);
    handle.stop();
}

#[tokio::test]
async fn test_queue_lists_commands_with_their_wire_fields() {
    let mut bus = MemoryBus::new();
    let handle = start_relay(&mut bus);
    let router = build_router(handle.clone());

    let mut publisher = bus.publisher();
    let command = Envelope::command("motor_X", "phys_7", "status_get", "fast", "");
    publisher.publish(&command.encode().unwrap()).await.unwrap();
    wait_for_queue(&handle, 1).await;

    let response = router.oneshot(get_request("/queue")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;

    let rows = body.as_array().expect("queue is a json array");
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["correlation_id"], command.correlation_id.as_str());
    assert_eq!(row["status"], "PENDING");
    assert_eq!(row["component"], "motor_X");
    assert_eq!(row["comp_phys"], "phys_7");
    assert_eq!(row["command"], "status_get");
    assert_eq!(row["reply_type"], "SENT");
    assert!(row["tick_count"].as_i64().unwrap() > 0);
    assert!(row["added_at"].is_string());
    assert!(row["age_secs"].as_i64().unwrap() >= 0);
    handle.stop();
}

#[tokio::test]
async fn test_queue_is_ordered_by_tick_count() {
    let mut bus = MemoryBus::new();
    let handle = start_relay(&mut bus);
    let router = build_router(handle.clone());

    let mut publisher = bus.publisher();
    let mut late = Envelope::command("motor_X", "", "second", "", "");
    late.tick_count = 2_000;
    let mut early = Envelope::command("motor_X", "", "first", "", "");
    early.tick_count = 1_000;
    publisher.publish(&late.encode().unwrap()).await.unwrap();
    publisher.publish(&early.encode().unwrap()).await.unwrap();
    wait_for_queue(&handle, 2).await;

    let response = router.oneshot(get_request("/queue")).await.unwrap();
    let body = decode_json(response).await;
    let rows = body.as_array().unwrap();
    assert_eq!(rows[0]["command"], "first");
    assert_eq!(rows[1]["command"], "second");
    handle.stop();
}

#[tokio::test]
async fn test_health_reports_stopped_after_shutdown() {
    let mut bus = MemoryBus::new();
    let handle = start_relay(&mut bus);
    let router = build_router(handle.clone());

    handle.stop();

    let response = router.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = decode_json(response).await;
    assert_eq!(body["status"], "stopped");
}
