//! HTTP monitor.
//!
//! A small read-only surface over a running relay: `GET /queue` returns the
//! live command table, `GET /health` reports liveness. It is the headless
//! counterpart of watching the relay's queue in a GUI.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::{BusError, ReplyType, Result};
use crate::ledger::{CommandStatus, LedgerEntry};
use crate::relay::RelayHandle;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

struct WebError(BusError);

impl From<BusError> for WebError {
    fn from(err: BusError) -> Self {
        Self(err)
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: "internal".to_string(),
        };
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

type WebResult<T> = std::result::Result<T, WebError>;

/// One row of `GET /queue`.
#[derive(Debug, Serialize)]
pub struct QueueRow {
    pub correlation_id: String,
    pub status: CommandStatus,
    pub component: String,
    pub comp_phys: String,
    pub command: String,
    pub reply: String,
    pub reply_type: ReplyType,
    pub tick_count: i64,
    /// When the relay first saw the command, RFC 3339
    pub added_at: String,
    pub age_secs: i64,
}

impl From<&LedgerEntry> for QueueRow {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            correlation_id: entry.envelope.correlation_id.clone(),
            status: entry.status,
            component: entry.envelope.component.clone(),
            comp_phys: entry.envelope.comp_phys.clone(),
            command: entry.envelope.command.clone(),
            reply: entry.envelope.reply.clone(),
            reply_type: entry.envelope.reply_type,
            tick_count: entry.envelope.tick_count,
            added_at: entry.added_at.to_rfc3339(),
            age_secs: (Utc::now() - entry.added_at).num_seconds(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    queue: usize,
}

async fn health(State(handle): State<RelayHandle>) -> WebResult<Json<Health>> {
    let status = if handle.is_stopped() { "stopped" } else { "ok" };
    Ok(Json(Health {
        status,
        queue: handle.queue_len()?,
    }))
}

async fn queue(State(handle): State<RelayHandle>) -> WebResult<Json<Vec<QueueRow>>> {
    let rows = handle
        .snapshot()?
        .iter()
        .map(QueueRow::from)
        .collect::<Vec<_>>();
    Ok(Json(rows))
}

pub fn build_router(handle: RelayHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queue", get(queue))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// Serve the monitor until the relay behind `handle` stops.
pub async fn serve(addr: &str, handle: RelayHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BusError::TransportError(format!("bind {addr}: {e}")))?;
    info!(addr = %listener.local_addr()?, "monitor listening");

    let watcher = handle.clone();
    let app = build_router(handle);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !watcher.is_stopped() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await?;
    Ok(())
}
