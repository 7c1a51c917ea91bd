//! Server-sent events: telemetry snapshots and command acks.

use crate::web::api::AppState;
use async_stream::stream;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::Stream;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;

pub const TELEMETRY_EVENT: &str = "telemetry.position";
pub const ACK_EVENT: &str = "telemetry.command_ack";

/// GET /api/v1/events
pub async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut telemetry = state.telemetry.subscribe();
    let mut acks = state.supervisor.subscribe_acks();
    let stream = stream! {
        loop {
            let next = tokio::select! {
                snapshot = telemetry.recv() => snapshot.map(|s| Event::default().event(TELEMETRY_EVENT).json_data(s)),
                ack = acks.recv() => ack.map(|a| Event::default().event(ACK_EVENT).json_data(a)),
            };
            match next {
                Ok(Ok(event)) => yield Ok(event),
                Ok(Err(e)) => tracing::warn!("Failed to encode event: {}", e),
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Event subscriber skipped {} messages", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}
