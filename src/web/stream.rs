//! Live MJPEG camera preview.

use crate::web::api::AppState;
use async_stream::stream;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};

pub const BOUNDARY: &str = "frame";
/// Bound on a single frame grab.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive failed grabs before the stream is closed.
const MAX_FRAME_FAILURES: u32 = 5;

/// Logs the end of a preview, however the client left.
struct PreviewGuard;

impl Drop for PreviewGuard {
    fn drop(&mut self) {
        tracing::info!("Camera preview stopped");
    }
}

/// One `multipart/x-mixed-replace` part carrying a JPEG.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 96);
    part.extend_from_slice(format!("--{}\r\nContent-Type: image/jpeg\r\n", BOUNDARY).as_bytes());
    part.extend_from_slice(format!("Content-Length: {}\r\n\r\n", jpeg.len()).as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// GET /api/v1/stream
pub async fn camera_stream(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.backend.clone();
    let period = state.config.camera.stream_interval();
    let mut shutdown = state.supervisor.subscribe_shutdown();
    tracing::info!("Camera preview started");

    let frames = stream! {
        let _guard = PreviewGuard;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            match tokio::time::timeout(FRAME_TIMEOUT, backend.preview_frame()).await {
                Ok(Ok(jpeg)) => {
                    failures = 0;
                    yield Ok::<_, Infallible>(mjpeg_part(&jpeg));
                }
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!("Preview frame failed: {}", e);
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!("Preview frame timed out after {:?}", FRAME_TIMEOUT);
                }
            }
            if failures >= MAX_FRAME_FAILURES {
                tracing::error!("Closing camera preview after {} failed frames", failures);
                break;
            }
        }
    };

    (
        [
            (header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(frames),
    )
}
