use crate::web::api::AppState;
use axum::response::IntoResponse;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::net::IpAddr;
use std::str::FromStr;

/// Middleware rate limiting emergency-stop reset attempts per IP.
pub async fn reset_rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    // Peer address when served with connect info, else the proxy header.
    let ip = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').next())
                .and_then(|s| IpAddr::from_str(s.trim()).ok())
        })
        .unwrap_or(IpAddr::from([127, 0, 0, 1]));

    if !state.rate_limiter.check_and_increment(ip).await {
        let tracked = state.rate_limiter.tracked().await;
        tracing::warn!(%ip, tracked, "Emergency stop reset rate limited");
        let body = axum::Json(serde_json::json!({ "error": "Too many reset attempts" }));
        return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    }
    next.run(req).await
}
