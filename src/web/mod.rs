//! HTTP transport: command submission, status queries, the emergency-stop
//! reset, a server-sent event stream and the live camera preview.

pub mod api;
pub mod auth;
pub mod events;
pub mod models;
pub mod rate_limiter;
pub mod reset_rate_limit;
pub mod stream;
