//! Request and response bodies of the HTTP API.

use crate::command::{AckStatus, CommandId};
use crate::config::Config;
use crate::status::SystemStatus;
use crate::supervisor::QueueStatus;
use serde::{Deserialize, Serialize};

/// Reply to an accepted submission.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: CommandId,
    pub status: AckStatus,
}

#[derive(Debug, Deserialize)]
pub struct CommandListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub queue: QueueStatus,
    /// Last known zoom `s'` in mm.
    pub zoom_position: f64,
    /// Milliseconds since the last successful telemetry read.
    pub telemetry_age_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub result: &'static str,
    pub status: SystemStatus,
    pub homed: bool,
}

/// Configuration as served to clients, with secrets masked.
pub fn redacted_config(config: &Config) -> Config {
    let mut config = config.clone();
    if config.web.reset_token.is_some() {
        config.web.reset_token = Some("********".to_string());
    }
    config
}
