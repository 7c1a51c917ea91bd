//! Command and acknowledgment data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque, unique command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for CommandId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoomAction {
    /// Relative move towards higher magnification, `value` in steps.
    In,
    /// Relative move towards lower magnification, `value` in steps.
    Out,
    Home,
    /// Absolute move, `value` is the target `s'` in mm.
    Goto,
}

/// Kind-specific request parameters. Feedrates are mm/min.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandRequest {
    MoveNozzle { x: f64, y: f64, z: f64, feedrate: Option<u32> },
    #[serde(rename = "move_nozzle_xy")]
    MoveNozzleXY { x: f64, y: f64, feedrate: Option<u32> },
    MoveNozzleZ { z: f64, feedrate: Option<u32> },
    Zoom { action: ZoomAction, #[serde(default)] value: f64 },
    Home,
    EmergencyStop,
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    MoveNozzle,
    #[serde(rename = "move_nozzle_xy")]
    MoveNozzleXY,
    MoveNozzleZ,
    Zoom,
    Home,
    EmergencyStop,
    Capture,
}

impl CommandRequest {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandRequest::MoveNozzle { .. } => CommandKind::MoveNozzle,
            CommandRequest::MoveNozzleXY { .. } => CommandKind::MoveNozzleXY,
            CommandRequest::MoveNozzleZ { .. } => CommandKind::MoveNozzleZ,
            CommandRequest::Zoom { .. } => CommandKind::Zoom,
            CommandRequest::Home => CommandKind::Home,
            CommandRequest::EmergencyStop => CommandKind::EmergencyStop,
            CommandRequest::Capture => CommandKind::Capture,
        }
    }

    /// Fill in a missing feedrate.
    pub fn with_default_feedrate(self, default: u32) -> Self {
        match self {
            CommandRequest::MoveNozzle { x, y, z, feedrate } => {
                CommandRequest::MoveNozzle { x, y, z, feedrate: Some(feedrate.unwrap_or(default)) }
            }
            CommandRequest::MoveNozzleXY { x, y, feedrate } => {
                CommandRequest::MoveNozzleXY { x, y, feedrate: Some(feedrate.unwrap_or(default)) }
            }
            CommandRequest::MoveNozzleZ { z, feedrate } => {
                CommandRequest::MoveNozzleZ { z, feedrate: Some(feedrate.unwrap_or(default)) }
            }
            other => other,
        }
    }
}

impl CommandKind {
    /// Whether the command drives the gantry or the zoom rail.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            CommandKind::MoveNozzle
                | CommandKind::MoveNozzleXY
                | CommandKind::MoveNozzleZ
                | CommandKind::Zoom
                | CommandKind::Home
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::MoveNozzle => "move_nozzle",
            CommandKind::MoveNozzleXY => "move_nozzle_xy",
            CommandKind::MoveNozzleZ => "move_nozzle_z",
            CommandKind::Zoom => "zoom",
            CommandKind::Home => "home",
            CommandKind::EmergencyStop => "emergency_stop",
            CommandKind::Capture => "capture",
        };
        f.write_str(name)
    }
}

/// A submitted command. Never mutated after creation; outcomes live in [`CommandAck`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub id: CommandId,
    pub request: CommandRequest,
    pub submitted_at: DateTime<Utc>,
}

impl Command {
    pub fn new(request: CommandRequest) -> Self {
        Self { id: CommandId::new(), request, submitted_at: Utc::now() }
    }

    pub fn kind(&self) -> CommandKind {
        self.request.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Pending,
    Ok,
    #[serde(rename = "err")]
    Error,
}

impl AckStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckStatus::Pending)
    }
}

/// Machine-readable failure code carried by Error acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckReason {
    EmergencyStopActive,
    NotHomed,
    OutOfRange,
    MalformedCommand,
    HardwareFault,
    Timeout,
    /// The command was executing when the emergency stop engaged.
    StoppedInFlight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub id: CommandId,
    pub status: AckStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<AckReason>,
    /// Diagnostic context for failures (error chain, timing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CommandAck {
    pub fn pending(id: CommandId) -> Self {
        Self {
            id,
            status: AckStatus::Pending,
            message: "Command queued".to_string(),
            timestamp: Utc::now(),
            reason: None,
            detail: None,
        }
    }

    pub fn ok(id: CommandId, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Ok,
            message: message.into(),
            timestamp: Utc::now(),
            reason: None,
            detail: None,
        }
    }

    pub fn error(id: CommandId, reason: AckReason, message: impl Into<String>) -> Self {
        Self {
            id,
            status: AckStatus::Error,
            message: message.into(),
            timestamp: Utc::now(),
            reason: Some(reason),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
