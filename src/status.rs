//! System status state machine and the readiness flags the validator reads.

use crate::command::CommandKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    #[default]
    Idle,
    Homing,
    Moving,
    Error,
    EmergencyStop,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemStatus::Idle => "idle",
            SystemStatus::Homing => "homing",
            SystemStatus::Moving => "moving",
            SystemStatus::Error => "error",
            SystemStatus::EmergencyStop => "emergency_stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Cannot dispatch {kind} while {from}")]
    Dispatch { from: SystemStatus, kind: CommandKind },
    #[error("Cannot reset from {0}; only an emergency stop can be reset")]
    Reset(SystemStatus),
}

impl SystemStatus {
    /// State entered when a validated command starts executing.
    pub fn on_dispatch(self, kind: CommandKind) -> Result<SystemStatus, TransitionError> {
        match (self, kind) {
            (SystemStatus::Idle | SystemStatus::Error, CommandKind::Home) => Ok(SystemStatus::Homing),
            (
                SystemStatus::Idle | SystemStatus::Error,
                CommandKind::MoveNozzle | CommandKind::MoveNozzleXY | CommandKind::MoveNozzleZ | CommandKind::Zoom,
            ) => Ok(SystemStatus::Moving),
            (SystemStatus::Idle | SystemStatus::Error, CommandKind::Capture) => Ok(SystemStatus::Idle),
            (from, kind) => Err(TransitionError::Dispatch { from, kind }),
        }
    }

    /// State after the in-flight operation returns. A latched stop is kept.
    pub fn on_complete(self, succeeded: bool) -> SystemStatus {
        match self {
            SystemStatus::Homing | SystemStatus::Moving if succeeded => SystemStatus::Idle,
            SystemStatus::Homing | SystemStatus::Moving => SystemStatus::Error,
            other => other,
        }
    }
}

/// Snapshot handed to the validator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessState {
    pub homed: bool,
    pub emergency_stop_active: bool,
    pub last_telemetry_at: Instant,
    /// Last known zoom `s'` in mm.
    pub zoom_position: f64,
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self { homed: false, emergency_stop_active: false, last_telemetry_at: Instant::now(), zoom_position: 0.0 }
    }
}

#[derive(Debug)]
struct Inner {
    status: SystemStatus,
    readiness: ReadinessState,
}

/// Status and readiness behind one lock, so `EmergencyStop` and the stop
/// latch always change together. Status changes are also published on a
/// watch channel.
#[derive(Debug)]
pub struct SharedState {
    inner: Mutex<Inner>,
    status_tx: watch::Sender<SystemStatus>,
}

impl SharedState {
    pub fn new(zoom_position: f64) -> Self {
        let (status_tx, _) = watch::channel(SystemStatus::Idle);
        Self {
            inner: Mutex::new(Inner {
                status: SystemStatus::Idle,
                readiness: ReadinessState { zoom_position, ..ReadinessState::default() },
            }),
            status_tx,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = inner.status;
        let result = f(&mut inner);
        if inner.status != before {
            tracing::debug!("Status {} -> {}", before, inner.status);
            self.status_tx.send_replace(inner.status);
        }
        result
    }

    pub fn status(&self) -> SystemStatus {
        self.with(|inner| inner.status)
    }

    pub fn readiness(&self) -> ReadinessState {
        self.with(|inner| inner.readiness)
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemStatus> {
        self.status_tx.subscribe()
    }

    pub fn begin(&self, kind: CommandKind) -> Result<SystemStatus, TransitionError> {
        self.with(|inner| {
            inner.status = inner.status.on_dispatch(kind)?;
            Ok(inner.status)
        })
    }

    pub fn finish(&self, succeeded: bool) -> SystemStatus {
        self.with(|inner| {
            inner.status = inner.status.on_complete(succeeded);
            inner.status
        })
    }

    /// Latch the emergency stop. Returns false when it was already latched.
    pub fn engage_emergency_stop(&self) -> bool {
        self.with(|inner| {
            if inner.readiness.emergency_stop_active {
                return false;
            }
            inner.readiness.emergency_stop_active = true;
            inner.status = SystemStatus::EmergencyStop;
            true
        })
    }

    /// Leave `EmergencyStop` for `Idle`. The stage must be homed again and the
    /// telemetry deadline restarts.
    pub fn reset(&self) -> Result<(), TransitionError> {
        self.with(|inner| {
            if inner.status != SystemStatus::EmergencyStop {
                return Err(TransitionError::Reset(inner.status));
            }
            inner.status = SystemStatus::Idle;
            inner.readiness.emergency_stop_active = false;
            inner.readiness.homed = false;
            inner.readiness.last_telemetry_at = Instant::now();
            Ok(())
        })
    }

    pub fn set_homed(&self, homed: bool) {
        self.with(|inner| inner.readiness.homed = homed);
    }

    pub fn set_zoom_position(&self, zoom_position: f64) {
        self.with(|inner| inner.readiness.zoom_position = zoom_position);
    }

    /// Record a successful telemetry read.
    pub fn observe_telemetry(&self, zoom_position: f64) {
        self.with(|inner| {
            inner.readiness.last_telemetry_at = Instant::now();
            inner.readiness.zoom_position = zoom_position;
        });
    }
}
