// src/hardware/mod.rs - Hardware capability interface shared by all backends
pub mod camera;
pub mod serial;
pub mod simulated;

use crate::command::ZoomAction;
use crate::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use serial::SerialBackend;
pub use simulated::SimulatedBackend;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Serial port error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not connected to hardware")]
    NotConnected,
    #[error("Controller replied: {0}")]
    Protocol(String),
    #[error("Timeout waiting for {0}")]
    Timeout(String),
    #[error("Emergency stop engaged during {0}")]
    EmergencyStop(String),
    #[error("Camera error: {0}")]
    Camera(String),
    #[error("Hardware fault: {0}")]
    Fault(String),
}

impl HardwareError {
    /// The controller has halted itself (stop latch set, or a `!!` kill
    /// reply). Nothing more may be sent to it until an operator reset.
    pub fn is_safety_critical(&self) -> bool {
        match self {
            HardwareError::EmergencyStop(_) => true,
            HardwareError::Protocol(reply) => reply.trim_start().starts_with("!!"),
            _ => false,
        }
    }
}

/// Which backend drives the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Simulated stage, zoom and camera; nothing is sent to a controller.
    Sim,
    /// G-code controller over serial plus an external still-capture command.
    Real,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendMode::Sim => f.write_str("sim"),
            BackendMode::Real => f.write_str("real"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Absolute gantry target. Axes left as `None` do not move.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MoveTarget {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl MoveTarget {
    /// Resolve against the current position.
    pub fn resolve(&self, from: Position) -> Position {
        Position {
            x: self.x.unwrap_or(from.x),
            y: self.y.unwrap_or(from.y),
            z: self.z.unwrap_or(from.z),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ZoomReading {
    /// Image distance `s'` in mm.
    pub position: f64,
    pub magnification: f64,
    pub percent: f64,
}

/// One telemetry read from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub position: Position,
    pub zoom: ZoomReading,
    pub timestamped_at: chrono::DateTime<chrono::Utc>,
}

/// Capability interface implemented by every stage backend.
///
/// Only the supervisor task calls the mutating operations, one at a time,
/// except `emergency_stop`, which it may issue while another call is still
/// pending. Implementations must therefore accept `emergency_stop` at any
/// moment and make it idempotent. `read_telemetry` is polled from the
/// telemetry task and must not block on hardware I/O.
#[async_trait]
pub trait StageBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn initialize(&self) -> Result<(), HardwareError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), HardwareError> {
        Ok(())
    }

    /// Home the gantry and the zoom rail.
    async fn home(&self) -> Result<(), HardwareError>;

    async fn move_to(&self, target: MoveTarget, feedrate: u32) -> Result<(), HardwareError>;

    async fn zoom(&self, action: ZoomAction, value: f64) -> Result<(), HardwareError>;

    async fn emergency_stop(&self) -> Result<(), HardwareError>;

    /// Release the stop latch after an explicit operator reset.
    async fn clear_emergency_stop(&self) -> Result<(), HardwareError>;

    /// Capture a still and return its file name.
    async fn capture_image(&self) -> Result<String, HardwareError>;

    async fn read_telemetry(&self) -> Result<TelemetrySample, HardwareError>;

    /// One JPEG frame for the live preview. Read-only, like `read_telemetry`;
    /// called from the stream handler, never from the supervisor.
    async fn preview_frame(&self) -> Result<Vec<u8>, HardwareError>;
}

/// Build the backend selected on the command line.
pub fn create_backend(mode: BackendMode, config: &Config) -> Arc<dyn StageBackend> {
    tracing::info!("Creating {} backend", mode);
    match mode {
        BackendMode::Sim => Arc::new(SimulatedBackend::new(config)),
        BackendMode::Real => Arc::new(SerialBackend::new(config)),
    }
}
