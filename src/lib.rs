//! stagehand-rs: command execution and safety supervisor for a camera
//! inspection gantry (3-axis nozzle stage, zoom actuator, camera).
//!
//! The [`supervisor`] owns the hardware: everything else either submits
//! commands through a [`supervisor::SupervisorHandle`] or reads snapshots.

pub mod command;
pub mod config;
pub mod control;
pub mod hardware;
pub mod history;
pub mod queue;
pub mod safety;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;
pub mod web;

pub use command::{AckReason, AckStatus, Command, CommandAck, CommandId, CommandKind, CommandRequest, ZoomAction};
pub use config::Config;
pub use hardware::{BackendMode, HardwareError, StageBackend};
pub use status::SystemStatus;
pub use supervisor::{Supervisor, SupervisorHandle};
