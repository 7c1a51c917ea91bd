//! Safety validation run by the supervisor before any command reaches a backend.
//!
//! Gates are applied in a fixed order and the first failure wins:
//! stop latch, homing, shape, then travel limits.

use crate::command::{AckReason, Command, CommandKind, CommandRequest, ZoomAction};
use crate::config::{AxisLimits, Limits};
use crate::status::ReadinessState;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectionReason {
    #[error("Emergency stop is active")]
    EmergencyStopActive,
    #[error("Stage is not homed; send home first")]
    NotHomed,
    #[error("{axis} target {value:.3} outside limits [{min:.3}, {max:.3}]")]
    OutOfRange { axis: &'static str, value: f64, min: f64, max: f64 },
    #[error("Malformed command: {0}")]
    MalformedCommand(String),
}

impl RejectionReason {
    pub fn code(&self) -> AckReason {
        match self {
            RejectionReason::EmergencyStopActive => AckReason::EmergencyStopActive,
            RejectionReason::NotHomed => AckReason::NotHomed,
            RejectionReason::OutOfRange { .. } => AckReason::OutOfRange,
            RejectionReason::MalformedCommand(_) => AckReason::MalformedCommand,
        }
    }
}

fn finite(name: &str, value: f64) -> Result<(), RejectionReason> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RejectionReason::MalformedCommand(format!("{} must be a finite number", name)))
    }
}

fn feedrate(value: Option<u32>) -> Result<(), RejectionReason> {
    match value {
        Some(0) => Err(RejectionReason::MalformedCommand("feedrate must be > 0".to_string())),
        _ => Ok(()),
    }
}

/// Shape checks that do not depend on machine state.
pub fn check_shape(request: &CommandRequest) -> Result<(), RejectionReason> {
    match request {
        CommandRequest::MoveNozzle { x, y, z, feedrate: f } => {
            finite("x", *x)?;
            finite("y", *y)?;
            finite("z", *z)?;
            feedrate(*f)
        }
        CommandRequest::MoveNozzleXY { x, y, feedrate: f } => {
            finite("x", *x)?;
            finite("y", *y)?;
            feedrate(*f)
        }
        CommandRequest::MoveNozzleZ { z, feedrate: f } => {
            finite("z", *z)?;
            feedrate(*f)
        }
        CommandRequest::Zoom { action, value } => {
            finite("value", *value)?;
            if matches!(action, ZoomAction::In | ZoomAction::Out) && *value < 0.0 {
                return Err(RejectionReason::MalformedCommand("zoom steps must not be negative".to_string()));
            }
            Ok(())
        }
        CommandRequest::Home | CommandRequest::EmergencyStop | CommandRequest::Capture => Ok(()),
    }
}

/// Absolute `s'` a zoom command would end at.
pub fn resolve_zoom_target(action: ZoomAction, value: f64, current: f64, limits: &Limits) -> f64 {
    match action {
        ZoomAction::In => current + value / limits.zoom_steps_per_mm,
        ZoomAction::Out => current - value / limits.zoom_steps_per_mm,
        ZoomAction::Goto => value,
        ZoomAction::Home => limits.zoom.min,
    }
}

fn within(axis: &'static str, value: f64, range: AxisLimits) -> Result<(), RejectionReason> {
    if range.contains(value) {
        Ok(())
    } else {
        Err(RejectionReason::OutOfRange { axis, value, min: range.min, max: range.max })
    }
}

/// Decide whether `command` may be dispatched. Pure; never touches hardware.
pub fn validate(command: &Command, limits: &Limits, readiness: &ReadinessState) -> Result<(), RejectionReason> {
    let kind = command.kind();
    if readiness.emergency_stop_active && kind != CommandKind::EmergencyStop {
        return Err(RejectionReason::EmergencyStopActive);
    }
    if kind.is_motion() && kind != CommandKind::Home && !readiness.homed {
        return Err(RejectionReason::NotHomed);
    }
    check_shape(&command.request)?;
    match &command.request {
        CommandRequest::MoveNozzle { x, y, z, .. } => {
            within("x", *x, limits.x)?;
            within("y", *y, limits.y)?;
            within("z", *z, limits.z)
        }
        CommandRequest::MoveNozzleXY { x, y, .. } => {
            within("x", *x, limits.x)?;
            within("y", *y, limits.y)
        }
        CommandRequest::MoveNozzleZ { z, .. } => within("z", *z, limits.z),
        CommandRequest::Zoom { action, value } => {
            let target = resolve_zoom_target(*action, *value, readiness.zoom_position, limits);
            within("zoom", target, limits.zoom)
        }
        CommandRequest::Home | CommandRequest::EmergencyStop | CommandRequest::Capture => Ok(()),
    }
}
