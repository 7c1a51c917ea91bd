//! Messages on the supervisor's priority lane. They are served ahead of the
//! command queue, including while a hardware call is in flight.

use crate::command::Command;
use crate::supervisor::ResetError;
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug)]
pub enum ControlRequest {
    /// An operator emergency stop. Carries the command so it gets its own ack.
    EmergencyStop(Command),
    /// The telemetry watchdog already latched the stop; the backend still
    /// has to be told and the queue drained.
    Watchdog { silent_for: Duration },
    /// Leave `EmergencyStop` for `Idle`.
    Reset {
        respond_to: oneshot::Sender<Result<(), ResetError>>,
    },
}
