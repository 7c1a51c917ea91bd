//! # Command Execution Supervisor
//!
//! The only task that drives the stage. Commands arrive in FIFO order on the
//! command queue and are validated, dispatched and finalized one at a time.
//! Emergency stops, watchdog trips and resets arrive on a separate priority
//! lane that is polled ahead of the queue, including while a hardware call is
//! pending.
//!
//! ```text
//! SupervisorHandle::submit --> ledger (Pending) --> queue --> Supervisor::process
//!                                                                |  validate
//!                                                                |  StageBackend call (timeout, own task)
//!                                                                v
//!                                          ledger (Ok/Error) + ack broadcast
//! ```
//!
//! Every command that was accepted gets exactly one terminal ack, whatever
//! the outcome of its hardware call (error, timeout or panic). A failure that
//! says the controller halted itself latches the emergency stop as well.

use crate::command::{AckReason, Command, CommandAck, CommandId, CommandKind, CommandRequest};
use crate::config::{Config, Limits};
use crate::control::ControlRequest;
use crate::hardware::{HardwareError, MoveTarget, StageBackend, TelemetrySample};
use crate::history::CommandLedger;
use crate::queue::{QueueError, QueueReceiver, QueueSender, command_queue};
use crate::safety::{self, RejectionReason};
use crate::status::{ReadinessState, SharedState, SystemStatus, TransitionError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

/// Ack stream depth; slow subscribers lag rather than block the supervisor.
const ACK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Malformed(#[from] RejectionReason),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Supervisor is not running")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResetError {
    #[error(transparent)]
    NotStopped(#[from] TransitionError),
    #[error("A command is still executing; retry once it completes")]
    Busy,
    #[error("Backend refused to clear the stop: {0}")]
    Hardware(String),
    #[error("Supervisor is not running")]
    Unavailable,
}

/// Snapshot of the supervisor for operators.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub current_command: Option<CommandId>,
    pub current_kind: Option<CommandKind>,
    pub status: SystemStatus,
    pub homed: bool,
    pub emergency_stop_active: bool,
    pub history_size: usize,
}

/// Producer-side API. Cheap to clone; never blocks on hardware.
#[derive(Clone)]
pub struct SupervisorHandle {
    queue: QueueSender,
    control: mpsc::UnboundedSender<ControlRequest>,
    state: Arc<SharedState>,
    ledger: Arc<CommandLedger>,
    acks: broadcast::Sender<CommandAck>,
    shutdown: broadcast::Sender<()>,
    feedrate_default: u32,
}

impl SupervisorHandle {
    /// Accept a command for execution. Only malformed input, a full queue or
    /// a stopped supervisor are refused here; every other outcome arrives as
    /// the command's terminal ack.
    pub async fn submit(&self, request: CommandRequest) -> Result<CommandId, SubmitError> {
        safety::check_shape(&request)?;
        let command = Command::new(request.with_default_feedrate(self.feedrate_default));
        let id = command.id;
        tracing::debug!(command_id = %id, kind = %command.kind(), "Command submitted");
        // Pending goes in first so the terminal ack always replaces it.
        self.ledger.record(CommandAck::pending(id)).await;
        let sent = if command.kind() == CommandKind::EmergencyStop {
            self.control.send(ControlRequest::EmergencyStop(command)).map_err(|_| SubmitError::Stopped)
        } else {
            self.queue.enqueue(command).map(|_| ()).map_err(|e| match e {
                QueueError::Closed => SubmitError::Stopped,
                full => SubmitError::Queue(full),
            })
        };
        if let Err(e) = sent {
            self.ledger.remove(&id).await;
            tracing::warn!(command_id = %id, "Command refused: {}", e);
            return Err(e);
        }
        Ok(id)
    }

    pub async fn get_status(&self, id: &CommandId) -> Option<CommandAck> {
        self.ledger.get(id).await
    }

    pub async fn recent(&self, limit: usize) -> Vec<CommandAck> {
        self.ledger.recent(limit).await
    }

    /// Terminal acks in completion order.
    pub fn subscribe_acks(&self) -> broadcast::Receiver<CommandAck> {
        self.acks.subscribe()
    }

    pub fn system_status(&self) -> SystemStatus {
        self.state.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SystemStatus> {
        self.state.subscribe()
    }

    pub fn readiness(&self) -> ReadinessState {
        self.state.readiness()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let current = self.queue.peek_current();
        let readiness = self.state.readiness();
        QueueStatus {
            queue_length: self.queue.len(),
            current_command: current.as_ref().map(|c| c.id),
            current_kind: current.as_ref().map(Command::kind),
            status: self.state.status(),
            homed: readiness.homed,
            emergency_stop_active: readiness.emergency_stop_active,
            history_size: self.ledger.len().await,
        }
    }

    /// Explicit operator reset out of `EmergencyStop`. The stage must be
    /// homed again before motion is accepted.
    pub async fn reset_emergency_stop(&self) -> Result<(), ResetError> {
        let (respond_to, response) = oneshot::channel();
        self.control.send(ControlRequest::Reset { respond_to }).map_err(|_| ResetError::Unavailable)?;
        response.await.map_err(|_| ResetError::Unavailable)?
    }

    /// Refresh the telemetry heartbeat the watchdog checks.
    pub fn observe_telemetry(&self, sample: &TelemetrySample) {
        self.state.observe_telemetry(sample.zoom.position);
    }

    /// Latch the stop on behalf of the watchdog. Returns false when it was
    /// already latched.
    pub(crate) fn trip_watchdog(&self, silent_for: Duration) -> bool {
        if !self.state.engage_emergency_stop() {
            return false;
        }
        tracing::error!("Telemetry silent for {:?}; emergency stop engaged", silent_for);
        let _ = self.control.send(ControlRequest::Watchdog { silent_for });
        true
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Stop the supervisor loop and the background tasks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

pub struct Supervisor {
    backend: Arc<dyn StageBackend>,
    queue: QueueReceiver,
    control: mpsc::UnboundedReceiver<ControlRequest>,
    state: Arc<SharedState>,
    ledger: Arc<CommandLedger>,
    acks: broadcast::Sender<CommandAck>,
    shutdown_rx: broadcast::Receiver<()>,
    limits: Limits,
    hardware_timeout: Duration,
    feedrate_default: u32,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn StageBackend>, config: &Config) -> (Self, SupervisorHandle) {
        let (queue_tx, queue_rx) = command_queue(config.supervisor.queue_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (acks, _) = broadcast::channel(ACK_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let state = Arc::new(SharedState::new(config.zoom.min_s_prime));
        let ledger = Arc::new(CommandLedger::new(config.supervisor.history_capacity));

        let handle = SupervisorHandle {
            queue: queue_tx,
            control: control_tx,
            state: state.clone(),
            ledger: ledger.clone(),
            acks: acks.clone(),
            shutdown,
            feedrate_default: config.stage.feedrate_default,
        };
        let supervisor = Self {
            backend,
            queue: queue_rx,
            control: control_rx,
            state,
            ledger,
            acks,
            shutdown_rx,
            limits: config.limits(),
            hardware_timeout: config.safety.hardware_timeout(),
            feedrate_default: config.stage.feedrate_default,
        };
        (supervisor, handle)
    }

    pub async fn run(mut self) {
        tracing::info!("Supervisor started with {} backend", self.backend.name());
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => break,
                Some(request) = self.control.recv() => {
                    self.handle_control(request, false).await;
                }
                next = self.queue.dequeue_next() => match next {
                    Some(command) => self.process(command).await,
                    None => break,
                },
            }
        }
        tracing::info!("Supervisor stopped");
    }

    async fn process(&mut self, command: Command) {
        let id = command.id;
        let kind = command.kind();
        if kind == CommandKind::EmergencyStop {
            self.handle_control(ControlRequest::EmergencyStop(command), false).await;
            return;
        }

        let readiness = self.state.readiness();
        if let Err(reason) = safety::validate(&command, &self.limits, &readiness) {
            tracing::warn!(command_id = %id, %kind, "Command rejected: {}", reason);
            self.finalize(CommandAck::error(id, reason.code(), reason.to_string())).await;
            return;
        }
        if let Err(e) = self.state.begin(kind) {
            // The watchdog latched the stop after validation.
            tracing::warn!(command_id = %id, %kind, "Command rejected: {}", e);
            self.finalize(CommandAck::error(id, AckReason::EmergencyStopActive, e.to_string())).await;
            return;
        }
        let zoom_target = match &command.request {
            CommandRequest::Zoom { action, value } => {
                Some(safety::resolve_zoom_target(*action, *value, readiness.zoom_position, &self.limits))
            }
            _ => None,
        };

        tracing::debug!(command_id = %id, %kind, "Dispatching");
        self.queue.set_current(Some(command.clone()));
        let started = Instant::now();
        let task = tokio::spawn(execute(self.backend.clone(), command.request.clone(), self.feedrate_default));
        let abort = task.abort_handle();
        let call = tokio::time::timeout(self.hardware_timeout, task);
        tokio::pin!(call);

        let mut stopped_in_flight = false;
        let outcome = loop {
            tokio::select! {
                biased;
                Some(request) = self.control.recv() => {
                    stopped_in_flight |= self.handle_control(request, true).await;
                }
                outcome = &mut call => break outcome,
            }
        };
        self.queue.set_current(None);
        let elapsed = started.elapsed();

        let halted = matches!(&outcome, Ok(Ok(Err(e))) if e.is_safety_critical());
        let result = match outcome {
            Ok(Ok(Ok(message))) => Ok(message),
            Ok(Ok(Err(e))) => Err((AckReason::HardwareFault, format!("{} failed", kind), e.to_string())),
            Ok(Err(join_error)) => Err((AckReason::HardwareFault, format!("{} aborted", kind), join_error.to_string())),
            Err(_) => {
                abort.abort();
                Err((
                    AckReason::Timeout,
                    format!("{} timed out after {:?}", kind, self.hardware_timeout),
                    "hardware call exceeded safety.hardware_timeout_ms".to_string(),
                ))
            }
        };

        let stopped = stopped_in_flight || self.state.readiness().emergency_stop_active;
        if !stopped {
            self.apply_side_effects(kind, zoom_target, result.is_ok());
        }
        // A controller that halted itself is latched here too.
        let escalate = halted && !stopped && self.state.engage_emergency_stop();
        let status = self.state.finish(result.is_ok());

        let ack = if stopped {
            let detail = match result {
                Ok(message) => format!("call returned ok ({}) after {:?}", message, elapsed),
                Err((_, _, detail)) => detail,
            };
            tracing::warn!(command_id = %id, %kind, "Command interrupted by emergency stop");
            CommandAck::error(id, AckReason::StoppedInFlight, format!("{} interrupted by emergency stop", kind))
                .with_detail(detail)
        } else {
            match result {
                Ok(message) => {
                    tracing::debug!(command_id = %id, %kind, ?elapsed, %status, "Command completed");
                    CommandAck::ok(id, message)
                }
                Err((reason, message, detail)) => {
                    tracing::error!(command_id = %id, %kind, ?elapsed, "{}: {}", message, detail);
                    CommandAck::error(id, reason, message).with_detail(format!("{} (after {:?})", detail, elapsed))
                }
            }
        };
        self.finalize(ack).await;

        if escalate {
            tracing::error!(command_id = %id, %kind, "Controller halted; emergency stop engaged");
            self.stop_backend().await;
            self.drain_queue().await;
        }
    }

    fn apply_side_effects(&self, kind: CommandKind, zoom_target: Option<f64>, succeeded: bool) {
        match kind {
            CommandKind::Home if succeeded => {
                self.state.set_homed(true);
                self.state.set_zoom_position(self.limits.zoom.min);
            }
            // Position is unknown after a failed home.
            CommandKind::Home => self.state.set_homed(false),
            CommandKind::Zoom if succeeded => {
                if let Some(target) = zoom_target {
                    self.state.set_zoom_position(target);
                }
            }
            _ => {}
        }
    }

    /// Serve one priority-lane request. Returns true when it engaged the stop.
    async fn handle_control(&mut self, request: ControlRequest, in_flight: bool) -> bool {
        match request {
            ControlRequest::EmergencyStop(command) => {
                if !self.state.engage_emergency_stop() {
                    tracing::info!(command_id = %command.id, "Emergency stop already active");
                    self.finalize(CommandAck::ok(command.id, "Emergency stop already active")).await;
                    return false;
                }
                tracing::error!(command_id = %command.id, in_flight, "Emergency stop engaged");
                self.stop_backend().await;
                self.finalize(CommandAck::ok(command.id, "Emergency stop engaged")).await;
                self.drain_queue().await;
                true
            }
            ControlRequest::Watchdog { silent_for } => {
                tracing::error!(?silent_for, in_flight, "Stopping backend after watchdog trip");
                self.stop_backend().await;
                self.drain_queue().await;
                true
            }
            ControlRequest::Reset { respond_to } => {
                let result = if in_flight { Err(ResetError::Busy) } else { self.reset().await };
                let _ = respond_to.send(result);
                false
            }
        }
    }

    async fn stop_backend(&self) {
        match tokio::time::timeout(self.hardware_timeout, self.backend.emergency_stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Backend emergency stop failed: {}", e),
            Err(_) => tracing::error!("Backend emergency stop timed out"),
        }
    }

    async fn drain_queue(&mut self) {
        while let Some(command) = self.queue.try_dequeue() {
            tracing::warn!(command_id = %command.id, kind = %command.kind(), "Discarding queued command");
            let ack = CommandAck::error(
                command.id,
                AckReason::EmergencyStopActive,
                "Discarded: emergency stop active",
            );
            self.finalize(ack).await;
        }
    }

    async fn reset(&mut self) -> Result<(), ResetError> {
        if !self.state.readiness().emergency_stop_active {
            return Err(TransitionError::Reset(self.state.status()).into());
        }
        match tokio::time::timeout(self.hardware_timeout, self.backend.clear_emergency_stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ResetError::Hardware(e.to_string())),
            Err(_) => return Err(ResetError::Hardware("clear timed out".to_string())),
        }
        self.state.reset()?;
        tracing::info!("Emergency stop reset; stage must be homed before motion");
        Ok(())
    }

    async fn finalize(&self, ack: CommandAck) {
        self.ledger.record(ack.clone()).await;
        // No subscribers is fine.
        let _ = self.acks.send(ack);
    }
}

/// Run one command against the backend. Spawned so a panicking backend
/// surfaces as a `JoinError` instead of taking the supervisor down.
async fn execute(
    backend: Arc<dyn StageBackend>,
    request: CommandRequest,
    feedrate_default: u32,
) -> Result<String, HardwareError> {
    match request {
        CommandRequest::Home => {
            backend.home().await?;
            Ok("Homing complete".to_string())
        }
        CommandRequest::MoveNozzle { x, y, z, feedrate } => {
            let target = MoveTarget { x: Some(x), y: Some(y), z: Some(z) };
            backend.move_to(target, feedrate.unwrap_or(feedrate_default)).await?;
            Ok(format!("Moved to X{:.3} Y{:.3} Z{:.3}", x, y, z))
        }
        CommandRequest::MoveNozzleXY { x, y, feedrate } => {
            let target = MoveTarget { x: Some(x), y: Some(y), z: None };
            backend.move_to(target, feedrate.unwrap_or(feedrate_default)).await?;
            Ok(format!("Moved to X{:.3} Y{:.3}", x, y))
        }
        CommandRequest::MoveNozzleZ { z, feedrate } => {
            let target = MoveTarget { x: None, y: None, z: Some(z) };
            backend.move_to(target, feedrate.unwrap_or(feedrate_default)).await?;
            Ok(format!("Moved to Z{:.3}", z))
        }
        CommandRequest::Zoom { action, value } => {
            backend.zoom(action, value).await?;
            Ok(format!("Zoom {:?} complete", action).to_lowercase())
        }
        CommandRequest::Capture => {
            let filename = backend.capture_image().await?;
            Ok(format!("Captured {}", filename))
        }
        CommandRequest::EmergencyStop => {
            backend.emergency_stop().await?;
            Ok("Emergency stop engaged".to_string())
        }
    }
}
