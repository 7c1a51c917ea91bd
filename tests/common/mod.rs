//! Recording stage backend and helpers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use stagehand_rs::command::{AckStatus, CommandAck, CommandId, ZoomAction};
use stagehand_rs::config::Config;
use stagehand_rs::hardware::{HardwareError, MoveTarget, Position, StageBackend, TelemetrySample, ZoomReading};
use stagehand_rs::supervisor::{Supervisor, SupervisorHandle};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Preview frame served by `RecordingBackend`.
pub const FRAME: &[u8] = b"\xFF\xD8test-frame\xFF\xD9";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Home,
    MoveTo(MoveTarget, u32),
    Zoom(ZoomAction, f64),
    EmergencyStop,
    ClearEmergencyStop,
    Capture,
}

/// Records every mutating call and can be told to fail, hang or panic.
#[derive(Default)]
pub struct RecordingBackend {
    pub calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub move_delay_ms: AtomicUsize,
    /// Motion keeps going after an emergency stop.
    pub ignore_stop: AtomicBool,
    pub fail_moves: AtomicBool,
    /// Motion reports that the controller latched a stop on its own.
    pub halt_moves: AtomicBool,
    pub hang_moves: AtomicBool,
    pub panic_on_capture: AtomicBool,
    pub telemetry_down: AtomicBool,
    stopped: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| call(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn busy<T>(&self, work: impl std::future::Future<Output = Result<T, HardwareError>>) -> Result<T, HardwareError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = work.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn travel(&self) -> Result<(), HardwareError> {
        if self.hang_moves.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.move_delay_ms.load(Ordering::SeqCst) as u64;
        for _ in 0..delay / 10 {
            if self.stopped.load(Ordering::SeqCst) && !self.ignore_stop.load(Ordering::SeqCst) {
                return Err(HardwareError::EmergencyStop("move".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if self.halt_moves.load(Ordering::SeqCst) {
            return Err(HardwareError::EmergencyStop("move (controller halted)".to_string()));
        }
        if self.fail_moves.load(Ordering::SeqCst) {
            return Err(HardwareError::Fault("stall detected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StageBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn home(&self) -> Result<(), HardwareError> {
        self.record(Call::Home);
        self.busy(self.travel()).await
    }

    async fn move_to(&self, target: MoveTarget, feedrate: u32) -> Result<(), HardwareError> {
        self.record(Call::MoveTo(target, feedrate));
        self.busy(self.travel()).await
    }

    async fn zoom(&self, action: ZoomAction, value: f64) -> Result<(), HardwareError> {
        self.record(Call::Zoom(action, value));
        self.busy(self.travel()).await
    }

    async fn emergency_stop(&self) -> Result<(), HardwareError> {
        self.record(Call::EmergencyStop);
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_emergency_stop(&self) -> Result<(), HardwareError> {
        self.record(Call::ClearEmergencyStop);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_image(&self) -> Result<String, HardwareError> {
        self.record(Call::Capture);
        if self.panic_on_capture.load(Ordering::SeqCst) {
            panic!("camera driver crashed");
        }
        Ok("capture_0.jpg".to_string())
    }

    async fn preview_frame(&self) -> Result<Vec<u8>, HardwareError> {
        Ok(FRAME.to_vec())
    }

    async fn read_telemetry(&self) -> Result<TelemetrySample, HardwareError> {
        if self.telemetry_down.load(Ordering::SeqCst) {
            return Err(HardwareError::NotConnected);
        }
        Ok(TelemetrySample {
            position: Position::default(),
            zoom: ZoomReading { position: 55.0, magnification: 0.1, percent: 0.0 },
            timestamped_at: chrono::Utc::now(),
        })
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.safety.hardware_timeout_ms = 2_000;
    config
}

/// Build a supervisor over `backend` and run it in the background.
pub fn start(backend: Arc<RecordingBackend>, config: &Config) -> SupervisorHandle {
    let (supervisor, handle) = Supervisor::new(backend, config);
    tokio::spawn(supervisor.run());
    handle
}

/// Poll the ledger until `id` has its terminal ack.
pub async fn wait_terminal(handle: &SupervisorHandle, id: CommandId) -> CommandAck {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(ack) = handle.get_status(&id).await {
            if ack.status != AckStatus::Pending {
                return ack;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no terminal ack for {}", id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `check` holds or fail after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
