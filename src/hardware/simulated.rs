//! Simulated stage: moves in 10 Hz increments, honours the stop latch between
//! increments and never touches a controller.

use super::{HardwareError, MoveTarget, Position, StageBackend, TelemetrySample, ZoomReading};
use crate::command::ZoomAction;
use crate::config::{Config, ZoomConfig};
use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Simulated updates per second of travel time.
const UPDATES_PER_SECOND: f64 = 10.0;

/// Start-of-image and end-of-image markers: an empty JPEG.
const PLACEHOLDER_FRAME: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xD9];

#[derive(Debug, Clone)]
struct SimState {
    position: Position,
    zoom_position: f64,
}

#[derive(Debug)]
pub struct SimulatedBackend {
    zoom: ZoomConfig,
    home_feedrate: u32,
    movement_delay: Duration,
    fault_probability: f64,
    state: Mutex<SimState>,
    stopped: AtomicBool,
}

impl SimulatedBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            zoom: config.zoom.clone(),
            home_feedrate: config.stage.feedrate_default,
            movement_delay: Duration::from_millis(config.simulation.movement_delay_ms),
            fault_probability: config.simulation.fault_probability,
            state: Mutex::new(SimState { position: Position::default(), zoom_position: config.zoom.min_s_prime }),
            stopped: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> SimState {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn update(&self, f: impl FnOnce(&mut SimState)) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state);
    }

    fn check_stop(&self, operation: &str) -> Result<(), HardwareError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HardwareError::EmergencyStop(operation.to_string()));
        }
        Ok(())
    }

    fn maybe_fault(&self, operation: &str) -> Result<(), HardwareError> {
        if self.fault_probability > 0.0 && rand::random::<f64>() < self.fault_probability {
            return Err(HardwareError::Fault(format!("simulated {} fault", operation)));
        }
        Ok(())
    }

    fn update_count(seconds: f64) -> usize {
        ((seconds * UPDATES_PER_SECOND) as usize).max(1)
    }

    async fn travel_nozzle(&self, to: Position, feedrate: u32, operation: &str) -> Result<(), HardwareError> {
        let from = self.snapshot().position;
        let distance = ((to.x - from.x).powi(2) + (to.y - from.y).powi(2) + (to.z - from.z).powi(2)).sqrt();
        // feedrate is mm/min
        let seconds = distance / f64::from(feedrate.max(1)) * 60.0;
        let updates = Self::update_count(seconds);
        for i in 1..=updates {
            self.check_stop(operation)?;
            let progress = i as f64 / updates as f64;
            self.update(|state| {
                state.position = Position {
                    x: from.x + (to.x - from.x) * progress,
                    y: from.y + (to.y - from.y) * progress,
                    z: from.z + (to.z - from.z) * progress,
                };
            });
            tokio::time::sleep(self.movement_delay).await;
        }
        Ok(())
    }

    async fn travel_zoom(&self, to: f64, operation: &str) -> Result<(), HardwareError> {
        let from = self.snapshot().zoom_position;
        let updates = Self::update_count((to - from).abs() / self.zoom.travel_speed);
        for i in 1..=updates {
            self.check_stop(operation)?;
            let progress = i as f64 / updates as f64;
            self.update(|state| state.zoom_position = from + (to - from) * progress);
            tokio::time::sleep(self.movement_delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl StageBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn initialize(&self) -> Result<(), HardwareError> {
        tracing::info!("Initializing simulated stage (no controller commands will be sent)");
        Ok(())
    }

    async fn home(&self) -> Result<(), HardwareError> {
        self.check_stop("homing")?;
        self.maybe_fault("homing")?;
        let from = self.snapshot().position;
        if from.x.abs() < 0.01 && from.y.abs() < 0.01 && from.z.abs() < 0.01 {
            tracing::debug!("Nozzle already at origin");
        } else {
            self.travel_nozzle(Position::default(), self.home_feedrate, "homing").await?;
        }
        self.travel_zoom(self.zoom.min_s_prime, "zoom homing").await?;
        tracing::info!("Simulated homing complete");
        Ok(())
    }

    async fn move_to(&self, target: MoveTarget, feedrate: u32) -> Result<(), HardwareError> {
        self.check_stop("move")?;
        self.maybe_fault("move")?;
        let to = target.resolve(self.snapshot().position);
        self.travel_nozzle(to, feedrate, "move").await?;
        tracing::debug!("Simulated move to ({:.2}, {:.2}, {:.2})", to.x, to.y, to.z);
        Ok(())
    }

    async fn zoom(&self, action: ZoomAction, value: f64) -> Result<(), HardwareError> {
        self.check_stop("zoom")?;
        self.maybe_fault("zoom")?;
        let current = self.snapshot().zoom_position;
        let target = match action {
            ZoomAction::In => current + value / self.zoom.steps_per_mm,
            ZoomAction::Out => current - value / self.zoom.steps_per_mm,
            ZoomAction::Goto => value,
            ZoomAction::Home => self.zoom.min_s_prime,
        };
        if target < self.zoom.min_s_prime || target > self.zoom.max_s_prime {
            return Err(HardwareError::Fault(format!("zoom target {:.2} mm beyond rail travel", target)));
        }
        self.travel_zoom(target, "zoom").await
    }

    async fn emergency_stop(&self) -> Result<(), HardwareError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::warn!("Simulated emergency stop latched");
        }
        Ok(())
    }

    async fn clear_emergency_stop(&self) -> Result<(), HardwareError> {
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_image(&self) -> Result<String, HardwareError> {
        self.check_stop("capture")?;
        tokio::time::sleep(self.movement_delay).await;
        let filename = format!("capture_{}.jpg", chrono::Utc::now().timestamp_millis());
        tracing::debug!("Simulated capture: {}", filename);
        Ok(filename)
    }

    async fn preview_frame(&self) -> Result<Vec<u8>, HardwareError> {
        Ok(PLACEHOLDER_FRAME.to_vec())
    }

    async fn read_telemetry(&self) -> Result<TelemetrySample, HardwareError> {
        let state = self.snapshot();
        Ok(TelemetrySample {
            position: state.position,
            zoom: ZoomReading {
                position: state.zoom_position,
                magnification: self.zoom.magnification(state.zoom_position),
                percent: self.zoom.percent(state.zoom_position),
            },
            timestamped_at: chrono::Utc::now(),
        })
    }
}
