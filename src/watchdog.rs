//! Telemetry watchdog: forces an emergency stop when telemetry goes silent.

use crate::config::SafetyConfig;
use crate::supervisor::SupervisorHandle;
use std::time::Duration;

pub struct Watchdog {
    handle: SupervisorHandle,
    deadline: Duration,
    interval: Duration,
}

impl Watchdog {
    pub fn new(handle: SupervisorHandle, safety: &SafetyConfig) -> Self {
        Self { handle, deadline: safety.telemetry_deadline(), interval: safety.watchdog_interval() }
    }

    /// One check. Returns true when this check tripped the stop.
    pub fn check(&self) -> bool {
        let readiness = self.handle.readiness();
        if readiness.emergency_stop_active {
            return false;
        }
        let silent_for = readiness.last_telemetry_at.elapsed();
        if silent_for <= self.deadline {
            return false;
        }
        self.handle.trip_watchdog(silent_for)
    }

    pub async fn run(self) {
        tracing::info!("Watchdog armed: deadline {:?}, checked every {:?}", self.deadline, self.interval);
        let mut shutdown_rx = self.handle.subscribe_shutdown();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    self.check();
                }
            }
        }
        tracing::debug!("Watchdog stopped");
    }
}
