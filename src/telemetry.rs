//! Periodic telemetry: reads the backend, feeds the watchdog heartbeat and
//! broadcasts snapshots to subscribers.

use crate::config::Config;
use crate::hardware::{HardwareError, Position, StageBackend, ZoomReading};
use crate::status::SystemStatus;
use crate::supervisor::SupervisorHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const TELEMETRY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub time: DateTime<Utc>,
    pub nozzle: Position,
    pub zoom: ZoomReading,
    pub status: SystemStatus,
}

pub struct TelemetryPublisher {
    backend: Arc<dyn StageBackend>,
    handle: SupervisorHandle,
    interval: Duration,
    read_timeout: Duration,
    tx: broadcast::Sender<TelemetrySnapshot>,
}

impl TelemetryPublisher {
    pub fn new(backend: Arc<dyn StageBackend>, handle: SupervisorHandle, config: &Config) -> Self {
        let (tx, _) = broadcast::channel(TELEMETRY_CHANNEL_CAPACITY);
        Self {
            backend,
            handle,
            interval: config.telemetry.interval(),
            read_timeout: config.safety.telemetry_deadline(),
            tx,
        }
    }

    /// Sender used by transports to subscribe.
    pub fn sender(&self) -> broadcast::Sender<TelemetrySnapshot> {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetrySnapshot> {
        self.tx.subscribe()
    }

    /// Read the backend once and publish the result.
    pub async fn poll_once(&self) -> Result<TelemetrySnapshot, HardwareError> {
        let sample = tokio::time::timeout(self.read_timeout, self.backend.read_telemetry())
            .await
            .map_err(|_| HardwareError::Timeout("telemetry".to_string()))??;
        self.handle.observe_telemetry(&sample);
        let snapshot = TelemetrySnapshot {
            time: sample.timestamped_at,
            nozzle: sample.position,
            zoom: sample.zoom,
            status: self.handle.system_status(),
        };
        let _ = self.tx.send(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn run(self) {
        tracing::info!("Publishing telemetry every {:?}", self.interval);
        let mut shutdown_rx = self.handle.subscribe_shutdown();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!("Telemetry read failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Telemetry publisher stopped");
    }
}
