// src/hardware/serial.rs - G-code controller over a serial link
use super::camera::CommandCamera;
use super::{HardwareError, MoveTarget, Position, StageBackend, TelemetrySample, ZoomReading};
use crate::command::ZoomAction;
use crate::config::{Config, SerialConfig, ZoomConfig};
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Last commanded state; the controller is not polled for position.
#[derive(Debug, Clone)]
struct LinkState {
    position: Position,
    zoom_position: f64,
    link_ok: bool,
}

/// Real stage backend speaking Marlin-style G-code. Every command waits for
/// the controller's `ok`; motion is followed by `M400` so `ok` means the
/// move has finished.
pub struct SerialBackend {
    serial: SerialConfig,
    zoom: ZoomConfig,
    swap_yz: bool,
    motion_timeout: Duration,
    port: RwLock<Option<Arc<SerialPort>>>,
    /// Serialises request/reply exchanges and holds partially received lines.
    rx: tokio::sync::Mutex<Vec<u8>>,
    state: Mutex<LinkState>,
    stopped: AtomicBool,
    camera: CommandCamera,
}

impl SerialBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            serial: config.serial.clone(),
            zoom: config.zoom.clone(),
            swap_yz: config.stage.swap_yz,
            motion_timeout: config.safety.hardware_timeout(),
            port: RwLock::new(None),
            rx: tokio::sync::Mutex::new(Vec::with_capacity(256)),
            state: Mutex::new(LinkState {
                position: Position::default(),
                zoom_position: config.zoom.min_s_prime,
                link_ok: false,
            }),
            stopped: AtomicBool::new(false),
            camera: CommandCamera::new(&config.camera),
        }
    }

    fn port(&self) -> Result<Arc<SerialPort>, HardwareError> {
        self.port
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(HardwareError::NotConnected)
    }

    fn update(&self, f: impl FnOnce(&mut LinkState)) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state);
    }

    fn snapshot(&self) -> LinkState {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.reply_timeout_ms)
    }

    fn check_stop(&self, operation: &str) -> Result<(), HardwareError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HardwareError::EmergencyStop(operation.to_string()));
        }
        Ok(())
    }

    fn link_error(&self, e: std::io::Error) -> HardwareError {
        tracing::error!("Serial link error: {}", e);
        self.update(|state| state.link_ok = false);
        HardwareError::Io(e)
    }

    /// `G1` line for an absolute gantry target, honouring the Y/Z wiring swap.
    fn format_move(&self, to: Position, feedrate: u32) -> String {
        let (y, z) = if self.swap_yz { (to.z, to.y) } else { (to.y, to.z) };
        format!("G1 X{:.3} Y{:.3} Z{:.3} F{}", to.x, y, z, feedrate)
    }

    fn format_zoom(&self, s_prime: f64) -> String {
        let feedrate = (self.zoom.travel_speed * 60.0).round() as u32;
        format!("G1 {}{:.3} F{}", self.serial.zoom_axis, s_prime - self.zoom.min_s_prime, feedrate)
    }

    /// Send one line and wait for `ok` within `deadline`.
    async fn exchange(&self, line: &str, deadline: Duration) -> Result<(), HardwareError> {
        let port = self.port()?;
        let mut rx = self.rx.lock().await;
        rx.clear();
        tracing::debug!("Controller <- {}", line);
        port.write_all(format!("{}\n", line).as_bytes()).await.map_err(|e| self.link_error(e))?;
        match tokio::time::timeout(deadline, self.await_ok(&port, &mut rx)).await {
            Ok(result) => result,
            Err(_) => Err(HardwareError::Timeout(format!("reply to '{}'", line))),
        }
    }

    async fn await_ok(&self, port: &SerialPort, rx: &mut Vec<u8>) -> Result<(), HardwareError> {
        let mut chunk = [0u8; 256];
        loop {
            while let Some(end) = rx.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = rx.drain(..=end).collect();
                let reply = String::from_utf8_lossy(&raw).trim().to_string();
                if reply.is_empty() {
                    continue;
                }
                tracing::debug!("Controller -> {}", reply);
                let lower = reply.to_ascii_lowercase();
                if lower.starts_with("ok") {
                    return Ok(());
                }
                if lower.starts_with("error") || lower.starts_with("!!") {
                    return Err(HardwareError::Protocol(reply));
                }
                // busy/echo lines: keep waiting
            }
            let n = port.read(&mut chunk).await.map_err(|e| self.link_error(e))?;
            if n == 0 {
                return Err(self.link_error(std::io::ErrorKind::UnexpectedEof.into()));
            }
            rx.extend_from_slice(&chunk[..n]);
        }
    }

    /// Motion line followed by `M400` so the reply marks completion.
    async fn motion(&self, line: &str) -> Result<(), HardwareError> {
        self.exchange(line, self.motion_timeout).await?;
        self.exchange("M400", self.motion_timeout).await
    }
}

#[async_trait]
impl StageBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn initialize(&self) -> Result<(), HardwareError> {
        tracing::info!("Connecting to controller: {} at {} baud", self.serial.device, self.serial.baud);
        let port = SerialPort::open(&self.serial.device, self.serial.baud)?;
        *self.port.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(port));
        // Opening the port resets the controller.
        tokio::time::sleep(Duration::from_millis(self.serial.startup_delay_ms)).await;
        self.update(|state| state.link_ok = true);
        self.exchange("G21", self.reply_timeout()).await?;
        self.exchange("G90", self.reply_timeout()).await?;
        tracing::info!("Controller ready (millimetres, absolute positioning)");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), HardwareError> {
        tracing::info!("Shutting down serial backend");
        if let Ok(port) = self.port() {
            let _ = port.write_all(b"M84\n").await;
        }
        Ok(())
    }

    async fn home(&self) -> Result<(), HardwareError> {
        self.check_stop("homing")?;
        self.exchange("G28", self.motion_timeout).await?;
        self.motion(&self.format_zoom(self.zoom.min_s_prime)).await?;
        let min = self.zoom.min_s_prime;
        self.update(|state| {
            state.position = Position::default();
            state.zoom_position = min;
        });
        tracing::debug!("Homed; zoom rail at s' {:.3}", min);
        Ok(())
    }

    async fn move_to(&self, target: MoveTarget, feedrate: u32) -> Result<(), HardwareError> {
        self.check_stop("move")?;
        let to = target.resolve(self.snapshot().position);
        self.motion(&self.format_move(to, feedrate)).await?;
        self.update(|state| state.position = to);
        Ok(())
    }

    async fn zoom(&self, action: ZoomAction, value: f64) -> Result<(), HardwareError> {
        self.check_stop("zoom")?;
        let current = self.snapshot().zoom_position;
        let target = match action {
            ZoomAction::In => current + value / self.zoom.steps_per_mm,
            ZoomAction::Out => current - value / self.zoom.steps_per_mm,
            ZoomAction::Goto => value,
            ZoomAction::Home => self.zoom.min_s_prime,
        };
        self.motion(&self.format_zoom(target)).await?;
        self.update(|state| state.zoom_position = target);
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), HardwareError> {
        self.stopped.store(true, Ordering::SeqCst);
        // Written outside `exchange`: a pending move may hold the reply lock.
        let port = self.port()?;
        port.write_all(b"M112\n").await.map_err(|e| self.link_error(e))?;
        tracing::warn!("M112 sent to controller");
        Ok(())
    }

    async fn clear_emergency_stop(&self) -> Result<(), HardwareError> {
        self.exchange("M999", self.reply_timeout()).await?;
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_image(&self) -> Result<String, HardwareError> {
        self.camera.capture().await
    }

    async fn preview_frame(&self) -> Result<Vec<u8>, HardwareError> {
        self.camera.frame().await
    }

    async fn read_telemetry(&self) -> Result<TelemetrySample, HardwareError> {
        self.port()?;
        let state = self.snapshot();
        if !state.link_ok {
            return Err(HardwareError::Fault("serial link lost".to_string()));
        }
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
