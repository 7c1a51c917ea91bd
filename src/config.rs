//! # Stage, Zoom and Safety Configuration
//!
//! Every section is optional; missing keys fall back to the values of the
//! reference machine (220 x 220 x 250 mm gantry, 50 mm lens on a 55..110 mm
//! zoom rail).
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [stage]
//! x_max = 220.0
//! feedrate_default = 1500
//!
//! [zoom]
//! min_s_prime = 55.0
//! max_s_prime = 110.0
//!
//! [safety]
//! telemetry_deadline_ms = 2000
//! hardware_timeout_ms = 90000
//! ```
//!
//! ## Example: Rust Usage
//!
//! ```rust
//! use stagehand_rs::config::Config;
//! let config: Config = toml::from_str("[stage]\nx_max = 300.0").unwrap();
//! assert_eq!(config.stage.x_max, 300.0);
//! assert_eq!(config.stage.y_max, 220.0);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the stage, zoom, camera and supervisor.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub stage: StageConfig,
    #[serde(default)]
    pub zoom: ZoomConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// Inclusive travel range of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    pub min: f64,
    pub max: f64,
}

impl AxisLimits {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Gantry limits per axis plus the zoom travel, in mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub x: AxisLimits,
    pub y: AxisLimits,
    pub z: AxisLimits,
    pub zoom: AxisLimits,
    /// Zoom steps per mm of `s'` travel, used to resolve relative zoom moves.
    pub zoom_steps_per_mm: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageConfig {
    #[serde(default)]
    pub x_min: f64,
    #[serde(default = "default_x_max")]
    pub x_max: f64,
    #[serde(default)]
    pub y_min: f64,
    #[serde(default = "default_y_max")]
    pub y_max: f64,
    #[serde(default)]
    pub z_min: f64,
    #[serde(default = "default_z_max")]
    pub z_max: f64,
    /// mm/min used when a move does not carry its own feedrate.
    #[serde(default = "default_feedrate")]
    pub feedrate_default: u32,
    #[serde(default = "default_true")]
    pub home_on_startup: bool,
    /// Some controllers have the Y and Z motors wired swapped.
    #[serde(default)]
    pub swap_yz: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            x_min: 0.0,
            x_max: default_x_max(),
            y_min: 0.0,
            y_max: default_y_max(),
            z_min: 0.0,
            z_max: default_z_max(),
            feedrate_default: default_feedrate(),
            home_on_startup: true,
            swap_yz: false,
        }
    }
}

/// Zoom rail geometry. `s'` is the lens-to-sensor distance in mm.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoomConfig {
    #[serde(default = "default_min_s_prime")]
    pub min_s_prime: f64,
    #[serde(default = "default_max_s_prime")]
    pub max_s_prime: f64,
    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: f64,
    #[serde(default = "default_focal_length")]
    pub focal_length: f64,
    /// Rail speed in mm/s.
    #[serde(default = "default_zoom_speed")]
    pub travel_speed: f64,
}

impl Default for ZoomConfig {
    fn default() -> Self {
        Self {
            min_s_prime: default_min_s_prime(),
            max_s_prime: default_max_s_prime(),
            steps_per_mm: default_steps_per_mm(),
            focal_length: default_focal_length(),
            travel_speed: default_zoom_speed(),
        }
    }
}

impl ZoomConfig {
    /// Thin-lens magnification for an image distance: `M = s'/f - 1`.
    pub fn magnification(&self, s_prime: f64) -> f64 {
        s_prime / self.focal_length - 1.0
    }

    /// Position of `s_prime` within the magnification range, 0..=100.
    pub fn percent(&self, s_prime: f64) -> f64 {
        let min = self.magnification(self.min_s_prime);
        let max = self.magnification(self.max_s_prime);
        if max <= min {
            return 0.0;
        }
        ((self.magnification(s_prime) - min) / (max - min) * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    #[serde(default = "default_telemetry_deadline_ms")]
    pub telemetry_deadline_ms: u64,
    #[serde(default = "default_hardware_timeout_ms")]
    pub hardware_timeout_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            telemetry_deadline_ms: default_telemetry_deadline_ms(),
            hardware_timeout_ms: default_hardware_timeout_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
        }
    }
}

impl SafetyConfig {
    pub fn telemetry_deadline(&self) -> Duration {
        Duration::from_millis(self.telemetry_deadline_ms)
    }

    pub fn hardware_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Pending-queue depth cap. `None` leaves the queue unbounded.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            queue_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_interval_ms")]
    pub interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { interval_ms: default_telemetry_interval_ms() }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Opening the port resets most controllers; wait this long before talking.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Per-reply read timeout while waiting for `ok`.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// G-code axis letter driving the zoom rail.
    #[serde(default = "default_zoom_axis")]
    pub zoom_axis: char,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
            startup_delay_ms: default_startup_delay_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            zoom_axis: default_zoom_axis(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CameraConfig {
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    /// Program and arguments used for stills; `{output}` is replaced by the file path.
    #[serde(default = "default_capture_command")]
    pub capture_command: Vec<String>,
    /// Program and arguments that write one JPEG preview frame to stdout.
    #[serde(default = "default_stream_command")]
    pub stream_command: Vec<String>,
    /// Delay between live preview frames.
    #[serde(default = "default_stream_interval_ms")]
    pub stream_interval_ms: u64,
}

impl CameraConfig {
    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream_interval_ms)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            capture_dir: default_capture_dir(),
            capture_command: default_capture_command(),
            stream_command: default_stream_command(),
            stream_interval_ms: default_stream_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Sleep between simulated 10 Hz movement updates.
    #[serde(default = "default_movement_delay_ms")]
    pub movement_delay_ms: u64,
    /// Probability in 0..=1 that a simulated motion call fails.
    #[serde(default)]
    pub fault_probability: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            movement_delay_ms: default_movement_delay_ms(),
            fault_probability: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token authorizing an emergency-stop reset. Reset is refused when unset.
    #[serde(default)]
    pub reset_token: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { bind: default_bind(), reset_token: None }
    }
}

impl Config {
    pub fn limits(&self) -> Limits {
        Limits {
            x: AxisLimits::new(self.stage.x_min, self.stage.x_max),
            y: AxisLimits::new(self.stage.y_min, self.stage.y_max),
            z: AxisLimits::new(self.stage.z_min, self.stage.z_max),
            zoom: AxisLimits::new(self.zoom.min_s_prime, self.zoom.max_s_prime),
            zoom_steps_per_mm: self.zoom.steps_per_mm,
        }
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = self.limits();
        for (axis, range) in [("x", limits.x), ("y", limits.y), ("z", limits.z), ("zoom", limits.zoom)] {
            if !(range.min.is_finite() && range.max.is_finite()) || range.min > range.max {
                return Err(ConfigError::Invalid(format!(
                    "{} limits must be finite with min <= max (got {}..{})",
                    axis, range.min, range.max
                )));
            }
        }
        if self.stage.feedrate_default == 0 {
            return Err(ConfigError::Invalid("stage.feedrate_default must be > 0".to_string()));
        }
        if self.zoom.steps_per_mm <= 0.0 {
            return Err(ConfigError::Invalid("zoom.steps_per_mm must be > 0".to_string()));
        }
        if self.zoom.focal_length <= 0.0 {
            return Err(ConfigError::Invalid("zoom.focal_length must be > 0".to_string()));
        }
        if self.zoom.travel_speed <= 0.0 {
            return Err(ConfigError::Invalid("zoom.travel_speed must be > 0".to_string()));
        }
        if self.safety.telemetry_deadline_ms == 0
            || self.safety.hardware_timeout_ms == 0
            || self.safety.watchdog_interval_ms == 0
        {
            return Err(ConfigError::Invalid("safety timings must be > 0".to_string()));
        }
        if self.safety.watchdog_interval_ms > self.safety.telemetry_deadline_ms {
            return Err(ConfigError::Invalid(
                "safety.watchdog_interval_ms must not exceed safety.telemetry_deadline_ms".to_string(),
            ));
        }
        if self.telemetry.interval_ms == 0 || self.telemetry.interval_ms >= self.safety.telemetry_deadline_ms {
            return Err(ConfigError::Invalid(
                "telemetry.interval_ms must be > 0 and below safety.telemetry_deadline_ms".to_string(),
            ));
        }
        if self.supervisor.history_capacity == 0 {
            return Err(ConfigError::Invalid("supervisor.history_capacity must be > 0".to_string()));
        }
        if self.supervisor.queue_capacity == Some(0) {
            return Err(ConfigError::Invalid("supervisor.queue_capacity must be > 0 when set".to_string()));
        }
        if self.camera.stream_interval_ms == 0 {
            return Err(ConfigError::Invalid("camera.stream_interval_ms must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.simulation.fault_probability) {
            return Err(ConfigError::Invalid("simulation.fault_probability must be within 0..=1".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_x_max() -> f64 { 220.0 }
fn default_y_max() -> f64 { 220.0 }
fn default_z_max() -> f64 { 250.0 }
fn default_feedrate() -> u32 { 1500 }
fn default_true() -> bool { true }
fn default_min_s_prime() -> f64 { 55.0 }
fn default_max_s_prime() -> f64 { 110.0 }
fn default_steps_per_mm() -> f64 { 80.0 }
fn default_focal_length() -> f64 { 50.0 }
fn default_zoom_speed() -> f64 { 2.0 }
fn default_telemetry_deadline_ms() -> u64 { 2000 }
fn default_hardware_timeout_ms() -> u64 { 90_000 }
fn default_watchdog_interval_ms() -> u64 { 250 }
fn default_history_capacity() -> usize { 1000 }
fn default_telemetry_interval_ms() -> u64 { 500 }
fn default_device() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud() -> u32 { 115200 }
fn default_startup_delay_ms() -> u64 { 2000 }
fn default_reply_timeout_ms() -> u64 { 5000 }
fn default_zoom_axis() -> char { 'A' }
fn default_capture_dir() -> PathBuf { PathBuf::from("captures") }
fn default_capture_command() -> Vec<String> {
    ["rpicam-still", "--nopreview", "-o", "{output}"].iter().map(|s| s.to_string()).collect()
}
fn default_stream_command() -> Vec<String> {
    ["rpicam-still", "--nopreview", "-t", "1", "-e", "jpg", "-o", "-"].iter().map(|s| s.to_string()).collect()
}
fn default_stream_interval_ms() -> u64 { 100 }
fn default_movement_delay_ms() -> u64 { 100 }
fn default_bind() -> String { "0.0.0.0:5000".to_string() }

/// Load and validate a configuration file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
