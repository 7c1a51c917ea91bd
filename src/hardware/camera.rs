//! Stills and live preview frames through external camera programs
//! (e.g. `rpicam-still`).

use super::HardwareError;
use crate::config::CameraConfig;
use std::path::PathBuf;

/// Placeholder in the configured argument list replaced by the output path.
const OUTPUT_PLACEHOLDER: &str = "{output}";

#[derive(Debug, Clone)]
pub struct CommandCamera {
    capture_dir: PathBuf,
    command: Vec<String>,
    stream_command: Vec<String>,
}

fn split_command<'a>(command: &'a [String], key: &str) -> Result<(&'a String, &'a [String]), HardwareError> {
    command.split_first().ok_or_else(|| HardwareError::Camera(format!("camera.{} is empty", key)))
}

impl CommandCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            capture_dir: config.capture_dir.clone(),
            command: config.capture_command.clone(),
            stream_command: config.stream_command.clone(),
        }
    }

    /// Arguments for one capture, with the output placeholder substituted.
    fn arguments(&self, output: &str) -> Result<(String, Vec<String>), HardwareError> {
        let (program, args) = split_command(&self.command, "capture_command")?;
        let args = args.iter().map(|arg| arg.replace(OUTPUT_PLACEHOLDER, output)).collect();
        Ok((program.clone(), args))
    }

    /// One JPEG preview frame, read from the stream command's stdout.
    pub async fn frame(&self) -> Result<Vec<u8>, HardwareError> {
        let (program, args) = split_command(&self.stream_command, "stream_command")?;
        let result = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HardwareError::Camera(format!("failed to run '{}': {}", program, e)))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(HardwareError::Camera(format!("'{}' exited with {}: {}", program, result.status, stderr.trim())));
        }
        if result.stdout.is_empty() {
            return Err(HardwareError::Camera("empty preview frame".to_string()));
        }
        Ok(result.stdout)
    }

    /// Capture a still into `capture_dir`, returning the file name.
    pub async fn capture(&self) -> Result<String, HardwareError> {
        tokio::fs::create_dir_all(&self.capture_dir).await?;
        let filename = format!("capture_{}.jpg", chrono::Utc::now().timestamp_millis());
        let output = self.capture_dir.join(&filename);
        let (program, args) = self.arguments(&output.to_string_lossy())?;
        tracing::debug!("Running capture: {} {:?}", program, args);
        let result = tokio::process::Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HardwareError::Camera(format!("failed to run '{}': {}", program, e)))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(HardwareError::Camera(format!("'{}' exited with {}: {}", program, result.status, stderr.trim())));
        }
        tracing::info!("Captured still {}", output.display());
        Ok(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_placeholder_substituted() {
        let camera = CommandCamera::new(&CameraConfig::default());
        let (program, args) = camera.arguments("captures/a.jpg").unwrap();
        assert_eq!(program, "rpicam-still");
        assert_eq!(args.last().map(String::as_str), Some("captures/a.jpg"));
    }

    #[test]
    fn test_empty_command_is_an_error() {
        let camera = CommandCamera {
            capture_dir: PathBuf::from("captures"),
            command: Vec::new(),
            stream_command: Vec::new(),
        };
        assert!(matches!(camera.arguments("x.jpg"), Err(HardwareError::Camera(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let camera = CommandCamera {
            capture_dir: dir.path().to_path_buf(),
            command: vec!["touch".to_string(), "{output}".to_string()],
            stream_command: Vec::new(),
        };
        let filename = camera.capture().await.unwrap();
        assert!(dir.path().join(&filename).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frame_reads_stdout() {
        let mut config = CameraConfig::default();
        config.stream_command = vec!["printf".to_string(), "jpeg-bytes".to_string()];
        let camera = CommandCamera::new(&config);
        assert_eq!(camera.frame().await.unwrap(), b"jpeg-bytes".to_vec());

        config.stream_command = vec!["true".to_string()];
        let camera = CommandCamera::new(&config);
        assert!(matches!(camera.frame().await, Err(HardwareError::Camera(_))));
    }
}
