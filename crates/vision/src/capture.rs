use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No capture command configured")]
    NotConfigured,
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("Capture did not produce {0}")]
    MissingOutput(PathBuf),
}

/// External screenshot program.
///
/// `{output}` in any argument is replaced with `output_path`, e.g.
/// `command = "grim"`, `args = ["-g", "0,85 1920x990", "{output}"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub command: String,
    pub args: Vec<String>,
    pub output_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: vec!["{output}".to_string()],
            output_path: PathBuf::from("chart_capture.png"),
        }
    }
}

pub struct ChartCapturer {
    config: CaptureConfig,
}

impl ChartCapturer {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    pub fn output_path(&self) -> &Path {
        &self.config.output_path
    }

    fn args(&self) -> Vec<String> {
        let output = self.config.output_path.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|a| a.replace("{output}", &output))
            .collect()
    }

    /// Run the capture program once and confirm the screenshot exists.
    pub async fn capture(&self) -> Result<PathBuf, CaptureError> {
        let program = self.config.command.trim();
        if program.is_empty() {
            return Err(CaptureError::NotConfigured);
        }

        // A screenshot left over from a previous cycle must not pass the check below
        if self.config.output_path.exists() {
            let _ = std::fs::remove_file(&self.config.output_path);
        }

        let args = self.args();
        debug!(program, ?args, "Running capture command");
        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|source| CaptureError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(CaptureError::Failed {
                program: program.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let path = self.config.output_path.clone();
        if !path.exists() {
            return Err(CaptureError::MissingOutput(path));
        }

        info!(path = %path.display(), "Chart captured");
        Ok(path)
    }
}
