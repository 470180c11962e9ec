//! Invocation of the Ookla `speedtest` CLI.

use std::{process::Stdio, time::Duration};

use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{
    error::RunnerError,
    measurement::{classify, Measurement},
};
use crate::config::speedtest::SpeedtestConfig;

/// Source of measurements for the scheduler.
#[async_trait::async_trait]
pub trait MeasurementSource: Send + Sync {
    /// Runs one measurement. Never fails: problems become
    /// `Measurement::Failure`.
    async fn measure(&self) -> Measurement;
}

/// Runs the external tool and classifies its output.
#[derive(Debug, Clone)]
pub struct SpeedtestRunner {
    binary_path: String,
    server_id: Option<String>,
    timeout: Duration,
}

impl SpeedtestRunner {
    pub fn new(binary_path: impl Into<String>, server_id: Option<String>, timeout: Duration) -> Self {
        Self {
            binary_path: binary_path.into(),
            server_id: server_id.filter(|id| !id.trim().is_empty()),
            timeout,
        }
    }

    pub fn from_config(config: &SpeedtestConfig) -> Self {
        Self::new(
            config.binary_path.clone(),
            config.server_id().map(str::to_owned),
            config.timeout(),
        )
    }

    /// Fixed flags, plus `--server-id` only when a server is configured.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--format=json".to_string(),
            "--precision=4".to_string(),
            "--accept-license".to_string(),
            "--accept-gdpr".to_string(),
        ];
        if let Some(id) = &self.server_id {
            args.push(format!("--server-id={}", id.trim()));
        }
        args
    }

    /// Runs the tool to completion and returns its stdout and stderr.
    ///
    /// The child is killed when the timeout expires or the future is
    /// dropped.
    async fn execute(&self) -> Result<(String, String), RunnerError> {
        let child = Command::new(&self.binary_path)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                path: self.binary_path.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RunnerError::Timeout(self.timeout))??;

        debug!("Speedtest exited with {}", output.status);
        let stdout = String::from_utf8(output.stdout)?;
        let stderr = String::from_utf8(output.stderr)?;
        debug!("Stdout: {}", stdout);
        debug!("Stderr: {}", stderr);

        Ok((stdout, stderr))
    }
}

#[async_trait::async_trait]
impl MeasurementSource for SpeedtestRunner {
    #[instrument(skip(self), fields(binary = %self.binary_path))]
    async fn measure(&self) -> Measurement {
        info!("Running speedtest");
        match self.execute().await {
            Ok((stdout, stderr)) => classify(&stdout, &stderr),
            Err(e) => Measurement::Failure(e.into()),
        }
    }
}
