//! Sensor sources - where temperature readings come from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use super::{Channel, ThermalReading};

/// Value the sensor script prints for a channel it cannot read.
const UNAVAILABLE_SENTINEL: f64 = -1.0;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no sensor command configured")]
    NotConfigured,

    #[error("failed to run sensor command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("sensor command timed out after {0:?}")]
    Timeout(Duration),

    #[error("sensor command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("could not parse sensor output: {0}")]
    Parse(String),
}

/// Trait for temperature sources.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read(&self) -> Result<ThermalReading, SensorError>;
}

/// Reads temperatures by running an external process that prints
/// `{"cpu": .., "gpu": .., "gpuHot": ..}` with -1 for unavailable channels.
pub struct CommandSensor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    current_dir: Option<PathBuf>,
}

impl CommandSensor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            current_dir: None,
        }
    }

    /// Run the command from `dir` so relative script paths resolve there.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Build from a command line where the first element is the program.
    pub fn from_command_line(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), timeout))
    }
}

#[async_trait]
impl SensorSource for CommandSensor {
    async fn read(&self) -> Result<ThermalReading, SensorError> {
        if self.program.is_empty() {
            return Err(SensorError::NotConfigured);
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| SensorError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(SensorError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_sensor_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct RawTemps {
    cpu: Option<f64>,
    gpu: Option<f64>,
    #[serde(rename = "gpuHot")]
    gpu_hot: Option<f64>,
}

/// Parse the sensor script's JSON output into a reading.
pub fn parse_sensor_output(stdout: &str) -> Result<ThermalReading, SensorError> {
    let raw: RawTemps =
        serde_json::from_str(stdout.trim()).map_err(|e| SensorError::Parse(e.to_string()))?;

    let clean = |v: Option<f64>| v.filter(|t| *t != UNAVAILABLE_SENTINEL && t.is_finite());

    let mut values = BTreeMap::new();
    values.insert(Channel::CpuPackage, clean(raw.cpu));
    values.insert(Channel::GpuTemp, clean(raw.gpu));
    values.insert(Channel::GpuHotspot, clean(raw.gpu_hot));

    Ok(ThermalReading::new(values))
}
