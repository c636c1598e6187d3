//! Telemetry - hardware temperature readings and throttle classification.

mod governor;
mod sensors;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use governor::{GovernorEvent, TelemetryGovernor};
pub use sensors::{parse_sensor_output, CommandSensor, SensorError, SensorSource};

/// Named temperature sensor channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    CpuPackage,
    GpuTemp,
    GpuHotspot,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::CpuPackage, Channel::GpuTemp, Channel::GpuHotspot];

    pub fn name(&self) -> &'static str {
        match self {
            Self::CpuPackage => "cpu_package",
            Self::GpuTemp => "gpu_temp",
            Self::GpuHotspot => "gpu_hotspot",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::CpuPackage => "CPU",
            Self::GpuTemp => "GPU",
            Self::GpuHotspot => "GPU Hotspot",
        }
    }
}

/// Ascending thresholds for one channel, in degrees Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelThresholds {
    pub ideal_upper: f64,
    pub acceptable_upper: f64,
    pub too_hot: f64,
}

impl ChannelThresholds {
    pub fn new(ideal_upper: f64, acceptable_upper: f64, too_hot: f64) -> Self {
        Self {
            ideal_upper,
            acceptable_upper,
            too_hot,
        }
    }

    pub fn default_for(channel: Channel) -> Self {
        match channel {
            Channel::CpuPackage => Self::new(85.0, 92.0, 93.0),
            Channel::GpuTemp => Self::new(82.0, 86.0, 87.0),
            Channel::GpuHotspot => Self::new(92.0, 96.0, 97.0),
        }
    }

    /// Level implied by a single value on this channel.
    pub fn level_for(&self, value: f64) -> ThrottleLevel {
        if value >= self.too_hot {
            ThrottleLevel::Stop
        } else if value >= self.acceptable_upper {
            ThrottleLevel::Throttle
        } else if value >= self.ideal_upper {
            ThrottleLevel::Acceptable
        } else {
            ThrottleLevel::Ideal
        }
    }
}

/// Discretized severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleLevel {
    #[default]
    Ideal,
    Acceptable,
    Throttle,
    Stop,
}

impl ThrottleLevel {
    /// Whether work should be redirected to the fallback tier
    pub fn must_delegate(&self) -> bool {
        matches!(self, Self::Throttle | Self::Stop)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ideal => "ideal",
            Self::Acceptable => "acceptable",
            Self::Throttle => "throttle",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of a channel's recent temperatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Cooling,
    Stable,
    Unknown,
}

/// One poll's worth of sensor values. `None` marks an unavailable channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalReading {
    pub values: BTreeMap<Channel, Option<f64>>,
    pub timestamp: DateTime<Utc>,
    /// Set when this is a repeat of the last good reading after a failed poll
    #[serde(default)]
    pub stale: bool,
}

impl ThermalReading {
    pub fn new(values: BTreeMap<Channel, Option<f64>>) -> Self {
        Self {
            values,
            timestamp: Utc::now(),
            stale: false,
        }
    }

    /// A reading with every channel unavailable
    pub fn unavailable() -> Self {
        Self::new(Channel::ALL.iter().map(|c| (*c, None)).collect())
    }

    /// Value for a channel, if available
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.values.get(&channel).copied().flatten()
    }

    /// Available channels and their values
    pub fn available(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        self.values
            .iter()
            .filter_map(|(c, v)| v.map(|value| (*c, value)))
    }
}
