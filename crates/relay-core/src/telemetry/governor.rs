//! Governor - turns sensor readings into a concurrency ceiling.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::sensors::SensorSource;
use super::{Channel, ChannelThresholds, ThermalReading, ThrottleLevel, Trend};
use crate::config::TelemetryConfig;

const EVENT_CAPACITY: usize = 64;

/// Notifications published on level transitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GovernorEvent {
    LevelChanged {
        from: ThrottleLevel,
        to: ThrottleLevel,
        max_concurrent: usize,
        reading: ThermalReading,
    },
    /// Entered stop: no new work should start
    Critical { reading: ThermalReading },
    /// Entered throttle from any other level
    Warning { reading: ThermalReading },
    /// Dropped from throttle or stop to a level that runs locally
    Recovered {
        from: ThrottleLevel,
        to: ThrottleLevel,
        reading: ThermalReading,
    },
}

impl GovernorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LevelChanged { .. } => "thermal_level_changed",
            Self::Critical { .. } => "thermal_critical",
            Self::Warning { .. } => "thermal_warning",
            Self::Recovered { .. } => "thermal_recovered",
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    reading: ThermalReading,
    level: ThrottleLevel,
}

#[derive(Debug, Default)]
struct GovernorState {
    last_reading: Option<ThermalReading>,
    level: ThrottleLevel,
    history: VecDeque<HistoryEntry>,
}

/// Polls a sensor source and derives the throttle level.
pub struct TelemetryGovernor {
    config: TelemetryConfig,
    source: Box<dyn SensorSource>,
    state: Mutex<GovernorState>,
    events: broadcast::Sender<GovernorEvent>,
}

impl TelemetryGovernor {
    pub fn new(config: TelemetryConfig, source: Box<dyn SensorSource>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            source,
            state: Mutex::new(GovernorState::default()),
            events,
        }
    }

    /// Subscribe to level-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<GovernorEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn thresholds(&self, channel: Channel) -> ChannelThresholds {
        self.config
            .thresholds
            .get(&channel)
            .copied()
            .unwrap_or_else(|| ChannelThresholds::default_for(channel))
    }

    /// Read the sensors once. A failed read never errors: the last good
    /// reading comes back flagged stale and the level is left alone.
    pub async fn poll(&self) -> ThermalReading {
        let result = self.source.read().await;

        let reading = match result {
            Ok(reading) => reading,
            Err(err) => {
                tracing::warn!(error = %err, "Sensor read failed, keeping last reading");
                let state = self.state();
                let mut stale = state
                    .last_reading
                    .clone()
                    .unwrap_or_else(ThermalReading::unavailable);
                stale.stale = true;
                return stale;
            }
        };

        let level = self.classify(&reading);
        let events = {
            let mut state = self.state();
            let previous = state.level;
            state.level = level;
            state.last_reading = Some(reading.clone());
            state.history.push_back(HistoryEntry {
                reading: reading.clone(),
                level,
            });
            while state.history.len() > self.config.history_len.max(1) {
                state.history.pop_front();
            }
            self.transition_events(previous, level, &reading)
        };

        tracing::debug!(
            level = %level,
            cpu = ?reading.get(Channel::CpuPackage),
            gpu = ?reading.get(Channel::GpuTemp),
            gpu_hotspot = ?reading.get(Channel::GpuHotspot),
            "Thermal poll"
        );

        for event in events {
            match &event {
                GovernorEvent::Critical { .. } => {
                    tracing::error!(level = %level, "Critical temperature, stopping new work")
                }
                GovernorEvent::Warning { .. } => {
                    tracing::warn!(level = %level, "High temperature, reducing load")
                }
                GovernorEvent::Recovered { from, .. } => {
                    tracing::info!(from = %from, to = %level, "Temperature recovered")
                }
                GovernorEvent::LevelChanged { from, .. } => {
                    tracing::info!(from = %from, to = %level, "Throttle level changed")
                }
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }

        reading
    }

    fn transition_events(
        &self,
        previous: ThrottleLevel,
        current: ThrottleLevel,
        reading: &ThermalReading,
    ) -> Vec<GovernorEvent> {
        if previous == current {
            return Vec::new();
        }

        let mut events = vec![GovernorEvent::LevelChanged {
            from: previous,
            to: current,
            max_concurrent: self.max_concurrent(current),
            reading: reading.clone(),
        }];

        if current == ThrottleLevel::Stop {
            events.push(GovernorEvent::Critical {
                reading: reading.clone(),
            });
        } else if current == ThrottleLevel::Throttle {
            events.push(GovernorEvent::Warning {
                reading: reading.clone(),
            });
        }

        if previous.must_delegate() && current < ThrottleLevel::Throttle {
            events.push(GovernorEvent::Recovered {
                from: previous,
                to: current,
                reading: reading.clone(),
            });
        }

        events
    }

    /// Worst-case level across available channels; ideal when none are.
    pub fn classify(&self, reading: &ThermalReading) -> ThrottleLevel {
        reading
            .available()
            .map(|(channel, value)| self.thresholds(channel).level_for(value))
            .max()
            .unwrap_or(ThrottleLevel::Ideal)
    }

    /// Concurrency ceiling for a level. Never increases with severity.
    pub fn max_concurrent(&self, level: ThrottleLevel) -> usize {
        let limits = &self.config.max_concurrent;
        match level {
            ThrottleLevel::Ideal => limits.ideal,
            ThrottleLevel::Acceptable => limits.acceptable.min(limits.ideal),
            ThrottleLevel::Throttle => limits.throttle.min(limits.acceptable).min(limits.ideal),
            ThrottleLevel::Stop => 0,
        }
    }

    /// Current throttle level
    pub fn level(&self) -> ThrottleLevel {
        self.state().level
    }

    /// Ceiling for the current level
    pub fn current_max_concurrent(&self) -> usize {
        self.max_concurrent(self.level())
    }

    /// Whether work should go to the fallback tier
    pub fn should_delegate(&self) -> bool {
        self.level().must_delegate()
    }

    /// Last successful reading
    pub fn last_reading(&self) -> Option<ThermalReading> {
        self.state().last_reading.clone()
    }

    /// Number of readings held for trend computation
    pub fn history_len(&self) -> usize {
        self.state().history.len()
    }

    /// Direction of a channel over its most recent available readings.
    pub fn trend(&self, channel: Channel) -> Trend {
        let state = self.state();
        if state.history.len() < 2 {
            return Trend::Stable;
        }

        let values: Vec<f64> = state
            .history
            .iter()
            .rev()
            .filter_map(|h| h.reading.get(channel))
            .take(self.config.trend_window.max(2))
            .collect();
        if values.len() < 2 {
            return Trend::Unknown;
        }

        // values are newest first
        let delta = values[0] - values[values.len() - 1];
        if delta > self.config.trend_band {
            Trend::Rising
        } else if delta < -self.config.trend_band {
            Trend::Cooling
        } else {
            Trend::Stable
        }
    }

    /// Human-readable status summary.
    pub fn status_message(&self) -> String {
        let (level, reading) = {
            let state = self.state();
            (state.level, state.last_reading.clone())
        };

        let Some(reading) = reading else {
            return "Waiting for first temperature reading...".to_string();
        };

        let mut lines = vec![format!("Throttle level: {}", level), String::new()];
        for channel in Channel::ALL {
            let value = match reading.get(channel) {
                Some(v) => {
                    let marker = self.thresholds(channel).level_for(v);
                    format!("{:.1}°C [{}]", v, marker)
                }
                None => "N/A".to_string(),
            };
            lines.push(format!("{}: {}", channel.label(), value));
        }
        lines.push(String::new());
        lines.push(format!("Max concurrent: {}", self.max_concurrent(level)));
        lines.push(format!(
            "Fallback delegation: {}",
            if level.must_delegate() { "active" } else { "not needed" }
        ));
        lines.push(format!("CPU trend: {:?}", self.trend(Channel::CpuPackage)).to_lowercase());
        lines.join("\n")
    }

    /// Poll on a fixed interval until the task is aborted. A poll always
    /// finishes before the next one starts.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        tracing::info!(interval_secs = period.as_secs(), "Starting thermal polling");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.poll().await;
            }
        })
    }
}
