//! Observability - append-only control-plane event log.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::{AuditResponse, ExecutorEvent};
use crate::telemetry::GovernorEvent;

/// A control-plane event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    /// Component that raised the event
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ControlEvent {
    pub fn new(event_type: &str, source: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

impl From<&GovernorEvent> for ControlEvent {
    fn from(event: &GovernorEvent) -> Self {
        let message = match event {
            GovernorEvent::LevelChanged {
                from,
                to,
                max_concurrent,
                ..
            } => format!("Throttle {} -> {} (max concurrent {})", from, to, max_concurrent),
            GovernorEvent::Critical { .. } => "Critical temperature, new work stopped".to_string(),
            GovernorEvent::Warning { .. } => "High temperature, load reduced".to_string(),
            GovernorEvent::Recovered { from, to, .. } => {
                format!("Temperature recovered ({} -> {})", from, to)
            }
        };
        ControlEvent::new(event.event_type(), "telemetry", message)
            .with_metadata(serde_json::to_value(event).unwrap_or_default())
    }
}

impl From<&ExecutorEvent> for ControlEvent {
    fn from(event: &ExecutorEvent) -> Self {
        let message = match event {
            ExecutorEvent::TaskCompleted { title, .. } => format!("Completed: {}", title),
            ExecutorEvent::CreditsExhausted {
                consecutive_errors, ..
            } => format!("Credits exhausted after {} errors", consecutive_errors),
            ExecutorEvent::CreditsLow { error } => format!("Credits low: {}", error),
            ExecutorEvent::CreditsRestored => "Credits restored".to_string(),
            ExecutorEvent::DailyReset { date } => format!("Daily reset for {}", date),
        };
        ControlEvent::new(event.event_type(), "fallback", message)
            .with_metadata(serde_json::to_value(event).unwrap_or_default())
    }
}

impl From<&AuditResponse> for ControlEvent {
    fn from(response: &AuditResponse) -> Self {
        let event_type = if response.passed() {
            "audit_passed"
        } else {
            "audit_failed"
        };
        ControlEvent::new(
            event_type,
            "auditor",
            format!(
                "Score {} (tamper: {})",
                response.score, response.tamper_detected
            ),
        )
        .with_metadata(serde_json::to_value(response).unwrap_or_default())
    }
}

/// Appends events as JSON lines.
pub struct EventEmitter {
    events_path: PathBuf,
}

impl EventEmitter {
    pub fn new(events_path: impl Into<PathBuf>) -> Self {
        Self {
            events_path: events_path.into(),
        }
    }

    /// Emitter writing to the default location under `project_root`.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(".relay/events.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.events_path
    }

    /// Emit an event.
    pub fn emit(&self, event: ControlEvent) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;

        let line = serde_json::to_string(&event)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }

    /// Emit a simple event.
    pub fn emit_simple(&self, event_type: &str, source: &str, message: &str) -> Result<()> {
        self.emit(ControlEvent::new(event_type, source, message))
    }

    /// Read recent events. Unparseable lines are skipped.
    pub fn read_recent(&self, limit: usize) -> Vec<ControlEvent> {
        let file = match std::fs::File::open(&self.events_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let mut events: Vec<ControlEvent> = reader
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{ThermalReading, ThrottleLevel};
    use tempfile::TempDir;

    #[test]
    fn emits_and_reads_back_tail() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::for_project(dir.path());
        for i in 0..5 {
            emitter
                .emit_simple("test", "cli", &format!("event {}", i))
                .unwrap();
        }

        let recent = emitter.read_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "event 3");
        assert_eq!(recent[1].message, "event 4");
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::new(dir.path().join("none.jsonl"));
        assert!(emitter.read_recent(10).is_empty());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let emitter = EventEmitter::new(dir.path().join("events.jsonl"));
        emitter.emit_simple("a", "cli", "first").unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(emitter.path())
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();
        emitter.emit_simple("b", "cli", "second").unwrap();

        let events = emitter.read_recent(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "b");
    }

    #[test]
    fn governor_event_carries_type_and_metadata() {
        let event = GovernorEvent::Critical {
            reading: ThermalReading::unavailable(),
        };
        let control = ControlEvent::from(&event);
        assert_eq!(control.event_type, "thermal_critical");
        assert_eq!(control.source, "telemetry");
        assert_eq!(control.metadata["type"], "critical");

        let changed = GovernorEvent::LevelChanged {
            from: ThrottleLevel::Ideal,
            to: ThrottleLevel::Throttle,
            max_concurrent: 3,
            reading: ThermalReading::unavailable(),
        };
        assert!(ControlEvent::from(&changed).message.contains("max concurrent 3"));
    }
}
