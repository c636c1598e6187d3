//! Control plane configuration loading and management.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::telemetry::{Channel, ChannelThresholds};

/// Main configuration, loaded from .relay/config.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Config version
    pub version: Option<String>,

    /// Upstream API key shared by the planner and fallback tiers
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Base URL of the text-generation API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Telemetry governor configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Task decomposition configuration
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Fallback tier configuration
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Artifact audit configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Event log location (relative to project root)
    #[serde(default = "default_events_path")]
    pub events_path: PathBuf,
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_events_path() -> PathBuf {
    PathBuf::from(".relay/events.jsonl")
}

/// Telemetry governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Seconds between sensor polls
    pub poll_interval_secs: u64,

    /// Readings kept for trend computation
    pub history_len: usize,

    /// Readings considered by `trend()`
    pub trend_window: usize,

    /// Degrees of change needed to call a trend rising or cooling
    pub trend_band: f64,

    /// Per-channel thresholds (ideal upper, acceptable upper, too hot)
    pub thresholds: HashMap<Channel, ChannelThresholds>,

    /// Concurrency ceilings per throttle level (stop is always 0)
    pub max_concurrent: ConcurrencyLimits,

    /// Sensor command and arguments
    pub sensor_command: Vec<String>,

    /// Sensor process timeout in seconds
    pub sensor_timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            history_len: 60,
            trend_window: 5,
            trend_band: 5.0,
            thresholds: Channel::ALL
                .iter()
                .map(|c| (*c, ChannelThresholds::default_for(*c)))
                .collect(),
            max_concurrent: ConcurrencyLimits::default(),
            sensor_command: vec![
                "powershell".to_string(),
                "-NoProfile".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-File".to_string(),
                "scripts/read-temps.ps1".to_string(),
            ],
            sensor_timeout_secs: 15,
        }
    }
}

/// Concurrency ceilings for the non-stop throttle levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    pub ideal: usize,
    pub acceptable: usize,
    pub throttle: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            ideal: 15,
            acceptable: 8,
            throttle: 3,
        }
    }
}

/// Task decomposition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
    /// Repository the agents work against, embedded in the system instruction
    pub repository: Option<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.3,
            max_output_tokens: 4096,
            timeout_secs: 60,
            repository: None,
        }
    }
}

/// Fallback tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub model: String,
    /// Hard wall-clock limit on one upstream call
    pub timeout_ms: u64,
    pub max_consecutive_errors: u32,
    pub probe_interval_secs: u64,
    pub probe_warmup_secs: u64,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Characters of upstream text kept in the task summary
    pub summary_chars: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            timeout_ms: 30_000,
            max_consecutive_errors: 5,
            probe_interval_secs: 300,
            probe_warmup_secs: 10,
            max_output_tokens: 2048,
            temperature: 0.2,
            summary_chars: 500,
        }
    }
}

/// Artifact audit configuration. The semantic heuristics are tunables;
/// only the score contract (0-100, deterministic, worse with more red flags)
/// is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub quality_gate: u32,
    pub manifest_name: String,
    pub missing_output_penalty: u32,
    pub missing_declared_penalty: u32,
    pub hash_mismatch_penalty: u32,
    pub undeclared_file_penalty: u32,
    pub vague_terms: Vec<String>,
    pub vague_term_weight: u32,
    pub entropy_min_words: usize,
    pub entropy_floor: f64,
    pub entropy_penalty: u32,
    pub specificity_min_bytes: usize,
    pub specificity_penalty: u32,
    pub structured_extensions: Vec<String>,
    pub contradiction_pairs: Vec<(String, String)>,
    pub contradiction_max_words: usize,
    pub contradiction_penalty: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            quality_gate: 80,
            manifest_name: "manifest.json".to_string(),
            missing_output_penalty: 40,
            missing_declared_penalty: 50,
            hash_mismatch_penalty: 50,
            undeclared_file_penalty: 50,
            vague_terms: [
                "vago",
                "ambiguo",
                "nose",
                "talvez",
                "quizas",
                "etc",
                "maybe",
                "possibly",
                "something",
                "placeholder",
                "insert here",
                "todo",
                "implement me",
                "lorem ipsum",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            vague_term_weight: 10,
            entropy_min_words: 30,
            entropy_floor: 0.35,
            entropy_penalty: 20,
            specificity_min_bytes: 60,
            specificity_penalty: 15,
            structured_extensions: ["json", "yaml", "yml", "toml"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            contradiction_pairs: vec![
                ("enabled".to_string(), "disabled".to_string()),
                ("activado".to_string(), "desactivado".to_string()),
            ],
            contradiction_max_words: 20,
            contradiction_penalty: 25,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: None,
            api_key: None,
            api_base: default_api_base(),
            telemetry: TelemetryConfig::default(),
            planner: PlannerConfig::default(),
            fallback: FallbackConfig::default(),
            audit: AuditConfig::default(),
            events_path: default_events_path(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from project root (looks for .relay/config.yaml), then apply
    /// environment overrides and validate.
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(".relay/config.yaml");
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("GEMINI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(model) = lookup("RELAY_FALLBACK_MODEL") {
            self.fallback.model = model;
        }
        if let Some(model) = lookup("RELAY_PLANNER_MODEL") {
            self.planner.model = model;
        }
        if let Some(raw) = lookup("RELAY_POLL_INTERVAL_SECS") {
            self.telemetry.poll_interval_secs = raw
                .parse()
                .with_context(|| format!("Invalid RELAY_POLL_INTERVAL_SECS: {}", raw))?;
        }
        if let Some(raw) = lookup("RELAY_MAX_CONSECUTIVE_ERRORS") {
            self.fallback.max_consecutive_errors = raw
                .parse()
                .with_context(|| format!("Invalid RELAY_MAX_CONSECUTIVE_ERRORS: {}", raw))?;
        }
        if let Some(raw) = lookup("RELAY_QUALITY_GATE") {
            self.audit.quality_gate = raw
                .parse()
                .with_context(|| format!("Invalid RELAY_QUALITY_GATE: {}", raw))?;
        }
        Ok(())
    }

    /// Reject configurations that would break component invariants.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.telemetry.max_concurrent;
        if !(limits.ideal >= limits.acceptable && limits.acceptable >= limits.throttle) {
            anyhow::bail!(
                "max_concurrent must be non-increasing with severity (ideal {} / acceptable {} / throttle {})",
                limits.ideal,
                limits.acceptable,
                limits.throttle
            );
        }
        for (channel, t) in &self.telemetry.thresholds {
            if !(t.ideal_upper <= t.acceptable_upper && t.acceptable_upper <= t.too_hot) {
                anyhow::bail!("thresholds for {} must be ascending", channel.name());
            }
        }
        if self.telemetry.poll_interval_secs == 0 {
            anyhow::bail!("telemetry.poll_interval_secs must be positive");
        }
        if self.fallback.max_consecutive_errors == 0 {
            anyhow::bail!("fallback.max_consecutive_errors must be positive");
        }
        if self.audit.quality_gate > 100 {
            anyhow::bail!("audit.quality_gate must be within 0-100");
        }
        Ok(())
    }

    /// Resolve paths relative to project root
    pub fn resolve_paths(&mut self, project_root: &Path) {
        self.events_path = project_root.join(&self.events_path);
    }
}
