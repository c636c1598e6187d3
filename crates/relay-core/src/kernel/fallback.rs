//! Fallback executor - a metered remote tier guarded by a credit breaker.
//!
//! Consecutive upstream failures open the breaker; a successful probe or a
//! calendar-day rollover closes it again.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::adapters::{truncate, GeminiClient, GenerationRequest, TextGenerator, TransportError};
use crate::config::{FallbackConfig, RelayConfig};
use crate::state::Task;

const EVENT_CAPACITY: usize = 64;

/// Source of the local calendar date used for the daily reset.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Work handed to the fallback tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FallbackTask {
    pub title: String,
    pub description: Option<String>,
    pub context: Option<String>,
}

impl FallbackTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<&Task> for FallbackTask {
    fn from(task: &Task) -> Self {
        let mut fallback = FallbackTask::new(&task.title).with_description(&task.prompt);
        if let Some(output) = &task.output_file {
            fallback = fallback.with_context(format!("Write the result to {}", output));
        }
        fallback
    }
}

/// Outcome of a successful fallback execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub summary: String,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("fallback tier is disabled (no credentials)")]
    Disabled,

    #[error("fallback tier has no credits")]
    NoCredits,

    #[error("fallback upstream failed: {0}")]
    Upstream(#[from] TransportError),
}

/// Counters for the current calendar day.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub tasks_executed: u64,
    pub tokens_used: u64,
    pub errors_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
}

/// Breaker state plus lifetime counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditState {
    pub available: bool,
    pub consecutive_errors: u32,
    pub daily_date: NaiveDate,
    pub lifetime_tasks: u64,
    pub lifetime_tokens: u64,
    pub lifetime_errors: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_probe_error: Option<String>,
}

impl CreditState {
    fn new(today: NaiveDate) -> Self {
        Self {
            available: true,
            consecutive_errors: 0,
            daily_date: today,
            lifetime_tasks: 0,
            lifetime_tokens: 0,
            lifetime_errors: 0,
            last_check: None,
            last_probe_error: None,
        }
    }
}

/// Snapshot returned by [`FallbackExecutor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStatus {
    pub enabled: bool,
    pub has_credits: bool,
    pub model: String,
    pub stats: UsageStats,
    pub credits: CreditState,
}

/// Notifications published by the executor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorEvent {
    TaskCompleted {
        title: String,
        tokens_used: u64,
        latency_ms: u64,
    },
    /// Breaker opened after too many consecutive failures
    CreditsExhausted { consecutive_errors: u32, error: String },
    /// Probe saw a quota signal
    CreditsLow { error: String },
    /// Probe succeeded while the breaker was open
    CreditsRestored,
    DailyReset { date: NaiveDate },
}

impl ExecutorEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskCompleted { .. } => "fallback_task_completed",
            Self::CreditsExhausted { .. } => "fallback_credits_exhausted",
            Self::CreditsLow { .. } => "fallback_credits_low",
            Self::CreditsRestored => "fallback_credits_restored",
            Self::DailyReset { .. } => "fallback_daily_reset",
        }
    }
}

struct ExecutorState {
    stats: UsageStats,
    credits: CreditState,
}

/// Executes tasks on the fallback tier.
pub struct FallbackExecutor {
    config: FallbackConfig,
    generator: Option<Arc<dyn TextGenerator>>,
    clock: Arc<dyn Clock>,
    state: Mutex<ExecutorState>,
    events: broadcast::Sender<ExecutorEvent>,
}

impl FallbackExecutor {
    /// A `None` generator yields a disabled executor.
    pub fn new(config: FallbackConfig, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self::with_clock(config, generator, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: FallbackConfig,
        generator: Option<Arc<dyn TextGenerator>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let today = clock.today();
        Self {
            config,
            generator,
            clock,
            state: Mutex::new(ExecutorState {
                stats: UsageStats::default(),
                credits: CreditState::new(today),
            }),
            events,
        }
    }

    /// Build against the configured upstream. Disabled when no API key is set.
    pub fn from_config(config: &RelayConfig) -> Self {
        let generator = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|key| {
                Arc::new(GeminiClient::new(
                    &config.api_base,
                    &config.fallback.model,
                    key,
                    Duration::from_millis(config.fallback.timeout_ms),
                )) as Arc<dyn TextGenerator>
            });
        if generator.is_none() {
            tracing::warn!("No API key configured, fallback tier disabled");
        }
        Self::new(config.fallback.clone(), generator)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ExecutorEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_enabled(&self) -> bool {
        self.generator.is_some()
    }

    /// Whether the tier may be used right now.
    pub fn has_credits(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let state = self.state();
        state.credits.available
            && state.credits.consecutive_errors < self.config.max_consecutive_errors
    }

    /// Reset daily counters and the breaker when the local date has moved.
    /// Returns whether a reset happened.
    pub fn check_daily_reset(&self) -> bool {
        let today = self.clock.today();
        {
            let mut state = self.state();
            if state.credits.daily_date == today {
                return false;
            }
            state.stats = UsageStats::default();
            state.credits.daily_date = today;
            state.credits.available = true;
            state.credits.consecutive_errors = 0;
        }
        tracing::info!(date = %today, "New day, fallback credits reset");
        self.emit(ExecutorEvent::DailyReset { date: today });
        true
    }

    /// Run one task on the fallback tier.
    pub async fn execute(&self, task: &FallbackTask) -> Result<ExecutionReport, ExecuteError> {
        self.check_daily_reset();

        let Some(generator) = &self.generator else {
            return Err(ExecuteError::Disabled);
        };
        if !self.has_credits() {
            return Err(ExecuteError::NoCredits);
        }

        let request = GenerationRequest::new(build_prompt(task))
            .with_max_output_tokens(self.config.max_output_tokens)
            .with_temperature(self.config.temperature);

        let started = Instant::now();
        match self.call(generator.as_ref(), request).await {
            Ok(generation) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let summary = if generation.text.trim().is_empty() {
                    "Completed".to_string()
                } else {
                    truncate(&generation.text, self.config.summary_chars)
                };
                {
                    let mut state = self.state();
                    state.stats.tasks_executed += 1;
                    state.stats.tokens_used += generation.tokens_used;
                    state.stats.last_execution = Some(Utc::now());
                    state.credits.lifetime_tasks += 1;
                    state.credits.lifetime_tokens += generation.tokens_used;
                    state.credits.consecutive_errors = 0;
                }
                tracing::info!(
                    title = %task.title,
                    tokens = generation.tokens_used,
                    latency_ms,
                    "Fallback task completed"
                );
                self.emit(ExecutorEvent::TaskCompleted {
                    title: task.title.clone(),
                    tokens_used: generation.tokens_used,
                    latency_ms,
                });
                Ok(ExecutionReport {
                    summary,
                    tokens_used: generation.tokens_used,
                    latency_ms,
                })
            }
            Err(err) => {
                self.record_failure(&err);
                Err(ExecuteError::Upstream(err))
            }
        }
    }

    async fn call(
        &self,
        generator: &dyn TextGenerator,
        request: GenerationRequest,
    ) -> Result<crate::adapters::Generation, TransportError> {
        let limit = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(limit, generator.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        }
    }

    fn record_failure(&self, err: &TransportError) {
        let opened = {
            let mut state = self.state();
            state.stats.errors_count += 1;
            state.credits.lifetime_errors += 1;
            state.credits.consecutive_errors += 1;
            let consecutive = state.credits.consecutive_errors;
            if consecutive >= self.config.max_consecutive_errors && state.credits.available {
                state.credits.available = false;
                Some(consecutive)
            } else {
                None
            }
        };

        tracing::warn!(error = %err, "Fallback execution failed");
        if let Some(consecutive_errors) = opened {
            tracing::error!(consecutive_errors, "Fallback credits exhausted, breaker open");
            self.emit(ExecutorEvent::CreditsExhausted {
                consecutive_errors,
                error: err.to_string(),
            });
        }
    }

    /// Send a minimal request to test whether the tier is usable again.
    pub async fn probe(&self) {
        let Some(generator) = &self.generator else {
            return;
        };

        let request = GenerationRequest::new("ping")
            .with_max_output_tokens(8)
            .with_temperature(0.0);
        let result = self.call(generator.as_ref(), request).await;

        match result {
            Ok(_) => {
                let restored = {
                    let mut state = self.state();
                    let was_available = state.credits.available;
                    state.credits.available = true;
                    state.credits.consecutive_errors = 0;
                    state.credits.last_check = Some(Utc::now());
                    state.credits.last_probe_error = None;
                    !was_available
                };
                if restored {
                    tracing::info!("Fallback credits restored");
                    self.emit(ExecutorEvent::CreditsRestored);
                }
            }
            Err(err) => {
                let quota = err.is_quota_exhausted();
                {
                    let mut state = self.state();
                    if quota {
                        state.credits.available = false;
                    }
                    state.credits.last_check = Some(Utc::now());
                    state.credits.last_probe_error = Some(err.to_string());
                }
                if quota {
                    tracing::warn!(error = %err, "Fallback credits low");
                    self.emit(ExecutorEvent::CreditsLow {
                        error: err.to_string(),
                    });
                } else {
                    tracing::debug!(error = %err, "Credit probe failed");
                }
            }
        }
    }

    /// Probe after a short warmup, then periodically. `None` when disabled.
    pub fn spawn_credit_monitor(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        let warmup = Duration::from_secs(self.config.probe_warmup_secs);
        let period = Duration::from_secs(self.config.probe_interval_secs.max(1));

        Some(tokio::spawn(async move {
            tokio::time::sleep(warmup).await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.check_daily_reset();
                self.probe().await;
            }
        }))
    }

    pub fn status(&self) -> FallbackStatus {
        let has_credits = self.has_credits();
        let state = self.state();
        FallbackStatus {
            enabled: self.is_enabled(),
            has_credits,
            model: self
                .generator
                .as_ref()
                .map(|g| g.model().to_string())
                .unwrap_or_else(|| self.config.model.clone()),
            stats: state.stats.clone(),
            credits: state.credits.clone(),
        }
    }

    pub fn status_message(&self) -> String {
        let status = self.status();
        if !status.enabled {
            return "Fallback tier: disabled (no API key)".to_string();
        }
        let mut lines = vec![
            format!("Fallback tier: {}", status.model),
            format!(
                "Credits: {}",
                if status.has_credits { "available" } else { "exhausted" }
            ),
            format!(
                "Today: {} tasks, {} tokens, {} errors",
                status.stats.tasks_executed, status.stats.tokens_used, status.stats.errors_count
            ),
            format!(
                "Consecutive errors: {}/{}",
                status.credits.consecutive_errors, self.config.max_consecutive_errors
            ),
        ];
        if let Some(err) = &status.credits.last_probe_error {
            lines.push(format!("Last probe error: {}", err));
        }
        lines.join("\n")
    }
}

fn build_prompt(task: &FallbackTask) -> String {
    let mut prompt = String::from(
        "You are a fast code execution agent. Complete this task efficiently.\n\n",
    );
    prompt.push_str(&format!("Task: {}\n", task.title));
    if let Some(description) = task.description.as_deref().filter(|d| !d.is_empty()) {
        prompt.push_str(&format!("Details: {}\n", description));
    }
    if let Some(context) = task.context.as_deref().filter(|c| !c.is_empty()) {
        prompt.push_str(&format!("Context: {}\n", context));
    }
    prompt.push_str("\nRespond with a concise summary of what was done.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Generation;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        replies: Mutex<VecDeque<Result<Generation, TransportError>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Generation, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(VecDeque::new()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _request: GenerationRequest) -> Result<Generation, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok("done", 10)))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    struct ManualClock(Mutex<NaiveDate>);

    impl ManualClock {
        fn new(date: NaiveDate) -> Arc<Self> {
            Arc::new(Self(Mutex::new(date)))
        }

        fn advance_day(&self) {
            let mut date = self.0.lock().unwrap();
            *date = date.succ_opt().unwrap();
        }
    }

    impl Clock for ManualClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock().unwrap()
        }
    }

    fn ok(text: &str, tokens: u64) -> Generation {
        Generation {
            text: text.to_string(),
            tokens_used: tokens,
            latency_ms: 1,
        }
    }

    fn server_error() -> Result<Generation, TransportError> {
        Err(TransportError::Status {
            status: 500,
            body: "boom".to_string(),
        })
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()
    }

    fn executor(generator: Arc<Scripted>, clock: Arc<ManualClock>) -> FallbackExecutor {
        FallbackExecutor::with_clock(FallbackConfig::default(), Some(generator), clock)
    }

    #[tokio::test]
    async fn disabled_without_generator() {
        let executor = FallbackExecutor::new(FallbackConfig::default(), None);
        assert!(!executor.has_credits());
        let err = executor.execute(&FallbackTask::new("x")).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Disabled));
        assert!(executor.status_message().contains("disabled"));
    }

    #[tokio::test]
    async fn success_updates_stats_and_truncates_summary() {
        let long = "a".repeat(800);
        let generator = Scripted::new(vec![Ok(ok(&long, 120))]);
        let executor = executor(generator, ManualClock::new(day()));
        let mut events = executor.subscribe();

        let report = executor
            .execute(&FallbackTask::new("Add docs").with_description("Write README"))
            .await
            .unwrap();

        assert_eq!(report.summary.chars().count(), 500);
        assert_eq!(report.tokens_used, 120);
        let status = executor.status();
        assert_eq!(status.stats.tasks_executed, 1);
        assert_eq!(status.stats.tokens_used, 120);
        assert_eq!(status.credits.lifetime_tokens, 120);
        assert!(matches!(
            events.try_recv().unwrap(),
            ExecutorEvent::TaskCompleted { tokens_used: 120, .. }
        ));
    }

    #[tokio::test]
    async fn empty_reply_summarises_as_completed() {
        let generator = Scripted::new(vec![Ok(ok("  ", 3))]);
        let executor = executor(generator, ManualClock::new(day()));
        let report = executor.execute(&FallbackTask::new("x")).await.unwrap();
        assert_eq!(report.summary, "Completed");
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures() {
        let generator = Scripted::new((0..5).map(|_| server_error()).collect());
        let executor = executor(generator.clone(), ManualClock::new(day()));
        let mut events = executor.subscribe();
        let task = FallbackTask::new("x");

        for attempt in 1..=5 {
            assert!(executor.has_credits(), "closed before attempt {}", attempt);
            let err = executor.execute(&task).await.unwrap_err();
            assert!(matches!(err, ExecuteError::Upstream(_)));
        }
        assert!(!executor.has_credits());

        let err = executor.execute(&task).await.unwrap_err();
        assert!(matches!(err, ExecuteError::NoCredits));
        assert_eq!(generator.calls(), 5);

        let exhausted: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, ExecutorEvent::CreditsExhausted { .. }))
            .collect();
        assert_eq!(exhausted.len(), 1);
    }

    #[tokio::test]
    async fn success_resets_consecutive_errors() {
        let generator = Scripted::new(vec![
            server_error(),
            server_error(),
            Ok(ok("fine", 1)),
        ]);
        let executor = executor(generator, ManualClock::new(day()));
        let task = FallbackTask::new("x");
        let _ = executor.execute(&task).await;
        let _ = executor.execute(&task).await;
        executor.execute(&task).await.unwrap();

        let status = executor.status();
        assert_eq!(status.credits.consecutive_errors, 0);
        assert_eq!(status.stats.errors_count, 2);
    }

    #[tokio::test]
    async fn day_rollover_closes_breaker() {
        let generator = Scripted::new((0..5).map(|_| server_error()).collect());
        let clock = ManualClock::new(day());
        let executor = executor(generator, clock.clone());
        let task = FallbackTask::new("x");
        for _ in 0..5 {
            let _ = executor.execute(&task).await;
        }
        assert!(!executor.has_credits());

        clock.advance_day();
        let mut events = executor.subscribe();
        let report = executor.execute(&task).await.unwrap();
        assert_eq!(report.summary, "done");

        let status = executor.status();
        assert_eq!(status.credits.daily_date, day().succ_opt().unwrap());
        assert_eq!(status.stats.tasks_executed, 1);
        assert_eq!(status.stats.errors_count, 0);
        assert_eq!(status.credits.lifetime_errors, 5);
        assert!(matches!(
            events.try_recv().unwrap(),
            ExecutorEvent::DailyReset { .. }
        ));
    }

    #[tokio::test]
    async fn timeout_counts_toward_breaker() {
        let generator = Scripted::slow(Duration::from_millis(500));
        let config = FallbackConfig {
            timeout_ms: 20,
            max_consecutive_errors: 1,
            ..FallbackConfig::default()
        };
        let executor =
            FallbackExecutor::with_clock(config, Some(generator), ManualClock::new(day()));

        let err = executor.execute(&FallbackTask::new("x")).await.unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Upstream(TransportError::Timeout(_))
        ));
        assert!(!executor.has_credits());
    }

    #[tokio::test]
    async fn rate_limit_is_a_distinct_counted_failure() {
        let generator = Scripted::new(vec![Err(TransportError::RateLimited("RPM".into()))]);
        let executor = executor(generator, ManualClock::new(day()));
        let err = executor.execute(&FallbackTask::new("x")).await.unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Upstream(TransportError::RateLimited(_))
        ));
        assert_eq!(executor.status().credits.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn successful_probe_restores_credits() {
        let mut replies: Vec<_> = (0..5).map(|_| server_error()).collect();
        replies.push(Ok(ok("pong", 1)));
        let generator = Scripted::new(replies);
        let executor = executor(generator, ManualClock::new(day()));
        for _ in 0..5 {
            let _ = executor.execute(&FallbackTask::new("x")).await;
        }
        let mut events = executor.subscribe();

        executor.probe().await;

        assert!(executor.has_credits());
        let status = executor.status();
        assert!(status.credits.last_check.is_some());
        assert_eq!(status.credits.last_probe_error, None);
        assert_eq!(events.try_recv().unwrap(), ExecutorEvent::CreditsRestored);
    }

    #[tokio::test]
    async fn quota_probe_marks_credits_low() {
        let generator = Scripted::new(vec![Err(TransportError::RateLimited("quota".into()))]);
        let executor = executor(generator, ManualClock::new(day()));
        let mut events = executor.subscribe();

        executor.probe().await;

        assert!(!executor.has_credits());
        assert!(matches!(
            events.try_recv().unwrap(),
            ExecutorEvent::CreditsLow { .. }
        ));
    }

    #[tokio::test]
    async fn other_probe_errors_leave_availability_alone() {
        let generator = Scripted::new(vec![server_error()]);
        let executor = executor(generator, ManualClock::new(day()));

        executor.probe().await;

        assert!(executor.has_credits());
        let status = executor.status();
        assert!(status.credits.last_probe_error.unwrap().contains("500"));
        assert_eq!(status.credits.consecutive_errors, 0);
    }

    #[test]
    fn prompt_includes_all_task_parts() {
        let prompt = build_prompt(
            &FallbackTask::new("Fix login")
                .with_description("Null check on session")
                .with_context("src/auth.rs"),
        );
        assert!(prompt.contains("Task: Fix login"));
        assert!(prompt.contains("Details: Null check on session"));
        assert!(prompt.contains("Context: src/auth.rs"));
    }

    #[test]
    fn task_conversion_carries_output_file() {
        let task = Task {
            id: "t1".into(),
            title: "Schema".into(),
            prompt: "Design tables".into(),
            depends_on: vec![],
            output_file: Some("schema.sql".into()),
        };
        let fallback = FallbackTask::from(&task);
        assert_eq!(fallback.description.as_deref(), Some("Design tables"));
        assert!(fallback.context.unwrap().contains("schema.sql"));
    }
}
