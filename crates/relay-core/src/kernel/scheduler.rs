//! Scheduler - computes the ready set of the active phase.

use std::collections::HashSet;

use crate::state::Plan;

/// Result of a scheduling cycle.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScheduleResult {
    /// Order of the phase being worked on
    pub active_phase: Option<u32>,
    /// Tasks ready to be worked on
    pub ready: Vec<String>,
    /// Tasks to start this cycle
    pub scheduled: Vec<String>,
    /// Ready tasks left for a later cycle
    pub deferred: Vec<String>,
}

impl ScheduleResult {
    pub fn summary(&self) -> String {
        format!(
            "Phase: {}, Ready: {}, Scheduled: {}, Deferred: {}",
            self.active_phase
                .map(|o| o.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.ready.len(),
            self.scheduled.len(),
            self.deferred.len()
        )
    }
}

/// Relay scheduler: a phase only starts once every earlier phase is done.
#[derive(Debug, Default)]
pub struct Scheduler {
    running_tasks: HashSet<String>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set currently running tasks (to avoid double-scheduling)
    pub fn set_running(&mut self, tasks: impl IntoIterator<Item = String>) {
        self.running_tasks = tasks.into_iter().collect();
    }

    /// Run a scheduling cycle under a concurrency ceiling.
    pub fn schedule(
        &self,
        plan: &Plan,
        completed: &HashSet<String>,
        max_concurrent: usize,
    ) -> ScheduleResult {
        let mut result = ScheduleResult::default();

        let Some(phase) = plan.active_phase(completed) else {
            return result;
        };
        result.active_phase = Some(phase.order);

        result.ready = phase
            .tasks
            .iter()
            .filter(|t| !completed.contains(&t.id) && !self.running_tasks.contains(&t.id))
            .filter(|t| t.depends_on.iter().all(|d| completed.contains(d)))
            .map(|t| t.id.clone())
            .collect();

        let slots = max_concurrent.saturating_sub(self.running_tasks.len());
        let split = slots.min(result.ready.len());
        result.scheduled = result.ready[..split].to_vec();
        result.deferred = result.ready[split..].to_vec();

        tracing::debug!(summary = %result.summary(), "Schedule cycle");
        result
    }
}
