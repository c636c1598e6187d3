//! Plan model - a validated, phase-ordered decomposition of a request.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Specialist roles a phase can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "Lead Architect")]
    LeadArchitect,
    #[serde(rename = "Data Master")]
    DataMaster,
    #[serde(rename = "UI Engine")]
    UiEngine,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::LeadArchitect, Role::DataMaster, Role::UiEngine];

    /// Parse a role from its display name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name.trim())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LeadArchitect => "Lead Architect",
            Self::DataMaster => "Data Master",
            Self::UiEngine => "UI Engine",
        }
    }

    /// What this role is responsible for, as described to the planner.
    pub fn responsibilities(&self) -> &'static str {
        match self {
            Self::LeadArchitect => {
                "architecture, schemas, API contracts and types; QA, code review, test strategy and CI"
            }
            Self::DataMaster => {
                "backend endpoints and server logic; database schema, migrations and queries; external integrations"
            }
            Self::UiEngine => {
                "frontend components and pages; styling, animation and responsive layout; forms, dashboards and navigation"
            }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single unit of work inside a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the plan
    pub id: String,

    /// Short title
    pub title: String,

    /// Detailed, self-contained instructions for the agent
    pub prompt: String,

    /// Ids of tasks from earlier phases this task reads from
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Artifact file the task must produce, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

/// An ordered stage of the plan. Tasks in a phase run in parallel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub order: u32,
    pub role: Role,
    pub tasks: Vec<Task>,
}

/// A validated decomposition. Read-only once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: String,

    /// Phases sorted by ascending order
    pub phases: Vec<Phase>,

    /// Work units the planner decided to use
    #[serde(default)]
    pub total_units: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_strategy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_time_minutes: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_notes: Option<String>,
}

impl Plan {
    /// All tasks across phases, in phase order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    /// Get a task by id
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks().find(|t| t.id == id)
    }

    /// Number of tasks in the plan
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(|p| p.tasks.len()).sum()
    }

    /// Output files the plan's tasks declare, in task order
    pub fn required_outputs(&self) -> Vec<&str> {
        self.tasks()
            .filter_map(|t| t.output_file.as_deref())
            .collect()
    }

    /// The lowest-order phase that still has an incomplete task.
    pub fn active_phase(&self, completed: &HashSet<String>) -> Option<&Phase> {
        self.phases
            .iter()
            .filter(|p| p.tasks.iter().any(|t| !completed.contains(&t.id)))
            .min_by_key(|p| p.order)
    }

    /// Whether every task has completed
    pub fn is_complete(&self, completed: &HashSet<String>) -> bool {
        self.tasks().all(|t| completed.contains(&t.id))
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let roles: Vec<&str> = self.phases.iter().map(|p| p.role.name()).collect();
        format!(
            "Plan {}: {} units, {} tasks across {} phases ({})",
            self.id,
            self.total_units,
            self.task_count(),
            self.phases.len(),
            roles.join(" -> ")
        )
    }
}
