//! Planner - decomposes a free-text request into a phase-ordered plan.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::adapters::{truncate, GenerationRequest, TextGenerator, TransportError};
use crate::config::PlannerConfig;
use crate::state::{Phase, Plan, Role, Task};

/// Characters of an unparseable reply kept in the error.
const RAW_PAYLOAD_CHARS: usize = 500;

/// A plan that breaks one of the structural rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("total unit count must be a positive integer, got {0}")]
    NonPositiveUnitCount(i64),

    #[error("total unit count {0} is too large")]
    UnitCountOutOfRange(i64),

    #[error("plan has no phases")]
    NoPhases,

    #[error("phase {order} has no tasks")]
    EmptyPhase { order: u32 },

    #[error("phase order {order} appears more than once")]
    DuplicatePhaseOrder { order: u32 },

    #[error("phase {order} has unknown role: {role}")]
    UnknownRole { order: u32, role: String },

    #[error("task #{index} in phase {order} is missing required field `{field}`")]
    MissingTaskField {
        order: u32,
        index: usize,
        field: &'static str,
    },

    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("task {task} depends on {dependency}, which is not in an earlier phase")]
    ForwardDependency { task: String, dependency: String },

    #[error("task {task} depends on unknown task: {dependency}")]
    UnknownDependency { task: String, dependency: String },
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner upstream failed: {0}")]
    Transport(#[from] TransportError),

    #[error("planner reply is not a valid plan: {message}")]
    Parse { message: String, raw: String },

    #[error("plan failed validation: {0}")]
    Validation(#[from] ValidationError),
}

impl PlanError {
    /// Only transport failures are worth retrying with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_retryable())
    }
}

/// The planner's reply as the upstream shapes it, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanReply {
    #[serde(alias = "total_jules")]
    pub total_units: i64,
    #[serde(default)]
    pub phases: Vec<PhaseReply>,
    #[serde(default)]
    pub relay_strategy: Option<String>,
    #[serde(default)]
    pub estimated_time_minutes: Option<u32>,
    #[serde(default)]
    pub risk_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseReply {
    pub order: u32,
    pub role: String,
    #[serde(default)]
    pub tasks: Vec<TaskReply>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskReply {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub output_file: Option<String>,
}

/// Decomposes requests with one upstream call each.
pub struct TaskDecomposer {
    config: PlannerConfig,
    generator: Arc<dyn TextGenerator>,
}

impl TaskDecomposer {
    pub fn new(config: PlannerConfig, generator: Arc<dyn TextGenerator>) -> Self {
        Self { config, generator }
    }

    /// Ask the upstream for a plan and validate it.
    pub async fn analyze(&self, request: &str, max_units: u32) -> Result<Plan, PlanError> {
        tracing::info!(
            max_units,
            model = %self.generator.model(),
            request = %truncate(request, 80),
            "Decomposing request"
        );

        let call = GenerationRequest::new(user_prompt(request, max_units))
            .with_system(system_instruction(self.config.repository.as_deref()))
            .with_temperature(self.config.temperature)
            .with_max_output_tokens(self.config.max_output_tokens)
            .json();

        let generation = self.generator.generate(call).await.map_err(|e| {
            tracing::warn!(error = %e, "Planner upstream call failed");
            e
        })?;

        let reply = parse_reply(&generation.text)?;
        let plan = validate_reply(reply)?;

        tracing::info!(
            plan_id = %plan.id,
            units = plan.total_units,
            phases = plan.phases.len(),
            tasks = plan.task_count(),
            "Plan validated"
        );
        Ok(plan)
    }
}

/// Fixed instruction describing roles and the relay rule.
pub fn system_instruction(repository: Option<&str>) -> String {
    let mut text = String::from(
        "You are the planning core of an orchestration system for autonomous coding agents.\n\
         Agents are grouped into specialist roles:\n\n",
    );
    for (i, role) in Role::ALL.iter().enumerate() {
        text.push_str(&format!("{}. {}: {}\n", i + 1, role.name(), role.responsibilities()));
    }
    text.push_str(
        "\nRELAY RULE:\n\
         - Phases execute strictly in order.\n\
         - Tasks within a phase run in parallel.\n\
         - Later phases may read the output of earlier phases.\n\n\
         RULES:\n\
         1. Allocate work units according to the real complexity of the request.\n\
         2. Every task needs a detailed, actionable prompt an agent can follow on its own.\n\
         3. depends_on may only reference tasks from EARLIER phases.\n\
         4. You do not have to use the whole budget.\n\
         5. Omit phases that are not needed, keep the order of the rest, never emit a phase without tasks.\n",
    );
    if let Some(repo) = repository {
        text.push_str(&format!("6. Target repository: {}\n", repo));
    }
    text.push_str("\nReply with valid JSON only: no markdown, no code fences, no commentary.");
    text
}

/// User prompt embedding the request, budget and reply shape.
pub fn user_prompt(request: &str, max_units: u32) -> String {
    format!(
        r#"Decompose this request into subtasks for the agent swarm.
At most {max_units} work units are available. Use what the work actually needs.

REQUEST: {request}

Reply with exactly this JSON shape:
{{
  "total_units": <integer>,
  "phases": [
    {{
      "order": 1,
      "role": "Lead Architect" | "Data Master" | "UI Engine",
      "tasks": [
        {{
          "id": "<unique id>",
          "title": "<short title>",
          "prompt": "<detailed prompt>",
          "depends_on": ["<ids from earlier phases>"],
          "output_file": "<artifact file name, optional>"
        }}
      ]
    }}
  ],
  "relay_strategy": "<how work flows between phases>",
  "estimated_time_minutes": <integer>,
  "risk_notes": "<risks or caveats>"
}}"#
    )
}

/// Strip a markdown code fence, if the upstream added one anyway.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the upstream text into the reply shape.
pub fn parse_reply(text: &str) -> Result<PlanReply, PlanError> {
    serde_json::from_str(strip_fences(text)).map_err(|e| {
        tracing::error!(raw = %truncate(text, RAW_PAYLOAD_CHARS), "Unparseable planner reply");
        PlanError::Parse {
            message: e.to_string(),
            raw: truncate(text, RAW_PAYLOAD_CHARS),
        }
    })
}

/// Check every structural rule and build the plan. Phases are sorted by
/// order before dependencies are checked.
pub fn validate_reply(reply: PlanReply) -> Result<Plan, ValidationError> {
    if reply.total_units < 1 {
        return Err(ValidationError::NonPositiveUnitCount(reply.total_units));
    }
    let total_units = u32::try_from(reply.total_units)
        .map_err(|_| ValidationError::UnitCountOutOfRange(reply.total_units))?;
    if reply.phases.is_empty() {
        return Err(ValidationError::NoPhases);
    }

    let mut phases_in = reply.phases;
    phases_in.sort_by_key(|p| p.order);

    let mut orders = HashSet::new();
    let mut all_ids = HashSet::new();
    let mut phases = Vec::with_capacity(phases_in.len());

    for phase in phases_in {
        if !orders.insert(phase.order) {
            return Err(ValidationError::DuplicatePhaseOrder { order: phase.order });
        }
        let role = Role::from_name(&phase.role).ok_or_else(|| ValidationError::UnknownRole {
            order: phase.order,
            role: phase.role.clone(),
        })?;
        if phase.tasks.is_empty() {
            return Err(ValidationError::EmptyPhase { order: phase.order });
        }

        let mut tasks = Vec::with_capacity(phase.tasks.len());
        for (index, task) in phase.tasks.into_iter().enumerate() {
            for (field, value) in [("id", &task.id), ("title", &task.title), ("prompt", &task.prompt)] {
                if value.trim().is_empty() {
                    return Err(ValidationError::MissingTaskField {
                        order: phase.order,
                        index,
                        field,
                    });
                }
            }
            if !all_ids.insert(task.id.clone()) {
                return Err(ValidationError::DuplicateTaskId(task.id));
            }
            tasks.push(Task {
                id: task.id,
                title: task.title,
                prompt: task.prompt,
                depends_on: task.depends_on,
                output_file: task.output_file.filter(|f| !f.trim().is_empty()),
            });
        }

        phases.push(Phase {
            order: phase.order,
            role,
            tasks,
        });
    }

    // Only ids from strictly earlier phases are visible; a phase's own ids
    // join the set after its dependencies are checked.
    let mut seen: HashSet<&str> = HashSet::new();
    for phase in &phases {
        for task in &phase.tasks {
            for dep in &task.depends_on {
                if seen.contains(dep.as_str()) {
                    continue;
                }
                return Err(if all_ids.contains(dep) {
                    ValidationError::ForwardDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }
                } else {
                    ValidationError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }
                });
            }
        }
        seen.extend(phase.tasks.iter().map(|t| t.id.as_str()));
    }

    Ok(Plan {
        id: uuid::Uuid::new_v4().to_string(),
        phases,
        total_units,
        relay_strategy: reply.relay_strategy,
        estimated_time_minutes: reply.estimated_time_minutes,
        risk_notes: reply.risk_notes,
    })
}
