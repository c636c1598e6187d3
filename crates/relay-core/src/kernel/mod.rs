//! Kernel - planning, scheduling, dispatching, executing, and auditing tasks.

mod auditor;
mod dispatcher;
mod fallback;
mod planner;
mod scheduler;

pub use auditor::{
    read_artifacts, sha256_hex, ArtifactAuditor, AuditError, AuditRequest, AuditResponse,
    AuditStatus, AuditVerdict, DiskArtifact, Manifest, ManifestEntry,
};
pub use dispatcher::{select_tier, Dispatcher, Tier};
pub use fallback::{
    Clock, CreditState, ExecuteError, ExecutionReport, ExecutorEvent, FallbackExecutor,
    FallbackStatus, FallbackTask, SystemClock, UsageStats,
};
pub use planner::{
    parse_reply, validate_reply, PhaseReply, PlanError, PlanReply, TaskDecomposer, TaskReply,
    ValidationError,
};
pub use scheduler::{ScheduleResult, Scheduler};
