//! Relay Core - orchestration control plane for autonomous coding agents
//!
//! This crate provides the control-plane logic for decomposing requests
//! into phase-ordered plans, throttling concurrency from hardware
//! temperatures, delegating overflow to a metered fallback tier, and
//! auditing the artifacts agents produce.

pub mod adapters;
pub mod config;
pub mod kernel;
pub mod observability;
pub mod state;
pub mod telemetry;

pub use config::RelayConfig;
pub use kernel::{
    ArtifactAuditor, Dispatcher, FallbackExecutor, Scheduler, TaskDecomposer, Tier,
};
pub use observability::{ControlEvent, EventEmitter};
pub use state::Plan;
pub use telemetry::{TelemetryGovernor, ThrottleLevel};
