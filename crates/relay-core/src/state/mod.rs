//! State - plan model shared by the planner, scheduler and auditor.

mod plan;

pub use plan::{Phase, Plan, Role, Task};
