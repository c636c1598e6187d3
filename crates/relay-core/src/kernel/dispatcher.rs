//! Dispatcher - routes tasks between the primary pool and the fallback tier.

use std::fmt;

use serde::Serialize;

use super::FallbackExecutor;
use crate::telemetry::TelemetryGovernor;

/// Where a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Local agent pool
    Primary,
    /// Metered remote tier
    Fallback,
    /// Nothing available; a human has to pick it up
    Manual,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Primary => "primary",
            Tier::Fallback => "fallback",
            Tier::Manual => "manual",
        })
    }
}

/// Pure tier selection rule.
pub fn select_tier(
    primary_active: usize,
    primary_capacity: usize,
    must_delegate: bool,
    governor_ceiling: usize,
    fallback_has_credits: bool,
) -> Tier {
    let ceiling = primary_capacity.min(governor_ceiling);
    if !must_delegate && primary_active < ceiling {
        Tier::Primary
    } else if fallback_has_credits {
        Tier::Fallback
    } else {
        Tier::Manual
    }
}

/// Dispatcher routes tasks using live governor and executor state.
pub struct Dispatcher {
    primary_capacity: usize,
}

impl Dispatcher {
    pub fn new(primary_capacity: usize) -> Self {
        Self { primary_capacity }
    }

    /// Select the tier for the next task given how many primary slots are busy.
    pub fn select_tier(
        &self,
        primary_active: usize,
        governor: &TelemetryGovernor,
        fallback: &FallbackExecutor,
    ) -> Tier {
        let tier = select_tier(
            primary_active,
            self.primary_capacity,
            governor.should_delegate(),
            governor.current_max_concurrent(),
            fallback.has_credits(),
        );
        tracing::debug!(
            primary_active,
            capacity = self.primary_capacity,
            level = %governor.level(),
            tier = %tier,
            "Tier selected"
        );
        tier
    }
}
