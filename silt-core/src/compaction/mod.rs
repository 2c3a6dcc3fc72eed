//! Compaction: folding a file group's delta logs back into its base file
//!
//! Scheduling and execution are separate steps staged through the timeline.
//! Scheduling evaluates a trigger policy, generates a plan over the latest
//! file slices (skipping file groups already claimed by a pending plan), and
//! persists it as a REQUESTED compaction instant. Execution replays the plan,
//! one file group at a time, and completes the instant only when every
//! operation succeeded.

mod executor;
mod plan;
mod scheduler;

pub use executor::{CompactionExecutor, CompactionResult};
pub use plan::{metric, CompactionOperation, CompactionPlan, PLAN_VERSION};
pub use scheduler::CompactionScheduler;

use serde::{Deserialize, Serialize};

/// When the scheduler considers a table compactable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStrategy {
    /// Delta commits since the last compaction reached the threshold
    Num,
    /// Elapsed time since the last compaction reached the threshold
    TimeElapsed,
    /// Either threshold reached
    NumOrTime,
    /// Both thresholds reached
    NumAndTime,
}

/// Compaction configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Trigger policy evaluated at schedule time
    pub trigger: TriggerStrategy,
    /// Delta-commit count threshold
    pub max_delta_commits: usize,
    /// Elapsed-time threshold in seconds
    pub max_delta_seconds: i64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerStrategy::Num,
            max_delta_commits: crate::config::COMPACT_DELTA_COMMITS,
            max_delta_seconds: crate::config::COMPACT_DELTA_SECONDS,
        }
    }
}
