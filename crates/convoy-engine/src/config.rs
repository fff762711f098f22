//! Scheduler configuration, validation, and error types.
//!
//! [`ManagerConfig`] configures a [`WorkGroupManager`](crate::WorkGroupManager)
//! run; [`WorkGroupConfig`] configures one WorkGroup. Both are plain structs
//! with `Default` and a `validate()` pass that runs before any thread exists.

use std::time::Duration;

use convoy_core::GroupId;
use thiserror::Error;

/// Upper bound on explicit per-group worker counts.
pub const MAX_WORKERS_PER_GROUP: usize = 256;

// ── StallConfig ─────────────────────────────────────────────────

/// What a barrier does once a wait exceeds [`StallConfig::timeout`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StallPolicy {
    /// Log a scheduler-stall warning and keep waiting.
    #[default]
    Warn,
    /// Log, then abort the run with [`BarrierError::Stalled`](crate::BarrierError::Stalled).
    Abort,
}

/// Configuration for the barrier stall diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StallConfig {
    /// How long one barrier generation may stay incomplete. Default: 5s.
    pub timeout: Duration,
    /// Reaction to a stall. Default: [`StallPolicy::Warn`].
    pub policy: StallPolicy,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            policy: StallPolicy::Warn,
        }
    }
}

// ── ManagerConfig ───────────────────────────────────────────────

/// Configuration for one simulation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Drive every Worker's phases from the calling thread instead of
    /// spawning threads. Default: `false`.
    pub single_threaded: bool,
    /// Length of one base tick in simulated milliseconds. Default: 100.
    pub base_granularity_ms: u64,
    /// Optional stall diagnostic on the shared barriers. Default: `None`.
    pub stall: Option<StallConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            single_threaded: false,
            base_granularity_ms: 100,
            stall: None,
        }
    }
}

impl ManagerConfig {
    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_granularity_ms == 0 {
            return Err(ConfigError::InvalidGranularity);
        }
        if let Some(stall) = &self.stall {
            if stall.timeout.is_zero() {
                return Err(ConfigError::InvalidStallTimeout);
            }
        }
        Ok(())
    }
}

// ── WorkGroupConfig ─────────────────────────────────────────────

/// How a WorkGroup picks the Worker for a newly admitted entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// Cycle through Workers in index order.
    #[default]
    RoundRobin,
    /// Pick the Worker owning the fewest entities (lowest index on ties).
    LeastLoaded,
}

/// Configuration for one WorkGroup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkGroupConfig {
    /// Number of Worker threads. `None` = auto-detect
    /// (`available_parallelism`, clamped to `[1, 16]`). `Some(0)` is allowed
    /// for groups that only run hooks.
    pub num_workers: Option<usize>,
    /// Base ticks this group runs for. Must be at least 1.
    pub total_ticks: u64,
    /// Base ticks between activations. Must be at least 1.
    pub tick_step: u64,
    /// Worker selection for admitted entities.
    pub assignment: AssignmentPolicy,
}

impl Default for WorkGroupConfig {
    fn default() -> Self {
        Self {
            num_workers: None,
            total_ticks: 1,
            tick_step: 1,
            assignment: AssignmentPolicy::RoundRobin,
        }
    }
}

impl WorkGroupConfig {
    /// Shorthand for the common case.
    pub fn new(num_workers: usize, total_ticks: u64, tick_step: u64) -> Self {
        Self {
            num_workers: Some(num_workers),
            total_ticks,
            tick_step,
            assignment: AssignmentPolicy::RoundRobin,
        }
    }

    /// Replace the assignment policy.
    pub fn with_assignment(mut self, assignment: AssignmentPolicy) -> Self {
        self.assignment = assignment;
        self
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_step == 0 {
            return Err(ConfigError::InvalidTickStep {
                value: self.tick_step,
            });
        }
        if self.total_ticks == 0 {
            return Err(ConfigError::ZeroTotalTicks);
        }
        if let Some(n) = self.num_workers {
            if n > MAX_WORKERS_PER_GROUP {
                return Err(ConfigError::TooManyWorkers {
                    requested: n,
                    max: MAX_WORKERS_PER_GROUP,
                });
            }
        }
        Ok(())
    }

    /// Resolve the actual worker count, applying auto-detection if `None`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.num_workers {
            Some(n) => n.min(MAX_WORKERS_PER_GROUP),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, 16),
        }
    }
}

// ── ConfigError ─────────────────────────────────────────────────

/// Errors detected while validating configuration or loading entities.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `base_granularity_ms` is zero.
    #[error("base_granularity_ms must be at least 1")]
    InvalidGranularity,
    /// `tick_step` is zero.
    #[error("tick_step must be at least 1, got {value}")]
    InvalidTickStep {
        /// The invalid value.
        value: u64,
    },
    /// `total_ticks` is zero.
    #[error("total_ticks must be at least 1")]
    ZeroTotalTicks,
    /// The stall timeout is zero.
    #[error("stall timeout must be non-zero")]
    InvalidStallTimeout,
    /// Explicit worker count above [`MAX_WORKERS_PER_GROUP`].
    #[error("{requested} workers requested, maximum is {max}")]
    TooManyWorkers {
        /// Requested count.
        requested: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// A group with zero workers was given entities to run.
    #[error("group {group} has no workers but was given {entities} entities")]
    NoWorkersForEntities {
        /// The group.
        group: GroupId,
        /// Number of entities it was given.
        entities: usize,
    },
}
