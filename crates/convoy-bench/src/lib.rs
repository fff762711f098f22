//! Benchmark profiles for the Convoy WorkGroup scheduler.
//!
//! Provides pre-built, already started [`WorkGroupManager`]s:
//!
//! - [`reference_profile`]: 256 random walkers on 4 Workers plus a coarse
//!   signal group ticking every fifth base tick
//! - [`stress_profile`]: 4096 walkers across two 8-Worker groups
//! - [`Profile::single_threaded`]: the same layouts driven on one thread

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use convoy_core::Buffered;
use convoy_engine::{LoadParams, ManagerConfig, SchedulerError, WorkGroupConfig, WorkGroupManager};
use convoy_test_utils::{boxed, walker_ring, AddTickDivisibleAgent};

/// Base ticks a profile is configured for. Large enough that a benchmark
/// never runs the groups to completion.
pub const PROFILE_TICKS: u64 = 10_000_000;

/// Step of the coarse signal group.
pub const SIGNAL_STEP: u64 = 5;

/// A started manager and handles onto the state its entities write.
pub struct Profile {
    /// The started manager.
    pub manager: WorkGroupManager,
    /// Committed walker positions.
    pub positions: Vec<Arc<Buffered<i64>>>,
}

impl Profile {
    /// Build a profile of `walkers` walkers spread over `groups` groups of
    /// `workers` Workers each, plus one signal group.
    pub fn build(
        seed: u64,
        walkers: usize,
        groups: usize,
        workers: usize,
        total_ticks: u64,
        single_threaded: bool,
    ) -> Result<Self, SchedulerError> {
        let mut manager = WorkGroupManager::new(ManagerConfig {
            single_threaded,
            ..ManagerConfig::default()
        })?;

        let walker_groups = (0..groups.max(1))
            .map(|_| manager.new_work_group(WorkGroupConfig::new(workers, total_ticks, 1)))
            .collect::<Result<Vec<_>, _>>()?;
        let signals = manager.new_work_group(WorkGroupConfig::new(1, total_ticks, SIGNAL_STEP))?;
        manager.init_all_groups()?;

        let (entities, positions) = walker_ring(walkers, seed);
        let mut shards: Vec<Vec<_>> = walker_groups.iter().map(|_| Vec::new()).collect();
        let shard_count = shards.len();
        for (i, entity) in entities.into_iter().enumerate() {
            shards[i % shard_count].push(entity);
        }
        for (group, shard) in walker_groups.iter().zip(shards) {
            group.init_workers(LoadParams::new(shard))?;
        }
        signals.init_workers(LoadParams::new(boxed(
            (0..8).map(|i| AddTickDivisibleAgent::new(1_000_000 + i, SIGNAL_STEP)),
        )))?;

        manager.start_all_work_groups()?;
        Ok(Self { manager, positions })
    }

    /// [`reference_profile`] on the calling thread.
    pub fn single_threaded(seed: u64) -> Result<Self, SchedulerError> {
        Self::build(seed, 256, 1, 1, PROFILE_TICKS, true)
    }
}

/// 256 walkers on one 4-Worker group, plus the signal group.
pub fn reference_profile(seed: u64) -> Result<Profile, SchedulerError> {
    Profile::build(seed, 256, 1, 4, PROFILE_TICKS, false)
}

/// 4096 walkers across two 8-Worker groups, plus the signal group.
pub fn stress_profile(seed: u64) -> Result<Profile, SchedulerError> {
    Profile::build(seed, 4096, 2, 8, PROFILE_TICKS, false)
}
