//! Phased WorkGroup scheduler for Convoy simulations.
//!
//! A [`WorkGroupManager`] owns one or more [`WorkGroup`]s. Each group runs a
//! fixed pool of [`Worker`] threads that own disjoint shards of entities, and
//! ticks every `tick_step` base ticks. All Workers of all groups meet at the
//! same shared barriers every base tick, so groups with different steps
//! never drift apart:
//!
//! 1. **Frame**: active Workers call `update()` on their started entities.
//!    Reads see the last committed state; writes are staged.
//! 2. **Flip**: active Workers commit staged writes. The elected leader then
//!    retires finished entities and stages newly due ones.
//! 3. **Spatial index** (only if some group has a spatial hook).
//! 4. **Message distribution**: the leader delivers messages and runs
//!    partition hooks.
//! 5. **Macro tick**: each active group elects one of its own Workers to
//!    run its macro tick hook.
//!
//! Setting [`ManagerConfig::single_threaded`] runs the same protocol on the
//! calling thread, producing identical results.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod barrier;
pub mod config;
pub mod error;
pub mod hooks;
pub mod loader;
pub mod manager;
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod scheduler;
pub mod work_group;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use barrier::{BarrierError, BarrierWaitResult, FlexiBarrier};
pub use config::{
    AssignmentPolicy, ConfigError, ManagerConfig, StallConfig, StallPolicy, WorkGroupConfig,
    MAX_WORKERS_PER_GROUP,
};
pub use error::SchedulerError;
pub use hooks::{GroupServices, HookContext, MacroTickHook, PartitionHook, SpatialIndexHook};
pub use loader::{EntityLoader, LoadParams, PeriodicLoader};
pub use manager::{FinishReport, ManagerState, WorkGroupManager};
pub use metrics::{SchedulerMetrics, TickMetrics};
pub use pending::PendingQueue;
pub use registry::{EntityLocation, EntityRecord, SimulationRegistry};
pub use scheduler::Phase;
pub use work_group::WorkGroup;
pub use worker::Worker;

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Entity panics are caught inside the frame phase, so a poisoned lock
/// still guards consistent state.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
