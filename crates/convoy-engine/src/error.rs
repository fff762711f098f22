//! Scheduler-level error type.

use convoy_core::{EntityError, EntityId, GroupId, TickId, WorkerId};
use thiserror::Error;

use crate::barrier::BarrierError;
use crate::config::ConfigError;
use crate::manager::ManagerState;
use crate::scheduler::Phase;

/// Errors from [`WorkGroupManager`](crate::WorkGroupManager) and
/// [`WorkGroup`](crate::WorkGroup) operations.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum SchedulerError {
    /// Configuration was rejected.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    /// The operation is not allowed in the manager's current state.
    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// State the manager was in.
        state: ManagerState,
    },
    /// `init_all_groups()` was called with no WorkGroups registered.
    #[error("no work groups registered")]
    NoWorkGroups,
    /// No WorkGroup with this id.
    #[error("unknown work group {group}")]
    UnknownGroup {
        /// The id that was looked up.
        group: GroupId,
    },
    /// No live entity with this id.
    #[error("unknown entity {entity}")]
    UnknownEntity {
        /// The id that was looked up.
        entity: EntityId,
    },
    /// `init_workers()` has not been called for this group.
    #[error("workers of group {group} are not initialized")]
    WorkersNotInitialized {
        /// The group.
        group: GroupId,
    },
    /// `init_workers()` was called twice.
    #[error("workers of group {group} are already initialized")]
    WorkersAlreadyInitialized {
        /// The group.
        group: GroupId,
    },
    /// Direct placement was attempted after the group's threads started.
    #[error("group {group} has started; admit entities through the manager")]
    GroupStarted {
        /// The group.
        group: GroupId,
    },
    /// A second live entity with the same id was submitted.
    #[error("entity {entity} is already registered")]
    DuplicateEntity {
        /// The duplicated id.
        entity: EntityId,
    },
    /// An entity's `frame_init()` or `update()` failed or panicked.
    #[error("entity {entity} failed on worker {worker} at tick {tick}")]
    EntityFailed {
        /// The failing entity.
        entity: EntityId,
        /// The Worker running it.
        worker: WorkerId,
        /// Base tick of the failure.
        tick: TickId,
        /// What the entity reported.
        #[source]
        source: EntityError,
    },
    /// Work run by a phase leader (cleanup, message delivery or a hook)
    /// panicked.
    #[error("{phase:?} leader panicked: {message}")]
    LeaderPanicked {
        /// Phase whose leader action panicked.
        phase: Phase,
        /// Panic payload, if it was a string.
        message: String,
    },
    /// A shared barrier failed (abort or stall).
    #[error("barrier: {0}")]
    Barrier(#[from] BarrierError),
    /// Every configured tick has already run.
    #[error("simulation finished after {ticks} ticks")]
    SimulationFinished {
        /// Ticks completed.
        ticks: u64,
    },
    /// A phase sub-call was made out of order.
    #[error("phase {requested:?} requested, but {expected:?} is next")]
    PhaseOrder {
        /// The phase the caller asked for.
        requested: Phase,
        /// The phase the manager expected.
        expected: Phase,
    },
    /// A Worker thread could not be spawned.
    #[error("thread spawn failed: {reason}")]
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
}
