//! The explicit, per-run registry of live entities.
//!
//! [`SimulationRegistry`] replaces a process-wide "all agents" set: it is
//! created by the [`WorkGroupManager`](crate::WorkGroupManager), shared by
//! `Arc`, and readable from any thread (output writers, hooks, tests) while
//! the run is in progress. Only the cleanup leader and the manager mutate it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use convoy_core::{EntityId, GroupId, WorkerId};
use indexmap::IndexMap;

use crate::error::SchedulerError;

/// Where a live entity currently sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityLocation {
    /// Waiting in a WorkGroup's pending queue.
    Pending(GroupId),
    /// Owned by a Worker.
    Assigned(WorkerId),
}

impl EntityLocation {
    /// The WorkGroup the entity belongs to.
    pub fn group(&self) -> GroupId {
        match self {
            Self::Pending(g) => *g,
            Self::Assigned(w) => w.group,
        }
    }
}

/// Registry entry for one live entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityRecord {
    /// Current location.
    pub location: EntityLocation,
    /// Start time the entity was registered with.
    pub start_time_ms: u64,
    /// Whether spatial hooks should skip this entity.
    pub non_spatial: bool,
    /// Removal has been requested but not yet processed.
    pub removal_requested: bool,
}

impl EntityRecord {
    /// A record for an entity about to be queued or placed.
    pub fn new(location: EntityLocation, start_time_ms: u64, non_spatial: bool) -> Self {
        Self {
            location,
            start_time_ms,
            non_spatial,
            removal_requested: false,
        }
    }
}

/// Thread-safe map of every live entity to its location.
///
/// Iteration order is registration order, except that removals move the
/// last entry into the removed slot.
#[derive(Debug, Default)]
pub struct SimulationRegistry {
    records: Mutex<IndexMap<EntityId, EntityRecord>>,
}

impl SimulationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IndexMap<EntityId, EntityRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new live entity. Fails if the id is already live.
    pub fn register(&self, id: EntityId, record: EntityRecord) -> Result<(), SchedulerError> {
        let mut records = self.lock();
        if records.contains_key(&id) {
            return Err(SchedulerError::DuplicateEntity { entity: id });
        }
        records.insert(id, record);
        Ok(())
    }

    /// Update an entity's location. Returns `false` if it is not live.
    pub fn relocate(&self, id: EntityId, location: EntityLocation) -> bool {
        match self.lock().get_mut(&id) {
            Some(record) => {
                record.location = location;
                true
            }
            None => false,
        }
    }

    /// Forget an entity.
    pub fn unregister(&self, id: EntityId) -> Option<EntityRecord> {
        self.lock().swap_remove(&id)
    }

    /// Flag an entity for removal. Returns `false` if it is not live.
    pub fn mark_removal(&self, id: EntityId) -> bool {
        match self.lock().get_mut(&id) {
            Some(record) => {
                record.removal_requested = true;
                true
            }
            None => false,
        }
    }

    /// Copy of one entity's record.
    pub fn get(&self, id: EntityId) -> Option<EntityRecord> {
        self.lock().get(&id).copied()
    }

    /// Current location of one entity.
    pub fn location(&self, id: EntityId) -> Option<EntityLocation> {
        self.get(id).map(|r| r.location)
    }

    /// Whether an entity is live.
    pub fn contains(&self, id: EntityId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of live entities (pending and assigned).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no live entities.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `(assigned, pending)` counts.
    pub fn counts(&self) -> (usize, usize) {
        let records = self.lock();
        let assigned = records
            .values()
            .filter(|r| matches!(r.location, EntityLocation::Assigned(_)))
            .count();
        (assigned, records.len() - assigned)
    }

    /// Ids of entities assigned to a Worker of `group`.
    pub fn assigned_in(&self, group: GroupId) -> Vec<EntityId> {
        self.lock()
            .iter()
            .filter(|(_, r)| matches!(r.location, EntityLocation::Assigned(w) if w.group == group))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Copy of the whole registry.
    pub fn snapshot(&self) -> Vec<(EntityId, EntityRecord)> {
        self.lock().iter().map(|(id, r)| (*id, *r)).collect()
    }
}

// Compile-time assertion: the registry is shared with non-Worker threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<SimulationRegistry>();
};
