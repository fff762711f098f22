//! Workers: the owners of entities and the units of parallelism.
//!
//! Each Worker owns a disjoint shard of its WorkGroup's entities together
//! with the [`BufferedDataManager`] that flips their subscriptions. In
//! threaded mode one OS thread per Worker runs `run_worker_loop` for the
//! whole simulation; in single-threaded mode the manager calls the same
//! phase functions from its own thread.
//!
//! The shard sits behind a `Mutex`, but the phase protocol guarantees that
//! only one thread touches a shard in any phase: its own thread during the
//! frame and flip phases, the elected leader during cleanup and message
//! distribution.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use convoy_core::{
    BufferedDataManager, Entity, EntityError, EntityId, Message, SubscriptionList, TickContext,
    Timeslice, UpdateStatus, WorkerId,
};
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::lock;
use crate::scheduler::SchedulerCore;

// ── EntitySlot ──────────────────────────────────────────────────

/// An entity plus the scheduler state that travels with it between Workers.
pub(crate) struct EntitySlot {
    pub(crate) entity: Box<dyn Entity>,
    subscriptions: SubscriptionList,
    initialized: bool,
    finished: bool,
    removed: bool,
    inbox: Vec<Message>,
}

impl EntitySlot {
    /// Wrap a freshly admitted entity. Its subscription list is read once,
    /// here.
    pub(crate) fn new(entity: Box<dyn Entity>) -> Self {
        let subscriptions = entity.subscriptions();
        Self {
            entity,
            subscriptions,
            initialized: false,
            finished: false,
            removed: false,
            inbox: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> EntityId {
        self.entity.id()
    }
}

// ── WorkerShard ─────────────────────────────────────────────────

#[derive(Default)]
struct WorkerShard {
    entities: IndexMap<EntityId, EntitySlot>,
    buffers: BufferedDataManager,
    outbox: Vec<Message>,
    spawned: Vec<Box<dyn Entity>>,
    finished: Vec<EntityId>,
}

impl WorkerShard {
    fn detach(&mut self, worker: WorkerId, id: EntityId) -> Option<EntitySlot> {
        let mut slot = self.entities.shift_remove(&id)?;
        self.buffers.stop_managing(&slot.subscriptions);
        slot.entity.on_worker_exit(worker);
        Some(slot)
    }
}

/// An entity failure observed during a frame phase.
#[derive(Debug)]
pub(crate) struct FrameFailure {
    pub(crate) entity: EntityId,
    pub(crate) error: EntityError,
}

// ── Worker ──────────────────────────────────────────────────────

/// Owner of a shard of a WorkGroup's entities.
pub struct Worker {
    id: WorkerId,
    shard: Mutex<WorkerShard>,
}

// Compile-time assertion: Workers are shared between their thread and the
// phase leaders.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Worker>();
};

impl Worker {
    pub(crate) fn new(id: WorkerId) -> Self {
        Self {
            id,
            shard: Mutex::new(WorkerShard::default()),
        }
    }

    fn shard(&self) -> MutexGuard<'_, WorkerShard> {
        lock(&self.shard)
    }

    /// This Worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Number of entities this Worker owns.
    pub fn entity_count(&self) -> usize {
        self.shard().entities.len()
    }

    /// Ids of the owned entities, in update order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.shard().entities.keys().copied().collect()
    }

    /// Number of buffered cells this Worker flips.
    pub fn managed_buffers(&self) -> usize {
        self.shard().buffers.len()
    }

    /// Take ownership of an entity.
    pub(crate) fn place(&self, mut slot: EntitySlot) {
        slot.entity.on_worker_enter(self.id);
        let mut shard = self.shard();
        shard.buffers.begin_managing(&slot.subscriptions);
        shard.entities.insert(slot.id(), slot);
    }

    /// Exclude an owned entity from every later frame phase. It stays here
    /// until cleanup detaches it. Returns whether the entity is owned.
    pub(crate) fn mark_removed(&self, id: EntityId) -> bool {
        match self.shard().entities.get_mut(&id) {
            Some(slot) => {
                slot.removed = true;
                true
            }
            None => false,
        }
    }

    /// Give up ownership of an entity.
    pub(crate) fn take(&self, id: EntityId) -> Option<EntitySlot> {
        self.shard().detach(self.id, id)
    }

    /// Frame phase: advance every owned entity that has started.
    ///
    /// Returns the number of `update()` calls. The first failing entity
    /// stops the phase for this Worker.
    pub(crate) fn perform_frame_tick(&self, now: Timeslice) -> Result<u64, FrameFailure> {
        let worker = self.id;
        let mut shard = self.shard();
        let WorkerShard {
            entities,
            outbox,
            spawned,
            finished,
            ..
        } = &mut *shard;

        let mut updated = 0u64;
        for (&id, slot) in entities.iter_mut() {
            if slot.finished || slot.removed || slot.entity.start_time_ms() > now.ms {
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| {
                for msg in slot.inbox.drain(..) {
                    slot.entity.on_message(msg);
                }
                let mut ctx = TickContext::new(now, worker, id, outbox, spawned);
                if !slot.initialized {
                    slot.entity.frame_init(&mut ctx)?;
                    slot.initialized = true;
                }
                slot.entity.update(&mut ctx)
            }))
            .unwrap_or_else(|payload| Err(EntityError::from_panic(payload.as_ref())));

            match result {
                Ok(UpdateStatus::Continue) => updated += 1,
                Ok(UpdateStatus::Done) => {
                    updated += 1;
                    slot.finished = true;
                    finished.push(id);
                }
                Err(error) => return Err(FrameFailure { entity: id, error }),
            }
        }
        trace!(worker = %worker, tick = %now.tick, updated, "frame tick");
        Ok(updated)
    }

    /// Flip phase: commit every staged write of every owned entity.
    /// Returns the number of cells that had a staged write.
    pub(crate) fn perform_flip(&self) -> usize {
        self.shard().buffers.flip_all()
    }

    /// Detach every entity whose `update()` returned `Done`.
    pub(crate) fn take_finished(&self) -> Vec<EntitySlot> {
        let mut shard = self.shard();
        let ids = std::mem::take(&mut shard.finished);
        ids.into_iter()
            .filter_map(|id| shard.detach(self.id, id))
            .collect()
    }

    /// Entities spawned through `TickContext::spawn` since the last call.
    pub(crate) fn take_spawned(&self) -> Vec<Box<dyn Entity>> {
        std::mem::take(&mut self.shard().spawned)
    }

    /// Messages sent since the last call.
    pub(crate) fn take_outbox(&self) -> Vec<Message> {
        std::mem::take(&mut self.shard().outbox)
    }

    /// Queue a message for an owned entity. Hands it back if the recipient
    /// is not here.
    pub(crate) fn deliver(&self, msg: Message) -> Result<(), Message> {
        match self.shard().entities.get_mut(&msg.to) {
            Some(slot) => {
                slot.inbox.push(msg);
                Ok(())
            }
            None => Err(msg),
        }
    }

    /// Remove every owned entity without calling back into it.
    pub(crate) fn drain_entities(&self) -> Vec<Box<dyn Entity>> {
        let mut shard = self.shard();
        shard.finished.clear();
        shard.outbox.clear();
        let mut out: Vec<Box<dyn Entity>> = shard
            .entities
            .drain(..)
            .map(|(_, slot)| slot.entity)
            .collect();
        out.append(&mut shard.spawned);
        shard.buffers = BufferedDataManager::new();
        out
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("entities", &self.entity_count())
            .finish()
    }
}

// ── Thread loop ─────────────────────────────────────────────────

/// Body of a Worker thread: one pass through the phase protocol per base
/// tick until the run ends or a barrier is aborted.
pub(crate) fn run_worker_loop(core: Arc<SchedulerCore>, group: usize, index: usize) {
    let Some(work_group) = core.groups.get(group).cloned() else {
        return;
    };
    let Some(worker) = work_group.worker(index) else {
        return;
    };
    for t in 0..core.run_ticks {
        let now = core.timeslice(t);
        if let Err(e) = core.run_worker_tick(&work_group, worker, now) {
            debug!(worker = %worker.id(), tick = t, error = %e, "worker leaving phase loop");
            return;
        }
    }
    debug!(worker = %worker.id(), "worker finished all ticks");
}
