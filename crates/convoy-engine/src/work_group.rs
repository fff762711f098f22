//! WorkGroups: a pool of Workers ticking at a common step.
//!
//! A WorkGroup owns its Workers, a pending queue of entities that have not
//! started yet, the hooks it was created with, and a private macro barrier
//! that elects one of its own Workers to run the macro tick hook.
//!
//! # Activity
//!
//! A group is *active* at base tick `t` iff `t < total_ticks` and
//! `t % tick_step == 0`. Inactive Workers still take part in every shared
//! barrier of the tick, they just skip the per-entity work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use convoy_core::{Entity, EntityId, GroupId, TickId, WorkerId};
use tracing::{debug, info};

use crate::barrier::FlexiBarrier;
use crate::config::{AssignmentPolicy, ConfigError, StallConfig, WorkGroupConfig};
use crate::error::SchedulerError;
use crate::hooks::{GroupServices, HookContext};
use crate::loader::EntityLoader;
use crate::lock;
use crate::manager::ManagerState;
use crate::pending::PendingQueue;
use crate::registry::{EntityLocation, EntityRecord, SimulationRegistry};
use crate::worker::{EntitySlot, Worker};

struct LoaderState {
    loader: Option<Box<dyn EntityLoader>>,
    loaded_upto_ms: u64,
}

/// A pool of Workers sharing a tick step, a pending queue and hooks.
pub struct WorkGroup {
    id: GroupId,
    config: WorkGroupConfig,
    num_workers: usize,
    granularity_ms: u64,
    workers: OnceLock<Vec<Worker>>,
    pending: Mutex<PendingQueue>,
    next_worker: AtomicUsize,
    macro_barrier: FlexiBarrier,
    services: Mutex<GroupServices>,
    has_spatial_hook: bool,
    loader: Mutex<LoaderState>,
    registry: Arc<SimulationRegistry>,
    frozen: AtomicBool,
    started: AtomicBool,
}

// Compile-time assertion: groups are shared with every Worker thread.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<WorkGroup>();
};

impl WorkGroup {
    pub(crate) fn new(
        id: GroupId,
        config: WorkGroupConfig,
        services: GroupServices,
        registry: Arc<SimulationRegistry>,
        granularity_ms: u64,
        stall: Option<StallConfig>,
    ) -> Self {
        let num_workers = config.resolved_worker_count();
        let mut macro_barrier = FlexiBarrier::new(format!("wg{}-macro", id.0), num_workers);
        if let Some(stall) = stall {
            macro_barrier = macro_barrier.with_stall_detection(stall);
        }
        Self {
            id,
            num_workers,
            granularity_ms,
            workers: OnceLock::new(),
            pending: Mutex::new(PendingQueue::new()),
            next_worker: AtomicUsize::new(0),
            macro_barrier,
            has_spatial_hook: services.has_spatial_index(),
            services: Mutex::new(services),
            loader: Mutex::new(LoaderState {
                loader: None,
                loaded_upto_ms: 0,
            }),
            registry,
            frozen: AtomicBool::new(false),
            started: AtomicBool::new(false),
            config,
        }
    }

    // ── Accessors ───────────────────────────────────────────────

    /// This group's id.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// The configuration the group was created with.
    pub fn config(&self) -> &WorkGroupConfig {
        &self.config
    }

    /// Base ticks between activations.
    pub fn tick_step(&self) -> u64 {
        self.config.tick_step
    }

    /// Base ticks this group runs for.
    pub fn total_ticks(&self) -> u64 {
        self.config.total_ticks
    }

    /// Resolved worker count.
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Whether the group does per-entity work at `tick`.
    pub fn is_active(&self, tick: TickId) -> bool {
        tick.0 < self.config.total_ticks && tick.0 % self.config.tick_step == 0
    }

    /// The first tick after `after` at which the group is active.
    pub fn next_active_tick(&self, after: TickId) -> Option<TickId> {
        let step = self.config.tick_step;
        let next = (after.0 / step + 1).checked_mul(step)?;
        (next < self.config.total_ticks).then_some(TickId(next))
    }

    /// Whether `init_workers()` has run.
    pub fn workers_initialized(&self) -> bool {
        self.workers.get().is_some()
    }

    /// The group's Workers (empty before `init_workers()`).
    pub fn workers(&self) -> &[Worker] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// One Worker by index.
    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers().get(index)
    }

    /// Entities currently owned by each Worker.
    pub fn worker_loads(&self) -> Vec<usize> {
        self.workers().iter().map(Worker::entity_count).collect()
    }

    /// Entities on this group's Workers.
    pub fn entity_count(&self) -> usize {
        self.worker_loads().iter().sum()
    }

    /// Entities waiting in the pending queue.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub(crate) fn has_spatial_hook(&self) -> bool {
        self.has_spatial_hook
    }

    pub(crate) fn macro_barrier(&self) -> &FlexiBarrier {
        &self.macro_barrier
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Called by `init_all_groups()`: size the macro barrier and allow
    /// `init_workers()`.
    pub(crate) fn freeze(&self, single_threaded: bool) -> Result<(), SchedulerError> {
        let participants = if single_threaded { 1 } else { self.num_workers };
        self.macro_barrier.configure(participants)?;
        self.frozen.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    fn ensure_not_started(&self) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::Acquire) {
            return Err(SchedulerError::GroupStarted { group: self.id });
        }
        Ok(())
    }

    /// Create the Workers and load the initial entity set.
    ///
    /// Must be called after the manager's `init_all_groups()` and before
    /// `start_all_work_groups()`. Entities starting at time 0 are placed on
    /// Workers immediately; later ones wait in the pending queue. The loader
    /// stays attached and is polled for later windows during the run.
    pub fn init_workers(&self, loader: impl EntityLoader + 'static) -> Result<(), SchedulerError> {
        if !self.frozen.load(Ordering::Acquire) {
            return Err(SchedulerError::InvalidState {
                operation: "init_workers",
                state: ManagerState::Create,
            });
        }
        self.ensure_not_started()?;
        if self.workers_initialized() {
            return Err(SchedulerError::WorkersAlreadyInitialized { group: self.id });
        }

        let mut loader: Box<dyn EntityLoader> = Box::new(loader);
        let initial = loader.initial_entities();
        if self.num_workers == 0 && !initial.is_empty() {
            return Err(ConfigError::NoWorkersForEntities {
                group: self.id,
                entities: initial.len(),
            }
            .into());
        }

        let workers = (0..self.num_workers)
            .map(|i| Worker::new(WorkerId::new(self.id, i as u32)))
            .collect();
        if self.workers.set(workers).is_err() {
            return Err(SchedulerError::WorkersAlreadyInitialized { group: self.id });
        }

        let count = initial.len();
        for entity in initial {
            self.schedule_entity(entity)?;
        }
        *lock(&self.loader) = LoaderState {
            loader: Some(loader),
            loaded_upto_ms: 0,
        };
        info!(
            group = %self.id,
            workers = self.num_workers,
            entities = count,
            pending = self.pending_len(),
            "work group initialized"
        );
        Ok(())
    }

    /// Place an entity directly on a Worker chosen by the assignment policy.
    ///
    /// Only valid before the group starts; once running, admit entities
    /// through [`WorkGroupManager::schedule_entity`](crate::WorkGroupManager::schedule_entity).
    pub fn assign_a_worker(&self, entity: Box<dyn Entity>) -> Result<WorkerId, SchedulerError> {
        self.ensure_not_started()?;
        self.ensure_workers(1)?;
        let id = entity.id();
        let index = self.pick_worker();
        let worker_id = WorkerId::new(self.id, index as u32);
        self.registry.register(
            id,
            EntityRecord::new(
                EntityLocation::Assigned(worker_id),
                entity.start_time_ms(),
                entity.is_non_spatial(),
            ),
        )?;
        self.workers()[index].place(EntitySlot::new(entity));
        Ok(worker_id)
    }

    /// Admit an entity before the group starts: entities starting at time 0
    /// go straight to a Worker, the rest to the pending queue.
    pub fn schedule_entity(&self, entity: Box<dyn Entity>) -> Result<(), SchedulerError> {
        self.ensure_not_started()?;
        if entity.start_time_ms() == 0 {
            self.assign_a_worker(entity).map(|_| ())
        } else {
            self.enqueue(entity)
        }
    }

    fn ensure_workers(&self, entities: usize) -> Result<(), SchedulerError> {
        if !self.workers_initialized() {
            return Err(SchedulerError::WorkersNotInitialized { group: self.id });
        }
        if self.num_workers == 0 {
            return Err(ConfigError::NoWorkersForEntities {
                group: self.id,
                entities,
            }
            .into());
        }
        Ok(())
    }

    // ── Scheduler internals ─────────────────────────────────────

    /// Register an entity as pending in this group and queue it.
    pub(crate) fn enqueue(&self, entity: Box<dyn Entity>) -> Result<(), SchedulerError> {
        self.ensure_workers(1)?;
        self.registry.register(
            entity.id(),
            EntityRecord::new(
                EntityLocation::Pending(self.id),
                entity.start_time_ms(),
                entity.is_non_spatial(),
            ),
        )?;
        lock(&self.pending).push(entity);
        Ok(())
    }

    /// Queue an entity whose registry record already exists.
    pub(crate) fn push_pending(&self, entity: Box<dyn Entity>) {
        self.registry
            .relocate(entity.id(), EntityLocation::Pending(self.id));
        lock(&self.pending).push(entity);
    }

    pub(crate) fn take_pending(&self, id: EntityId) -> Option<Box<dyn Entity>> {
        lock(&self.pending).remove(id)
    }

    pub(crate) fn pop_due(&self, upto_ms: u64) -> Vec<Box<dyn Entity>> {
        lock(&self.pending).pop_due(upto_ms)
    }

    /// Place a slot on the Worker chosen by the policy and record it.
    pub(crate) fn place_slot(&self, slot: EntitySlot) -> Option<WorkerId> {
        if self.workers().is_empty() {
            return None;
        }
        let index = self.pick_worker();
        let worker = &self.workers()[index];
        let id = slot.id();
        worker.place(slot);
        self.registry
            .relocate(id, EntityLocation::Assigned(worker.id()));
        Some(worker.id())
    }

    fn pick_worker(&self) -> usize {
        let n = self.workers().len().max(1);
        match self.config.assignment {
            AssignmentPolicy::RoundRobin => self.next_worker.fetch_add(1, Ordering::Relaxed) % n,
            AssignmentPolicy::LeastLoaded => self
                .worker_loads()
                .iter()
                .enumerate()
                .min_by_key(|(i, load)| (**load, *i))
                .map(|(i, _)| i)
                .unwrap_or(0),
        }
    }

    /// Ask the loader for entities starting up to `to_ms`.
    pub(crate) fn poll_loader(&self, to_ms: u64) -> Vec<Box<dyn Entity>> {
        let mut state = lock(&self.loader);
        if to_ms <= state.loaded_upto_ms {
            return Vec::new();
        }
        let from_ms = state.loaded_upto_ms;
        state.loaded_upto_ms = to_ms;
        let loaded = match state.loader.as_mut() {
            Some(loader) => loader.load_window(from_ms, to_ms),
            None => Vec::new(),
        };
        if !loaded.is_empty() {
            debug!(group = %self.id, from_ms, to_ms, loaded = loaded.len(), "loader window");
        }
        loaded
    }

    /// Simulated milliseconds at the start of `tick`.
    pub(crate) fn tick_ms(&self, tick: TickId) -> u64 {
        tick.0.saturating_mul(self.granularity_ms)
    }

    pub(crate) fn run_spatial_hook(&self, ctx: &HookContext<'_>) {
        if let Some(hook) = lock(&self.services).spatial.as_mut() {
            hook.rebuild(ctx);
        }
    }

    pub(crate) fn run_partition_hook(&self, ctx: &HookContext<'_>) {
        if let Some(hook) = lock(&self.services).partition.as_mut() {
            hook.exchange(ctx);
        }
    }

    pub(crate) fn run_macro_hook(&self, ctx: &HookContext<'_>) {
        if let Some(hook) = lock(&self.services).macro_tick.as_mut() {
            hook.on_macro_tick(ctx);
        }
    }

    /// Take every entity out of the group: Workers first, then the pending
    /// queue.
    pub(crate) fn drain_entities(&self) -> Vec<Box<dyn Entity>> {
        let mut out = Vec::new();
        for worker in self.workers() {
            out.extend(worker.drain_entities());
        }
        out.extend(lock(&self.pending).drain_all());
        out
    }
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("id", &self.id)
            .field("num_workers", &self.num_workers)
            .field("tick_step", &self.config.tick_step)
            .field("total_ticks", &self.config.total_ticks)
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadParams;
    use convoy_core::{EntityError, TickContext, UpdateStatus};

    struct Stub(u64, u64);

    impl Entity for Stub {
        fn id(&self) -> EntityId {
            EntityId(self.0)
        }
        fn start_time_ms(&self) -> u64 {
            self.1
        }
        fn update(&mut self, _ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
            Ok(UpdateStatus::Continue)
        }
    }

    fn group(workers: usize, total: u64, step: u64) -> WorkGroup {
        WorkGroup::new(
            GroupId(0),
            WorkGroupConfig::new(workers, total, step),
            GroupServices::none(),
            Arc::new(SimulationRegistry::new()),
            10,
            None,
        )
    }

    #[test]
    fn activity_follows_step_and_total() {
        let g = group(1, 10, 3);
        let active: Vec<u64> = (0..12).filter(|&t| g.is_active(TickId(t))).collect();
        assert_eq!(active, vec![0, 3, 6, 9]);
        assert_eq!(g.next_active_tick(TickId(0)), Some(TickId(3)));
        assert_eq!(g.next_active_tick(TickId(4)), Some(TickId(6)));
        assert_eq!(g.next_active_tick(TickId(9)), None);
    }

    #[test]
    fn init_workers_requires_frozen_group() {
        let g = group(2, 10, 1);
        match g.init_workers(LoadParams::empty()) {
            Err(SchedulerError::InvalidState { .. }) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn init_workers_splits_due_and_future_entities() {
        let g = group(2, 10, 1);
        g.freeze(false).unwrap();
        let params = LoadParams::empty()
            .with(Box::new(Stub(1, 0)))
            .with(Box::new(Stub(2, 0)))
            .with(Box::new(Stub(3, 0)))
            .with(Box::new(Stub(4, 50)));
        g.init_workers(params).unwrap();
        assert_eq!(g.worker_loads(), vec![2, 1]);
        assert_eq!(g.pending_len(), 1);
        match g.init_workers(LoadParams::empty()) {
            Err(SchedulerError::WorkersAlreadyInitialized { .. }) => {}
            other => panic!("expected WorkersAlreadyInitialized, got {other:?}"),
        }
    }

    #[test]
    fn zero_workers_reject_entities() {
        let g = group(0, 10, 1);
        g.freeze(false).unwrap();
        match g.init_workers(LoadParams::empty().with(Box::new(Stub(1, 0)))) {
            Err(SchedulerError::Config(ConfigError::NoWorkersForEntities { entities: 1, .. })) => {}
            other => panic!("expected NoWorkersForEntities, got {other:?}"),
        }
        // A hook-only group without entities is fine.
        g.init_workers(LoadParams::empty()).unwrap();
    }

    #[test]
    fn least_loaded_fills_emptiest_worker() {
        let g = WorkGroup::new(
            GroupId(0),
            WorkGroupConfig::new(3, 10, 1).with_assignment(AssignmentPolicy::LeastLoaded),
            GroupServices::none(),
            Arc::new(SimulationRegistry::new()),
            10,
            None,
        );
        g.freeze(false).unwrap();
        g.init_workers(LoadParams::empty()).unwrap();
        g.workers()[0].place(EntitySlot::new(Box::new(Stub(10, 0))));
        g.workers()[0].place(EntitySlot::new(Box::new(Stub(11, 0))));
        g.workers()[2].place(EntitySlot::new(Box::new(Stub(12, 0))));
        let w = g.assign_a_worker(Box::new(Stub(1, 0))).unwrap();
        assert_eq!(w.index, 1);
        let w = g.assign_a_worker(Box::new(Stub(2, 0))).unwrap();
        assert_eq!(w.index, 1);
        let w = g.assign_a_worker(Box::new(Stub(3, 0))).unwrap();
        assert_eq!(w.index, 2);
    }

    #[test]
    fn assign_after_start_is_rejected() {
        let g = group(1, 10, 1);
        g.freeze(false).unwrap();
        g.init_workers(LoadParams::empty()).unwrap();
        g.mark_started();
        match g.assign_a_worker(Box::new(Stub(1, 0))) {
            Err(SchedulerError::GroupStarted { .. }) => {}
            other => panic!("expected GroupStarted, got {other:?}"),
        }
    }

    #[test]
    fn loader_windows_do_not_overlap() {
        let g = group(1, 10, 1);
        g.freeze(false).unwrap();
        g.init_workers(LoadParams::empty()).unwrap();
        assert!(g.poll_loader(10).is_empty());
        assert!(g.poll_loader(10).is_empty());
        assert_eq!(lock(&g.loader).loaded_upto_ms, 10);
    }
}
