//! The WorkGroupManager: owns every WorkGroup, the shared barriers, and
//! the Worker threads, and drives the simulation one base tick at a time.
//!
//! # Lifecycle
//!
//! ```text
//! Init ──new_work_group──▶ Create ──init_all_groups──▶ Barriers
//!      ──start_all_work_groups──▶ Started ──last tick──▶ Finished
//!                                    └──entity or leader failure──▶ Failed
//! ```
//!
//! Transitions are one-directional. Between `init_all_groups()` and
//! `start_all_work_groups()` each group's `init_workers()` must be called.
//!
//! # Driving the run
//!
//! Each call to [`wait_all_groups()`](WorkGroupManager::wait_all_groups)
//! runs one base tick. The five phase sub-calls may also be invoked one by
//! one, for callers that interleave their own work between phases; calling
//! them out of order is rejected with [`SchedulerError::PhaseOrder`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use convoy_core::{Entity, EntityId, GroupId, TickId};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ManagerConfig, WorkGroupConfig};
use crate::error::SchedulerError;
use crate::hooks::GroupServices;
use crate::metrics::{SchedulerMetrics, TickMetrics};
use crate::registry::{EntityLocation, EntityRecord, SimulationRegistry};
use crate::scheduler::{Phase, ScheduleRequest, SchedulerCore};
use crate::work_group::WorkGroup;
use crate::worker::run_worker_loop;

// ── ManagerState ────────────────────────────────────────────────

/// Where the manager is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// No WorkGroup registered yet.
    Init,
    /// At least one WorkGroup registered; more may be added.
    Create,
    /// Barrier participant counts are frozen.
    Barriers,
    /// Worker threads are running (or the manager drives them inline).
    Started,
    /// Every configured tick has run.
    Finished,
    /// The run was aborted by a failure.
    Failed,
}

// ── FinishReport ────────────────────────────────────────────────

/// Returned by [`WorkGroupManager::finish`].
#[derive(Debug)]
pub struct FinishReport {
    /// Base ticks that completed.
    pub ticks_completed: u64,
    /// Whether the run reached its last configured tick.
    pub completed: bool,
    /// Entities still alive at teardown, assigned ones first.
    pub entities: Vec<Box<dyn Entity>>,
    /// Cumulative counters.
    pub metrics: SchedulerMetrics,
    /// The first failure, if the run failed.
    pub failure: Option<SchedulerError>,
    /// Worker threads joined cleanly.
    pub threads_joined: usize,
    /// Worker threads that ended in a panic.
    pub thread_panics: usize,
}

// ── WorkGroupManager ────────────────────────────────────────────

/// Owner of every WorkGroup and driver of the base tick.
pub struct WorkGroupManager {
    config: ManagerConfig,
    state: ManagerState,
    groups: Vec<Arc<WorkGroup>>,
    registry: Arc<SimulationRegistry>,
    core: Option<Arc<SchedulerCore>>,
    threads: Vec<JoinHandle<()>>,
    tick: u64,
    cursor: Phase,
    tick_started: Instant,
    frame_us: u64,
    metrics: SchedulerMetrics,
    failure: Option<SchedulerError>,
    torn_down: bool,
}

impl WorkGroupManager {
    /// Create a manager with no WorkGroups.
    pub fn new(config: ManagerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        debug!(?config, "work group manager created");
        Ok(Self {
            config,
            state: ManagerState::Init,
            groups: Vec::new(),
            registry: Arc::new(SimulationRegistry::new()),
            core: None,
            threads: Vec::new(),
            tick: 0,
            cursor: Phase::FrameTick,
            tick_started: Instant::now(),
            frame_us: 0,
            metrics: SchedulerMetrics::default(),
            failure: None,
            torn_down: false,
        })
    }

    // ── Accessors ───────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// The configuration the manager was created with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Every registered WorkGroup, indexed by `GroupId`.
    pub fn work_groups(&self) -> &[Arc<WorkGroup>] {
        &self.groups
    }

    /// One WorkGroup by id.
    pub fn work_group(&self, id: GroupId) -> Option<&Arc<WorkGroup>> {
        self.groups.get(id.0 as usize)
    }

    /// Shared handle to the location of every live entity.
    pub fn registry(&self) -> Arc<SimulationRegistry> {
        Arc::clone(&self.registry)
    }

    /// Cumulative counters over the ticks run so far.
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// The next base tick to run.
    pub fn current_tick(&self) -> TickId {
        TickId(self.tick)
    }

    /// The phase the next sub-call must be.
    pub fn next_phase(&self) -> Phase {
        self.cursor
    }

    /// Length of the run in base ticks; 0 before `init_all_groups()`.
    pub fn run_ticks(&self) -> u64 {
        self.core.as_ref().map_or(0, |c| c.run_ticks)
    }

    /// Whether every configured tick has run.
    pub fn is_finished(&self) -> bool {
        self.state == ManagerState::Finished
    }

    /// The first failure, once the run has failed.
    pub fn failure(&self) -> Option<&SchedulerError> {
        self.failure.as_ref()
    }

    fn invalid(&self, operation: &'static str) -> SchedulerError {
        SchedulerError::InvalidState {
            operation,
            state: self.state,
        }
    }

    fn group_for_entities(&self, id: GroupId) -> Result<&Arc<WorkGroup>, SchedulerError> {
        let group = self
            .work_group(id)
            .ok_or(SchedulerError::UnknownGroup { group: id })?;
        if group.num_workers() == 0 {
            return Err(ConfigError::NoWorkersForEntities {
                group: id,
                entities: 1,
            }
            .into());
        }
        Ok(group)
    }

    // ── Setup ───────────────────────────────────────────────────

    /// Register a WorkGroup without hooks.
    pub fn new_work_group(&mut self, config: WorkGroupConfig) -> Result<Arc<WorkGroup>, SchedulerError> {
        self.new_work_group_with_services(config, GroupServices::none())
    }

    /// Register a WorkGroup with hooks. Only allowed before
    /// `init_all_groups()`.
    pub fn new_work_group_with_services(
        &mut self,
        config: WorkGroupConfig,
        services: GroupServices,
    ) -> Result<Arc<WorkGroup>, SchedulerError> {
        if !matches!(self.state, ManagerState::Init | ManagerState::Create) {
            return Err(self.invalid("new_work_group"));
        }
        config.validate()?;
        let id = GroupId(self.groups.len() as u32);
        let group = Arc::new(WorkGroup::new(
            id,
            config,
            services,
            Arc::clone(&self.registry),
            self.config.base_granularity_ms,
            self.config.stall,
        ));
        debug!(group = %id, workers = group.num_workers(), step = group.tick_step(), "work group registered");
        self.groups.push(Arc::clone(&group));
        self.state = ManagerState::Create;
        Ok(group)
    }

    /// Freeze the set of WorkGroups and size every barrier.
    pub fn init_all_groups(&mut self) -> Result<(), SchedulerError> {
        match self.state {
            ManagerState::Init => return Err(SchedulerError::NoWorkGroups),
            ManagerState::Create => {}
            _ => return Err(self.invalid("init_all_groups")),
        }
        for group in &self.groups {
            group.freeze(self.config.single_threaded)?;
        }
        let core = SchedulerCore::new(&self.config, self.groups.clone(), Arc::clone(&self.registry));
        info!(
            groups = self.groups.len(),
            workers = self.groups.iter().map(|g| g.num_workers()).sum::<usize>(),
            run_ticks = core.run_ticks,
            single_threaded = self.config.single_threaded,
            spatial_phase = core.has_spatial_barrier(),
            "work groups frozen"
        );
        self.core = Some(Arc::new(core));
        self.state = ManagerState::Barriers;
        Ok(())
    }

    /// Start one thread per Worker. In single-threaded mode no thread is
    /// spawned and `wait_all_groups()` runs every Worker inline.
    pub fn start_all_work_groups(&mut self) -> Result<(), SchedulerError> {
        if self.state != ManagerState::Barriers {
            return Err(self.invalid("start_all_work_groups"));
        }
        let core = match &self.core {
            Some(core) => Arc::clone(core),
            None => return Err(self.invalid("start_all_work_groups")),
        };
        if let Some(group) = self.groups.iter().find(|g| !g.workers_initialized()) {
            return Err(SchedulerError::WorkersNotInitialized { group: group.id() });
        }
        for group in &self.groups {
            group.mark_started();
        }
        self.state = ManagerState::Started;

        if !self.config.single_threaded {
            for (g, group) in self.groups.iter().enumerate() {
                for i in 0..group.num_workers() {
                    let worker_core = Arc::clone(&core);
                    let spawned = thread::Builder::new()
                        .name(format!("convoy-wg{g}-w{i}"))
                        .spawn(move || run_worker_loop(worker_core, g, i));
                    match spawned {
                        Ok(handle) => self.threads.push(handle),
                        Err(e) => {
                            let err = SchedulerError::ThreadSpawnFailed {
                                reason: format!("worker {g}:{i}: {e}"),
                            };
                            core.fail(err.clone());
                            self.failure = Some(err.clone());
                            self.state = ManagerState::Failed;
                            return Err(err);
                        }
                    }
                }
            }
        }
        info!(threads = self.threads.len(), "work groups started");
        Ok(())
    }

    // ── Tick driving ────────────────────────────────────────────

    /// Run one full base tick and return its counters.
    pub fn wait_all_groups(&mut self) -> Result<TickMetrics, SchedulerError> {
        if self.cursor != Phase::FrameTick && self.state == ManagerState::Started {
            return Err(SchedulerError::PhaseOrder {
                requested: Phase::FrameTick,
                expected: self.cursor,
            });
        }
        let mut completed = None;
        for phase in Phase::ALL {
            completed = self.run_phase(phase)?;
        }
        completed.ok_or(SchedulerError::PhaseOrder {
            requested: Phase::MacroTick,
            expected: self.cursor,
        })
    }

    /// Frame phase of the current tick.
    pub fn wait_frame_tick(&mut self) -> Result<(), SchedulerError> {
        self.run_phase(Phase::FrameTick).map(|_| ())
    }

    /// Flip phase, followed by cleanup.
    pub fn wait_flip_buffers(&mut self) -> Result<(), SchedulerError> {
        self.run_phase(Phase::FlipBuffers).map(|_| ())
    }

    /// Spatial index phase. A no-op when no group has a spatial hook.
    pub fn wait_spatial_index(&mut self) -> Result<(), SchedulerError> {
        self.run_phase(Phase::SpatialIndex).map(|_| ())
    }

    /// Message distribution phase.
    pub fn wait_distribute_messages(&mut self) -> Result<(), SchedulerError> {
        self.run_phase(Phase::DistributeMessages).map(|_| ())
    }

    /// Macro tick phase; completes the tick and returns its counters.
    pub fn wait_macro_tick(&mut self) -> Result<TickMetrics, SchedulerError> {
        self.run_phase(Phase::MacroTick)?
            .ok_or(SchedulerError::PhaseOrder {
                requested: Phase::MacroTick,
                expected: self.cursor,
            })
    }

    /// Run every remaining tick.
    pub fn run_to_completion(&mut self) -> Result<SchedulerMetrics, SchedulerError> {
        while self.state == ManagerState::Started {
            self.wait_all_groups()?;
        }
        match self.state {
            ManagerState::Finished => Ok(self.metrics.clone()),
            ManagerState::Failed => Err(self.stored_failure()),
            _ => Err(self.invalid("run_to_completion")),
        }
    }

    fn stored_failure(&self) -> SchedulerError {
        self.failure
            .clone()
            .unwrap_or(SchedulerError::Barrier(crate::BarrierError::Aborted))
    }

    fn run_phase(&mut self, phase: Phase) -> Result<Option<TickMetrics>, SchedulerError> {
        match self.state {
            ManagerState::Started => {}
            ManagerState::Finished => {
                return Err(SchedulerError::SimulationFinished { ticks: self.tick })
            }
            ManagerState::Failed => return Err(self.stored_failure()),
            _ => return Err(self.invalid("wait_all_groups")),
        }
        if phase != self.cursor {
            return Err(SchedulerError::PhaseOrder {
                requested: phase,
                expected: self.cursor,
            });
        }
        let core = match &self.core {
            Some(core) => Arc::clone(core),
            None => return Err(self.invalid("wait_all_groups")),
        };

        let now = core.timeslice(self.tick);
        if phase == Phase::FrameTick {
            self.tick_started = Instant::now();
        }
        if let Err(e) = core.manager_phase(phase, now) {
            // Prefer the error that caused the abort over the abort itself.
            let err = core.first_failure().unwrap_or(e);
            self.failure = Some(err.clone());
            self.state = ManagerState::Failed;
            warn!(tick = self.tick, ?phase, error = %err, "run aborted");
            return Err(err);
        }
        if phase == Phase::FrameTick {
            self.frame_us = self.tick_started.elapsed().as_micros() as u64;
        }
        self.cursor = phase.next();
        if phase != Phase::MacroTick {
            return Ok(None);
        }

        let tick = core.take_metrics(now.tick, self.frame_us);
        self.metrics.record(&tick);
        self.metrics.stall_events = core.stall_events();
        self.tick += 1;
        if self.tick >= core.run_ticks {
            self.state = ManagerState::Finished;
            info!(ticks = self.tick, "simulation finished");
        }
        Ok(Some(tick))
    }

    // ── Structural changes ──────────────────────────────────────

    /// Admit a new entity into `group`.
    ///
    /// Before the start the entity is placed right away. Once running it is
    /// registered as pending and staged by the next cleanup.
    pub fn schedule_entity(&self, group: GroupId, entity: Box<dyn Entity>) -> Result<(), SchedulerError> {
        match self.state {
            ManagerState::Barriers => self.group_for_entities(group)?.schedule_entity(entity),
            ManagerState::Started => {
                self.group_for_entities(group)?;
                self.registry.register(
                    entity.id(),
                    EntityRecord::new(
                        EntityLocation::Pending(group),
                        entity.start_time_ms(),
                        entity.is_non_spatial(),
                    ),
                )?;
                self.push_request(ScheduleRequest::Admit { group, entity });
                Ok(())
            }
            _ => Err(self.invalid("schedule_entity")),
        }
    }

    /// Remove an entity from the simulation.
    ///
    /// Once running the entity is not updated again; it is detached by the
    /// next cleanup. Called between ticks, this takes effect before the
    /// next frame phase.
    pub fn request_removal(&self, entity: EntityId) -> Result<(), SchedulerError> {
        match self.state {
            ManagerState::Barriers => match &self.core {
                Some(core) if core.remove_entity(entity) => Ok(()),
                _ => Err(SchedulerError::UnknownEntity { entity }),
            },
            ManagerState::Started => {
                if !self.registry.mark_removal(entity) {
                    return Err(SchedulerError::UnknownEntity { entity });
                }
                if let Some(core) = &self.core {
                    core.suspend_entity(entity);
                }
                self.push_request(ScheduleRequest::Remove(entity));
                Ok(())
            }
            ManagerState::Init | ManagerState::Create => Err(SchedulerError::UnknownEntity { entity }),
            _ => Err(self.invalid("request_removal")),
        }
    }

    /// Move an entity to another WorkGroup.
    pub fn request_migration(&self, entity: EntityId, to: GroupId) -> Result<(), SchedulerError> {
        if !matches!(self.state, ManagerState::Barriers | ManagerState::Started) {
            return Err(self.invalid("request_migration"));
        }
        self.group_for_entities(to)?;
        if !self.registry.contains(entity) {
            return Err(SchedulerError::UnknownEntity { entity });
        }
        match (&self.core, self.state) {
            (Some(core), ManagerState::Barriers) => {
                core.migrate_entity(entity, to, core.timeslice(0))?;
            }
            _ => self.push_request(ScheduleRequest::Migrate { entity, to }),
        }
        Ok(())
    }

    fn push_request(&self, request: ScheduleRequest) {
        if let Some(core) = &self.core {
            core.push_request(request);
        }
    }

    // ── Teardown ────────────────────────────────────────────────

    fn teardown(&mut self) -> (usize, usize) {
        if self.torn_down {
            return (0, 0);
        }
        self.torn_down = true;
        if let Some(core) = &self.core {
            if self.state == ManagerState::Started {
                info!(tick = self.tick, "aborting running work groups");
            }
            if self.state != ManagerState::Finished {
                core.abort_all();
            }
        }
        let mut joined = 0;
        let mut panics = 0;
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(()) => joined += 1,
                Err(_) => panics += 1,
            }
        }
        debug!(joined, panics, "worker threads joined");
        (joined, panics)
    }

    /// Stop every thread and hand back the surviving entities.
    pub fn finish(mut self) -> FinishReport {
        let (threads_joined, thread_panics) = self.teardown();
        let mut entities = Vec::new();
        for group in &self.groups {
            entities.extend(group.drain_entities());
        }
        FinishReport {
            ticks_completed: self.tick,
            completed: self.state == ManagerState::Finished,
            entities,
            metrics: std::mem::take(&mut self.metrics),
            failure: self.failure.take(),
            threads_joined,
            thread_panics,
        }
    }
}

impl Drop for WorkGroupManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for WorkGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroupManager")
            .field("state", &self.state)
            .field("groups", &self.groups.len())
            .field("tick", &self.tick)
            .field("threads", &self.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadParams;

    fn manager() -> WorkGroupManager {
        WorkGroupManager::new(ManagerConfig::default()).unwrap()
    }

    #[test]
    fn init_without_groups_fails() {
        let mut m = manager();
        match m.init_all_groups() {
            Err(SchedulerError::NoWorkGroups) => {}
            other => panic!("expected NoWorkGroups, got {other:?}"),
        }
    }

    #[test]
    fn new_work_group_after_init_is_rejected() {
        let mut m = manager();
        m.new_work_group(WorkGroupConfig::new(1, 5, 1)).unwrap();
        assert_eq!(m.state(), ManagerState::Create);
        m.init_all_groups().unwrap();
        assert_eq!(m.state(), ManagerState::Barriers);
        match m.new_work_group(WorkGroupConfig::new(1, 5, 1)) {
            Err(SchedulerError::InvalidState {
                state: ManagerState::Barriers,
                ..
            }) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
        match m.init_all_groups() {
            Err(SchedulerError::InvalidState { .. }) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn start_requires_initialized_workers() {
        let mut m = manager();
        m.new_work_group(WorkGroupConfig::new(1, 5, 1)).unwrap();
        m.init_all_groups().unwrap();
        match m.start_all_work_groups() {
            Err(SchedulerError::WorkersNotInitialized { group }) => assert_eq!(group, GroupId(0)),
            other => panic!("expected WorkersNotInitialized, got {other:?}"),
        }
    }

    #[test]
    fn wait_before_start_is_rejected() {
        let mut m = manager();
        m.new_work_group(WorkGroupConfig::new(1, 5, 1)).unwrap();
        match m.wait_all_groups() {
            Err(SchedulerError::InvalidState { .. }) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn phase_sub_calls_must_follow_order() {
        let mut m = WorkGroupManager::new(ManagerConfig {
            single_threaded: true,
            ..ManagerConfig::default()
        })
        .unwrap();
        let g = m.new_work_group(WorkGroupConfig::new(1, 3, 1)).unwrap();
        m.init_all_groups().unwrap();
        g.init_workers(LoadParams::empty()).unwrap();
        m.start_all_work_groups().unwrap();

        match m.wait_flip_buffers() {
            Err(SchedulerError::PhaseOrder {
                requested: Phase::FlipBuffers,
                expected: Phase::FrameTick,
            }) => {}
            other => panic!("expected PhaseOrder, got {other:?}"),
        }
        m.wait_frame_tick().unwrap();
        m.wait_flip_buffers().unwrap();
        m.wait_spatial_index().unwrap();
        m.wait_distribute_messages().unwrap();
        let tick = m.wait_macro_tick().unwrap();
        assert_eq!(tick.tick, TickId(0));
        assert_eq!(m.current_tick(), TickId(1));
    }

    #[test]
    fn finished_run_rejects_more_ticks() {
        let mut m = WorkGroupManager::new(ManagerConfig {
            single_threaded: true,
            ..ManagerConfig::default()
        })
        .unwrap();
        let g = m.new_work_group(WorkGroupConfig::new(1, 2, 1)).unwrap();
        m.init_all_groups().unwrap();
        g.init_workers(LoadParams::empty()).unwrap();
        m.start_all_work_groups().unwrap();
        let metrics = m.run_to_completion().unwrap();
        assert_eq!(metrics.ticks_completed, 2);
        assert!(m.is_finished());
        match m.wait_all_groups() {
            Err(SchedulerError::SimulationFinished { ticks: 2 }) => {}
            other => panic!("expected SimulationFinished, got {other:?}"),
        }
    }

    #[test]
    fn removal_of_unknown_entity_fails() {
        let mut m = manager();
        let g = m.new_work_group(WorkGroupConfig::new(1, 5, 1)).unwrap();
        m.init_all_groups().unwrap();
        g.init_workers(LoadParams::empty()).unwrap();
        match m.request_removal(EntityId(3)) {
            Err(SchedulerError::UnknownEntity { entity }) => assert_eq!(entity, EntityId(3)),
            other => panic!("expected UnknownEntity, got {other:?}"),
        }
    }

    #[test]
    fn drop_before_start_does_not_hang() {
        let mut m = manager();
        m.new_work_group(WorkGroupConfig::new(2, 5, 1)).unwrap();
        m.init_all_groups().unwrap();
        drop(m);
    }
}
