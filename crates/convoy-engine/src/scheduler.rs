//! The per-tick phase protocol shared by Worker threads and the manager.
//!
//! Every base tick opens at the start gate and then runs the same five
//! phases, each closed by a shared barrier that every Worker thread and the
//! manager arrive at:
//!
//! ```text
//! B_start ──▶ Frame ──B_frame──▶ Flip ──B_flip──▶ [B_spatial] ──B_msg──B_msg──▶ Macro ──B_macro──▶
//!                                  leader: cleanup   leader:        leader:        group leader:
//!                                                    spatial hooks  delivery,      macro hook
//!                                                                   partition
//! ```
//!
//! The thread whose arrival completes a barrier is its leader. Leader work
//! runs after the others have been released and before the leader arrives
//! at the next shared barrier, so it is exclusive: the others are parked at
//! that barrier and cannot touch any shard. The message barrier is passed
//! twice because group macro leaders run on their own group barriers, which
//! would otherwise not wait for delivery.
//!
//! Workers only leave the start gate when the manager begins the next
//! tick, so structural requests made between ticks are seen by that
//! tick's frame phase.
//!
//! Failure handling: `SchedulerCore::fail` records the first error,
//! aborts every barrier, and every thread leaves its loop on the next
//! arrival.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use convoy_core::{Entity, EntityId, GroupId, Message, TickId, Timeslice, WorkerId};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, trace, warn};

use crate::barrier::{BarrierError, BarrierWaitResult, FlexiBarrier};
use crate::config::{ConfigError, ManagerConfig};
use crate::error::SchedulerError;
use crate::hooks::HookContext;
use crate::lock;
use crate::metrics::TickMetrics;
use crate::registry::{EntityLocation, SimulationRegistry};
use crate::work_group::WorkGroup;
use crate::worker::{EntitySlot, Worker};

// ── Phase ───────────────────────────────────────────────────────

/// The phases of one base tick, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Active Workers call `update()` on their started entities.
    FrameTick,
    /// Active Workers commit staged writes; the leader runs cleanup.
    FlipBuffers,
    /// The leader rebuilds spatial indexes of active groups.
    SpatialIndex,
    /// The leader delivers messages and runs partition hooks.
    DistributeMessages,
    /// Each active group's leader runs its macro tick hook.
    MacroTick,
}

impl Phase {
    /// The five phases in order.
    pub const ALL: [Phase; 5] = [
        Phase::FrameTick,
        Phase::FlipBuffers,
        Phase::SpatialIndex,
        Phase::DistributeMessages,
        Phase::MacroTick,
    ];

    /// The phase that follows this one; `MacroTick` wraps to `FrameTick`.
    pub fn next(self) -> Phase {
        match self {
            Phase::FrameTick => Phase::FlipBuffers,
            Phase::FlipBuffers => Phase::SpatialIndex,
            Phase::SpatialIndex => Phase::DistributeMessages,
            Phase::DistributeMessages => Phase::MacroTick,
            Phase::MacroTick => Phase::FrameTick,
        }
    }
}

// ── Requests ────────────────────────────────────────────────────

/// Structural change queued by the manager while Workers are running and
/// applied by the next cleanup leader.
pub(crate) enum ScheduleRequest {
    Remove(EntityId),
    Migrate { entity: EntityId, to: GroupId },
    Admit { group: GroupId, entity: Box<dyn Entity> },
}

// ── SchedulerCore ───────────────────────────────────────────────

/// State shared by every thread taking part in the phase protocol.
pub(crate) struct SchedulerCore {
    pub(crate) groups: Vec<Arc<WorkGroup>>,
    pub(crate) registry: Arc<SimulationRegistry>,
    pub(crate) run_ticks: u64,
    pub(crate) single_threaded: bool,
    granularity_ms: u64,
    start: FlexiBarrier,
    frame: FlexiBarrier,
    flip: FlexiBarrier,
    spatial: Option<FlexiBarrier>,
    message: FlexiBarrier,
    macro_tick: FlexiBarrier,
    requests: Mutex<Vec<ScheduleRequest>>,
    metrics: [Mutex<TickMetrics>; 2],
    aborted: AtomicBool,
    failure_tx: Sender<SchedulerError>,
    failure_rx: Receiver<SchedulerError>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<SchedulerCore>();
};

impl SchedulerCore {
    /// Build the core once every group is known. Shared barriers get one
    /// participant per Worker plus the manager, or one in single-threaded
    /// mode.
    pub(crate) fn new(
        config: &ManagerConfig,
        groups: Vec<Arc<WorkGroup>>,
        registry: Arc<SimulationRegistry>,
    ) -> Self {
        let participants = if config.single_threaded {
            1
        } else {
            groups.iter().map(|g| g.num_workers()).sum::<usize>() + 1
        };
        let barrier = |name: &str| {
            let b = FlexiBarrier::new(name, participants);
            match config.stall {
                Some(stall) => b.with_stall_detection(stall),
                None => b,
            }
        };
        let spatial = groups
            .iter()
            .any(|g| g.has_spatial_hook())
            .then(|| barrier("spatial"));
        let run_ticks = groups.iter().map(|g| g.total_ticks()).max().unwrap_or(0);
        let (failure_tx, failure_rx) = crossbeam_channel::unbounded();
        Self {
            run_ticks,
            single_threaded: config.single_threaded,
            granularity_ms: config.base_granularity_ms,
            start: barrier("start"),
            frame: barrier("frame"),
            flip: barrier("flip"),
            spatial,
            message: barrier("message"),
            macro_tick: barrier("macro"),
            requests: Mutex::new(Vec::new()),
            metrics: Default::default(),
            aborted: AtomicBool::new(false),
            failure_tx,
            failure_rx,
            groups,
            registry,
        }
    }

    pub(crate) fn timeslice(&self, tick: u64) -> Timeslice {
        Timeslice::new(TickId(tick), self.granularity_ms)
    }

    pub(crate) fn has_spatial_barrier(&self) -> bool {
        self.spatial.is_some()
    }

    fn group(&self, id: GroupId) -> Option<&Arc<WorkGroup>> {
        self.groups.get(id.0 as usize)
    }

    fn worker(&self, id: WorkerId) -> Option<&Worker> {
        self.group(id.group)?.worker(id.index as usize)
    }

    fn hook_context(&self, group: &WorkGroup, now: Timeslice) -> HookContext<'_> {
        HookContext {
            group: group.id(),
            now,
            registry: &self.registry,
        }
    }

    fn shared_barrier(&self, phase: Phase) -> Option<&FlexiBarrier> {
        match phase {
            Phase::FrameTick => Some(&self.frame),
            Phase::FlipBuffers => Some(&self.flip),
            Phase::SpatialIndex => self.spatial.as_ref(),
            Phase::DistributeMessages => Some(&self.message),
            Phase::MacroTick => Some(&self.macro_tick),
        }
    }

    /// The start gate followed by every shared phase barrier.
    fn shared_barriers(&self) -> impl Iterator<Item = &FlexiBarrier> {
        std::iter::once(&self.start)
            .chain(Phase::ALL.into_iter().filter_map(|p| self.shared_barrier(p)))
    }

    // ── Failure ─────────────────────────────────────────────────

    /// Record a fatal error and release every thread blocked on any barrier.
    pub(crate) fn fail(&self, err: SchedulerError) {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.failure_tx.send(err.clone());
        if !self.aborted.swap(true, Ordering::AcqRel) {
            error!(error = %err, "simulation failed, aborting all work groups");
        }
        self.abort_all();
    }

    pub(crate) fn abort_all(&self) {
        self.aborted.store(true, Ordering::Release);
        for b in self.shared_barriers() {
            b.abort();
        }
        for group in &self.groups {
            group.macro_barrier().abort();
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The first recorded failure, if any.
    pub(crate) fn first_failure(&self) -> Option<SchedulerError> {
        self.failure_rx.try_recv().ok()
    }

    /// Total stall warnings raised by any barrier.
    pub(crate) fn stall_events(&self) -> u64 {
        let shared: u64 = self.shared_barriers().map(FlexiBarrier::stall_events).sum();
        shared
            + self
                .groups
                .iter()
                .map(|g| g.macro_barrier().stall_events())
                .sum::<u64>()
    }

    // ── Barrier plumbing ────────────────────────────────────────

    fn arrive(&self, barrier: &FlexiBarrier) -> Result<BarrierWaitResult, SchedulerError> {
        barrier.wait().map_err(|e| {
            match e {
                BarrierError::Stalled { .. } => self.fail(SchedulerError::Barrier(e.clone())),
                _ => self.abort_all(),
            }
            SchedulerError::Barrier(e)
        })
    }

    /// Run leader work, turning both errors and panics into a failure.
    fn lead<F>(&self, phase: Phase, work: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> Result<(), SchedulerError>,
    {
        let err = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(payload) => SchedulerError::LeaderPanicked {
                phase,
                message: panic_message(payload.as_ref()),
            },
        };
        self.fail(err.clone());
        Err(err)
    }

    /// Arrive at the shared barrier closing `phase` and, if elected, run
    /// that phase's leader work.
    fn close_phase(&self, phase: Phase, now: Timeslice) -> Result<(), SchedulerError> {
        let Some(barrier) = self.shared_barrier(phase) else {
            return Ok(());
        };
        if self.arrive(barrier)?.is_leader() {
            match phase {
                Phase::FlipBuffers => self.lead(phase, || self.cleanup(now))?,
                Phase::SpatialIndex => self.lead(phase, || {
                    self.rebuild_spatial(now);
                    Ok(())
                })?,
                Phase::DistributeMessages => self.lead(phase, || {
                    self.distribute_messages(now);
                    Ok(())
                })?,
                Phase::FrameTick | Phase::MacroTick => {}
            }
        }
        if phase == Phase::DistributeMessages {
            // Macro hooks must not start before delivery and partition hooks end.
            self.arrive(barrier)?;
        }
        Ok(())
    }

    // ── Per-Worker phase bodies ─────────────────────────────────

    fn frame_step(&self, group: &WorkGroup, worker: &Worker, now: Timeslice) -> Result<(), SchedulerError> {
        match worker.perform_frame_tick(now) {
            Ok(updated) => {
                lock(self.metrics_slot(now.tick)).entities_updated += updated;
                Ok(())
            }
            Err(failure) => {
                let err = SchedulerError::EntityFailed {
                    entity: failure.entity,
                    worker: worker.id(),
                    tick: now.tick,
                    source: failure.error,
                };
                debug!(group = %group.id(), worker = %worker.id(), "frame phase failed");
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    fn flip_step(&self, worker: &Worker, now: Timeslice) {
        let flipped = worker.perform_flip() as u64;
        lock(self.metrics_slot(now.tick)).buffers_flipped += flipped;
    }

    fn group_macro(&self, group: &WorkGroup, now: Timeslice) -> Result<(), SchedulerError> {
        if group.num_workers() == 0 {
            // Zero-worker groups are handled by the message leader.
            return Ok(());
        }
        if self.arrive(group.macro_barrier())?.is_leader() {
            self.lead(Phase::MacroTick, || {
                group.run_macro_hook(&self.hook_context(group, now));
                Ok(())
            })?;
        }
        Ok(())
    }

    /// One base tick as seen by a Worker thread.
    pub(crate) fn run_worker_tick(
        &self,
        group: &WorkGroup,
        worker: &Worker,
        now: Timeslice,
    ) -> Result<(), SchedulerError> {
        self.arrive(&self.start)?;
        let active = group.is_active(now.tick);
        if active {
            self.frame_step(group, worker, now)?;
        }
        self.close_phase(Phase::FrameTick, now)?;

        if active {
            self.flip_step(worker, now);
        }
        self.close_phase(Phase::FlipBuffers, now)?;
        self.close_phase(Phase::SpatialIndex, now)?;
        self.close_phase(Phase::DistributeMessages, now)?;

        if active {
            self.group_macro(group, now)?;
        }
        self.close_phase(Phase::MacroTick, now)
    }

    /// One phase as seen by the manager. In single-threaded mode the
    /// manager also does every Worker's share of the phase itself.
    pub(crate) fn manager_phase(&self, phase: Phase, now: Timeslice) -> Result<(), SchedulerError> {
        if phase == Phase::FrameTick {
            self.arrive(&self.start)?;
        }
        if self.single_threaded {
            for group in self.groups.iter().filter(|g| g.is_active(now.tick)) {
                match phase {
                    Phase::FrameTick => {
                        for worker in group.workers() {
                            self.frame_step(group, worker, now)?;
                        }
                    }
                    Phase::FlipBuffers => {
                        for worker in group.workers() {
                            self.flip_step(worker, now);
                        }
                    }
                    Phase::MacroTick => self.group_macro(group, now)?,
                    Phase::SpatialIndex | Phase::DistributeMessages => {}
                }
            }
        }
        self.close_phase(phase, now)
    }

    // ── Leader work ─────────────────────────────────────────────

    /// Flip leader: retire finished entities, admit spawned and queued
    /// ones, apply removal and migration requests, and stage every pending
    /// entity due by each group's next active tick.
    fn cleanup(&self, now: Timeslice) -> Result<(), SchedulerError> {
        let mut removed = 0u64;
        let mut migrated = 0u64;
        let mut admitted = 0u64;

        for group in &self.groups {
            for worker in group.workers() {
                for slot in worker.take_finished() {
                    self.registry.unregister(slot.id());
                    trace!(entity = %slot.id(), worker = %worker.id(), "entity done");
                    removed += 1;
                }
                for entity in worker.take_spawned() {
                    group.enqueue(entity)?;
                }
            }
        }

        let requests = std::mem::take(&mut *lock(&self.requests));
        for request in requests {
            match request {
                ScheduleRequest::Remove(id) => {
                    if self.remove_entity(id) {
                        removed += 1;
                    }
                }
                ScheduleRequest::Migrate { entity, to } => {
                    if self.migrate_entity(entity, to, now)? {
                        migrated += 1;
                    }
                }
                ScheduleRequest::Admit { group, entity } => {
                    let target = self
                        .group(group)
                        .ok_or(SchedulerError::UnknownGroup { group })?;
                    target.push_pending(entity);
                }
            }
        }

        for group in &self.groups {
            let Some(next) = group.next_active_tick(now.tick) else {
                continue;
            };
            let next_ms = group.tick_ms(next);
            for entity in group.poll_loader(next_ms) {
                group.enqueue(entity)?;
            }
            for entity in group.pop_due(next_ms) {
                self.place(group, EntitySlot::new(entity))?;
                admitted += 1;
            }
        }

        let mut m = lock(self.metrics_slot(now.tick));
        m.removed += removed;
        m.migrated += migrated;
        m.admitted += admitted;
        drop(m);
        if removed + migrated + admitted > 0 {
            debug!(tick = %now.tick, admitted, removed, migrated, "cleanup");
        }
        Ok(())
    }

    fn place(&self, group: &WorkGroup, slot: EntitySlot) -> Result<WorkerId, SchedulerError> {
        group.place_slot(slot).ok_or_else(|| {
            ConfigError::NoWorkersForEntities {
                group: group.id(),
                entities: 1,
            }
            .into()
        })
    }

    /// Drop an entity wherever it is. Returns whether it was found.
    pub(crate) fn remove_entity(&self, id: EntityId) -> bool {
        let Some(location) = self.registry.location(id) else {
            return false;
        };
        match location {
            EntityLocation::Assigned(w) => {
                if let Some(worker) = self.worker(w) {
                    worker.take(id);
                }
            }
            EntityLocation::Pending(g) => {
                if let Some(group) = self.group(g) {
                    group.take_pending(id);
                }
            }
        }
        self.registry.unregister(id);
        debug!(entity = %id, "entity removed");
        true
    }

    /// Stop a live entity from being updated again. Returns whether it is
    /// on a Worker.
    pub(crate) fn suspend_entity(&self, id: EntityId) -> bool {
        match self.registry.location(id) {
            Some(EntityLocation::Assigned(w)) => self
                .worker(w)
                .is_some_and(|worker| worker.mark_removed(id)),
            _ => false,
        }
    }

    /// Move an entity to another group. A started entity goes straight to
    /// one of the target's Workers; one that has not started yet waits in
    /// the target's pending queue.
    pub(crate) fn migrate_entity(
        &self,
        id: EntityId,
        to: GroupId,
        now: Timeslice,
    ) -> Result<bool, SchedulerError> {
        let target = self.group(to).ok_or(SchedulerError::UnknownGroup { group: to })?;
        let Some(location) = self.registry.location(id) else {
            warn!(entity = %id, "migration of unknown entity skipped");
            return Ok(false);
        };
        if location.group() == to {
            return Ok(false);
        }
        match location {
            EntityLocation::Assigned(w) => {
                let Some(slot) = self.worker(w).and_then(|worker| worker.take(id)) else {
                    return Ok(false);
                };
                if slot.entity.start_time_ms() <= now.ms {
                    self.place(target, slot)?;
                } else {
                    target.push_pending(slot.entity);
                }
            }
            EntityLocation::Pending(g) => {
                let Some(entity) = self.group(g).and_then(|group| group.take_pending(id)) else {
                    return Ok(false);
                };
                target.push_pending(entity);
            }
        }
        debug!(entity = %id, from = %location.group(), to = %to, "entity migrated");
        Ok(true)
    }

    fn rebuild_spatial(&self, now: Timeslice) {
        for group in &self.groups {
            if group.is_active(now.tick) && group.has_spatial_hook() {
                group.run_spatial_hook(&self.hook_context(group, now));
            }
        }
    }

    /// Message leader: deliver every outbox in `(sent_at, from, seq)` order,
    /// then run partition hooks and the macro hooks of zero-worker groups.
    fn distribute_messages(&self, now: Timeslice) {
        let mut mail: Vec<Message> = self
            .groups
            .iter()
            .flat_map(|g| g.workers())
            .flat_map(Worker::take_outbox)
            .collect();
        mail.sort_by_key(Message::order_key);

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        if !mail.is_empty() {
            // Lock order: registry before any shard.
            let records = self.registry.lock();
            for msg in mail {
                let worker = match records.get(&msg.to).map(|r| r.location) {
                    Some(EntityLocation::Assigned(w)) => self.worker(w),
                    _ => None,
                };
                match worker.map(|w| w.deliver(msg)) {
                    Some(Ok(())) => delivered += 1,
                    _ => dropped += 1,
                }
            }
        }
        if dropped > 0 {
            warn!(tick = %now.tick, dropped, "messages to absent entities dropped");
        }
        let mut m = lock(self.metrics_slot(now.tick));
        m.messages_delivered += delivered;
        m.messages_dropped += dropped;
        drop(m);

        for group in self.groups.iter().filter(|g| g.is_active(now.tick)) {
            group.run_partition_hook(&self.hook_context(group, now));
        }
        for group in self.groups.iter().filter(|g| g.is_active(now.tick)) {
            if group.num_workers() == 0 {
                group.run_macro_hook(&self.hook_context(group, now));
            }
        }
    }

    // ── Requests and metrics ────────────────────────────────────

    pub(crate) fn push_request(&self, request: ScheduleRequest) {
        lock(&self.requests).push(request);
    }

    fn metrics_slot(&self, tick: TickId) -> &Mutex<TickMetrics> {
        &self.metrics[(tick.0 % 2) as usize]
    }

    /// Collect the finished tick's counters. Called by the manager after
    /// the macro barrier, when no thread can still write this slot.
    pub(crate) fn take_metrics(&self, tick: TickId, frame_us: u64) -> TickMetrics {
        let mut m = std::mem::take(&mut *lock(self.metrics_slot(tick)));
        let (live, pending) = self.registry.counts();
        m.tick = tick;
        m.frame_us = frame_us;
        m.active_groups = self.groups.iter().filter(|g| g.is_active(tick)).count() as u32;
        m.live_entities = live as u64;
        m.pending_entities = pending as u64;
        m
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
