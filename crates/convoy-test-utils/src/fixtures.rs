//! Reusable entity fixtures.
//!
//! - [`AddTickDivisibleAgent`]: sums the tick index on divisible ticks.
//! - [`CountingEntity`]: records every tick it ran and every Worker it
//!   visited.
//! - [`WriterEntity`] / [`ReaderEntity`]: publish and observe a buffered
//!   value, for flip-consistency checks.
//! - [`FailingEntity`] / [`PanickingEntity`]: fail deterministically at a
//!   given tick.
//! - [`RandomWalker`]: seeded random workload reading its neighbours.
//! - [`ChattyEntity`]: sends a message to each peer every tick.
//! - [`SpawningEntity`]: hands a child entity to the scheduler at a tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use convoy_core::{
    Buffered, BufferedBase, Entity, EntityError, EntityId, Message, SubscriptionList, TickContext,
    UpdateStatus, WorkerId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn cells(cell: &Arc<impl BufferedBase + 'static>) -> SubscriptionList {
    let mut list = SubscriptionList::new();
    list.push(Arc::clone(cell) as Arc<dyn BufferedBase>);
    list
}

/// Shared, lock-protected log readable after the run.
pub type Log<T> = Arc<Mutex<Vec<T>>>;

/// Snapshot of a [`Log`].
pub fn read_log<T: Clone>(log: &Log<T>) -> Vec<T> {
    log.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn push<T>(log: &Log<T>, value: T) {
    log.lock().unwrap_or_else(PoisonError::into_inner).push(value);
}

// ── AddTickDivisibleAgent ───────────────────────────────────────

/// Adds the tick index to a buffered total whenever it is divisible by
/// `divisor`.
pub struct AddTickDivisibleAgent {
    pub id: EntityId,
    pub divisor: u64,
    pub total: Arc<Buffered<u64>>,
}

impl AddTickDivisibleAgent {
    pub fn new(id: u64, divisor: u64) -> Self {
        Self {
            id: EntityId(id),
            divisor: divisor.max(1),
            total: Buffered::shared(0),
        }
    }

    /// Handle to the committed total.
    pub fn total(&self) -> Arc<Buffered<u64>> {
        Arc::clone(&self.total)
    }

    /// Expected total after `ticks` base ticks: the sum of every multiple
    /// of `divisor` below `ticks`.
    pub fn expected(divisor: u64, ticks: u64) -> u64 {
        if ticks == 0 {
            return 0;
        }
        let m = (ticks - 1) / divisor;
        divisor * m * (m + 1) / 2
    }
}

impl Entity for AddTickDivisibleAgent {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        let tick = ctx.now().tick.0;
        if tick % self.divisor == 0 {
            self.total.set(self.total.get() + tick);
        }
        Ok(UpdateStatus::Continue)
    }

    fn subscriptions(&self) -> SubscriptionList {
        cells(&self.total)
    }
}

// ── CountingEntity ──────────────────────────────────────────────

/// Records the ticks it was updated at and the Workers it entered.
pub struct CountingEntity {
    pub id: EntityId,
    pub start_ms: u64,
    /// Return `Done` after this many updates.
    pub done_after: Option<u64>,
    pub inits: Arc<AtomicU64>,
    pub ticks: Log<u64>,
    pub workers: Log<WorkerId>,
    pub exits: Log<WorkerId>,
    pub non_spatial: bool,
}

impl CountingEntity {
    pub fn new(id: u64, start_ms: u64) -> Self {
        Self {
            id: EntityId(id),
            start_ms,
            done_after: None,
            inits: Arc::new(AtomicU64::new(0)),
            ticks: Log::default(),
            workers: Log::default(),
            exits: Log::default(),
            non_spatial: false,
        }
    }

    pub fn done_after(mut self, updates: u64) -> Self {
        self.done_after = Some(updates);
        self
    }

    pub fn non_spatial(mut self) -> Self {
        self.non_spatial = true;
        self
    }

    /// Cloned handles to the logs: `(ticks, workers entered, workers left)`.
    pub fn logs(&self) -> (Log<u64>, Log<WorkerId>, Log<WorkerId>) {
        (
            Arc::clone(&self.ticks),
            Arc::clone(&self.workers),
            Arc::clone(&self.exits),
        )
    }
}

impl Entity for CountingEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        self.start_ms
    }

    fn is_non_spatial(&self) -> bool {
        self.non_spatial
    }

    fn frame_init(&mut self, _ctx: &mut TickContext<'_>) -> Result<(), EntityError> {
        self.inits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        push(&self.ticks, ctx.now().tick.0);
        let calls = self.ticks.lock().unwrap_or_else(PoisonError::into_inner).len() as u64;
        match self.done_after {
            Some(limit) if calls >= limit => Ok(UpdateStatus::Done),
            _ => Ok(UpdateStatus::Continue),
        }
    }

    fn on_worker_enter(&mut self, worker: WorkerId) {
        push(&self.workers, worker);
    }

    fn on_worker_exit(&mut self, worker: WorkerId) {
        push(&self.exits, worker);
    }
}

// ── WriterEntity / ReaderEntity ─────────────────────────────────

/// Publishes the current tick index into a buffered cell every tick.
pub struct WriterEntity {
    pub id: EntityId,
    pub cell: Arc<Buffered<Option<u64>>>,
}

impl WriterEntity {
    pub fn new(id: u64) -> Self {
        Self {
            id: EntityId(id),
            cell: Buffered::shared(None),
        }
    }
}

impl Entity for WriterEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        let tick = ctx.now().tick.0;
        self.cell.set(Some(tick));
        // A writer must keep reading its own committed value until the flip.
        if self.cell.get() == Some(tick) {
            return Err(EntityError::update("staged write visible before flip"));
        }
        Ok(UpdateStatus::Continue)
    }

    fn subscriptions(&self) -> SubscriptionList {
        cells(&self.cell)
    }
}

/// One observation made by a [`ReaderEntity`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub tick: u64,
    pub writer: usize,
    pub seen: Option<u64>,
}

/// Reads every writer's cell each tick and logs what it saw.
pub struct ReaderEntity {
    pub id: EntityId,
    pub writers: Vec<Arc<Buffered<Option<u64>>>>,
    pub seen: Log<Observation>,
}

impl ReaderEntity {
    pub fn new(id: u64, writers: Vec<Arc<Buffered<Option<u64>>>>, seen: Log<Observation>) -> Self {
        Self {
            id: EntityId(id),
            writers,
            seen,
        }
    }
}

impl Entity for ReaderEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        let tick = ctx.now().tick.0;
        for (writer, cell) in self.writers.iter().enumerate() {
            push(
                &self.seen,
                Observation {
                    tick,
                    writer,
                    seen: cell.get(),
                },
            );
        }
        Ok(UpdateStatus::Continue)
    }
}

// ── FailingEntity / PanickingEntity ─────────────────────────────

/// Returns an error from `update()` at `fail_at_tick`.
pub struct FailingEntity {
    pub id: EntityId,
    pub fail_at_tick: u64,
}

impl FailingEntity {
    pub fn new(id: u64, fail_at_tick: u64) -> Self {
        Self {
            id: EntityId(id),
            fail_at_tick,
        }
    }
}

impl Entity for FailingEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        if ctx.now().tick.0 == self.fail_at_tick {
            return Err(EntityError::update(format!(
                "scripted failure at tick {}",
                self.fail_at_tick
            )));
        }
        Ok(UpdateStatus::Continue)
    }
}

/// Panics inside `update()` at `panic_at_tick`.
pub struct PanickingEntity {
    pub id: EntityId,
    pub panic_at_tick: u64,
}

impl PanickingEntity {
    pub fn new(id: u64, panic_at_tick: u64) -> Self {
        Self {
            id: EntityId(id),
            panic_at_tick,
        }
    }
}

impl Entity for PanickingEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        if ctx.now().tick.0 == self.panic_at_tick {
            panic!("scripted panic at tick {}", self.panic_at_tick);
        }
        Ok(UpdateStatus::Continue)
    }
}

// ── RandomWalker ────────────────────────────────────────────────

/// Moves along a line by a seeded random step, pulled towards the mean of
/// its neighbours' committed positions.
pub struct RandomWalker {
    pub id: EntityId,
    rng: ChaCha8Rng,
    pub position: Arc<Buffered<i64>>,
    pub neighbours: Vec<Arc<Buffered<i64>>>,
}

impl RandomWalker {
    pub fn new(id: u64, seed: u64, start: i64) -> Self {
        Self {
            id: EntityId(id),
            rng: ChaCha8Rng::seed_from_u64(seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            position: Buffered::shared(start),
            neighbours: Vec::new(),
        }
    }
}

impl Entity for RandomWalker {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, _ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        let here = self.position.get();
        let pull = if self.neighbours.is_empty() {
            0
        } else {
            let sum: i64 = self.neighbours.iter().map(|n| n.get()).sum();
            (sum / self.neighbours.len() as i64 - here).signum()
        };
        let step: i64 = self.rng.gen_range(-3..=3);
        self.position.set(here + step + pull);
        Ok(UpdateStatus::Continue)
    }

    fn subscriptions(&self) -> SubscriptionList {
        cells(&self.position)
    }
}

/// `n` walkers on a ring, each watching its two neighbours. Returns the
/// entities and their position cells in id order.
pub fn walker_ring(n: usize, seed: u64) -> (Vec<Box<dyn Entity>>, Vec<Arc<Buffered<i64>>>) {
    let mut walkers: Vec<RandomWalker> = (0..n)
        .map(|i| RandomWalker::new(i as u64, seed, (i as i64) * 10))
        .collect();
    let positions: Vec<_> = walkers.iter().map(|w| Arc::clone(&w.position)).collect();
    if n > 1 {
        for (i, walker) in walkers.iter_mut().enumerate() {
            walker.neighbours = vec![
                Arc::clone(&positions[(i + n - 1) % n]),
                Arc::clone(&positions[(i + 1) % n]),
            ];
        }
    }
    let entities = walkers
        .into_iter()
        .map(|w| Box::new(w) as Box<dyn Entity>)
        .collect();
    (entities, positions)
}

// ── ChattyEntity ────────────────────────────────────────────────

/// A message as logged by a [`ChattyEntity`]: `(sent_at, from, payload)`.
pub type Received = (u64, EntityId, u64);

/// Sends `tick * 1000 + id` to each peer every tick and logs what arrives.
pub struct ChattyEntity {
    pub id: EntityId,
    pub peers: Vec<EntityId>,
    pub received: Log<Received>,
}

impl ChattyEntity {
    pub fn new(id: u64, peers: Vec<EntityId>) -> Self {
        Self {
            id: EntityId(id),
            peers,
            received: Log::default(),
        }
    }
}

impl Entity for ChattyEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn is_non_spatial(&self) -> bool {
        true
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        let payload = ctx.now().tick.0 * 1000 + self.id.0;
        for &peer in &self.peers {
            ctx.send(peer, payload);
        }
        Ok(UpdateStatus::Continue)
    }

    fn on_message(&mut self, msg: Message) {
        if let Some(&payload) = msg.downcast_ref::<u64>() {
            push(&self.received, (msg.sent_at.0, msg.from, payload));
        }
    }
}

// ── SpawningEntity ──────────────────────────────────────────────

/// Hands `child` to the scheduler on its update at `spawn_at_tick`.
pub struct SpawningEntity {
    pub id: EntityId,
    pub spawn_at_tick: u64,
    pub child: Option<Box<dyn Entity>>,
}

impl SpawningEntity {
    pub fn new(id: u64, spawn_at_tick: u64, child: Box<dyn Entity>) -> Self {
        Self {
            id: EntityId(id),
            spawn_at_tick,
            child: Some(child),
        }
    }
}

impl Entity for SpawningEntity {
    fn id(&self) -> EntityId {
        self.id
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        if ctx.now().tick.0 >= self.spawn_at_tick {
            if let Some(child) = self.child.take() {
                ctx.spawn(child);
            }
        }
        Ok(UpdateStatus::Continue)
    }
}
