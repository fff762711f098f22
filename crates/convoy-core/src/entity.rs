//! The [`Entity`] trait and the per-call [`TickContext`].
//!
//! Entities are opaque to the scheduler: it only needs to know when an
//! entity starts, how to advance it one tick, and which buffered cells it
//! owns. Domain roles implement this trait directly and compose their
//! behavior out of whatever capability objects they need.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::buffered::BufferedBase;
use crate::error::EntityError;
use crate::id::{EntityId, Timeslice, WorkerId};
use crate::message::Message;

/// Result of advancing an entity by one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateStatus {
    /// Keep the entity scheduled.
    Continue,
    /// The entity has finished; remove it during the next cleanup phase.
    Done,
}

/// The buffered cells an entity owns and the Worker must flip.
pub type SubscriptionList = SmallVec<[Arc<dyn BufferedBase>; 4]>;

/// A simulated object the scheduler can advance.
///
/// # Contract
///
/// - `frame_init()` is called exactly once, on the first tick the entity
///   is active, immediately before its first `update()`.
/// - `update()` is called once per active tick of the owning WorkGroup
///   whose time is at or after [`start_time_ms`](Entity::start_time_ms).
/// - `subscriptions()` is read when the entity lands on a Worker. Every
///   cell returned is flipped once per tick while the entity is there.
/// - Reads of other entities' cells during `update()` observe the values
///   committed by the previous flip.
///
/// Returning `Err` (or panicking) from `frame_init()` or `update()` is fatal
/// for the whole run.
pub trait Entity: Send {
    /// Stable identifier, unique among live entities.
    fn id(&self) -> EntityId;

    /// Simulated time at which the entity becomes active, in milliseconds.
    fn start_time_ms(&self) -> u64;

    /// Entities without a physical position are skipped by spatial hooks.
    fn is_non_spatial(&self) -> bool {
        false
    }

    /// One-time setup before the first `update()`.
    fn frame_init(&mut self, _ctx: &mut TickContext<'_>) -> Result<(), EntityError> {
        Ok(())
    }

    /// Advance the entity one tick.
    fn update(&mut self, ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError>;

    /// Buffered cells owned by this entity.
    fn subscriptions(&self) -> SubscriptionList {
        SubscriptionList::new()
    }

    /// Receive a message. Called between ticks, before the next `update()`.
    fn on_message(&mut self, _msg: Message) {}

    /// The entity has been placed on `worker`.
    fn on_worker_enter(&mut self, _worker: WorkerId) {}

    /// The entity is leaving `worker` (finished, removed, or migrating).
    fn on_worker_exit(&mut self, _worker: WorkerId) {}
}

impl<'a> std::fmt::Debug for dyn Entity + 'a {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id())
            .field("start_time_ms", &self.start_time_ms())
            .finish_non_exhaustive()
    }
}

// ── TickContext ─────────────────────────────────────────────────

/// Per-call view of the scheduler handed to `frame_init()` and `update()`.
///
/// Sends and spawns are queued; nothing they do is visible to other
/// entities until the current tick's frame phase has finished.
pub struct TickContext<'a> {
    now: Timeslice,
    worker: WorkerId,
    entity: EntityId,
    outbox: &'a mut Vec<Message>,
    spawned: &'a mut Vec<Box<dyn Entity>>,
    seq: u32,
}

impl<'a> TickContext<'a> {
    /// Build a context for `entity` running on `worker` at `now`.
    pub fn new(
        now: Timeslice,
        worker: WorkerId,
        entity: EntityId,
        outbox: &'a mut Vec<Message>,
        spawned: &'a mut Vec<Box<dyn Entity>>,
    ) -> Self {
        Self {
            now,
            worker,
            entity,
            outbox,
            spawned,
            seq: 0,
        }
    }

    /// Current simulation time.
    pub fn now(&self) -> Timeslice {
        self.now
    }

    /// The Worker running this call.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// The entity being advanced.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Queue a message for delivery in the message-distribution phase.
    pub fn send<P: std::any::Any + Send>(&mut self, to: EntityId, payload: P) {
        self.outbox.push(Message {
            from: self.entity,
            to,
            sent_at: self.now.tick,
            seq: self.seq,
            payload: Box::new(payload),
        });
        self.seq += 1;
    }

    /// Queue a new entity for admission into this Worker's WorkGroup.
    ///
    /// It is staged during cleanup like any loaded entity, so it runs no
    /// earlier than the next active tick.
    pub fn spawn(&mut self, entity: Box<dyn Entity>) {
        self.spawned.push(entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{GroupId, TickId};

    struct Idle(EntityId);

    impl Entity for Idle {
        fn id(&self) -> EntityId {
            self.0
        }
        fn start_time_ms(&self) -> u64 {
            0
        }
        fn update(&mut self, _ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
            Ok(UpdateStatus::Continue)
        }
    }

    #[test]
    fn send_stamps_sender_tick_and_sequence() {
        let mut outbox = Vec::new();
        let mut spawned = Vec::new();
        let now = Timeslice::new(TickId(4), 100);
        let worker = WorkerId::new(GroupId(0), 1);
        let mut ctx = TickContext::new(now, worker, EntityId(7), &mut outbox, &mut spawned);
        ctx.send(EntityId(8), "hello");
        ctx.send(EntityId(9), 3u8);
        assert_eq!(ctx.now().ms, 400);
        assert_eq!(ctx.worker(), worker);

        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].from, EntityId(7));
        assert_eq!(outbox[0].sent_at, TickId(4));
        assert_eq!(outbox[0].seq, 0);
        assert_eq!(outbox[1].seq, 1);
        assert_eq!(outbox[1].downcast_ref::<u8>(), Some(&3));
    }

    #[test]
    fn spawn_queues_entity() {
        let mut outbox = Vec::new();
        let mut spawned = Vec::new();
        let mut ctx = TickContext::new(
            Timeslice::default(),
            WorkerId::new(GroupId(0), 0),
            EntityId(1),
            &mut outbox,
            &mut spawned,
        );
        ctx.spawn(Box::new(Idle(EntityId(2))));
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].id(), EntityId(2));
    }

    #[test]
    fn default_hooks_are_inert() {
        let mut e = Idle(EntityId(3));
        assert!(!e.is_non_spatial());
        assert!(e.subscriptions().is_empty());
        e.on_worker_enter(WorkerId::new(GroupId(0), 0));
        let dbg = format!("{:?}", &e as &dyn Entity);
        assert!(dbg.contains("EntityId(3)"));
    }
}
