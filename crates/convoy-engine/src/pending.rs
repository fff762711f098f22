//! Start-time ordered queue of entities waiting for admission.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use convoy_core::{Entity, EntityId};

struct PendingEntry {
    start_ms: u64,
    seq: u64,
    entity: Box<dyn Entity>,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingEntry {}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_ms
            .cmp(&other.start_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap of entities keyed by `(start_time_ms, insertion order)`.
///
/// Ties on start time pop in the order they were pushed, which keeps
/// Worker assignment deterministic across runs.
#[derive(Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Reverse<PendingEntry>>,
    next_seq: u64,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity under its current start time.
    pub fn push(&mut self, entity: Box<dyn Entity>) {
        let entry = PendingEntry {
            start_ms: entity.start_time_ms(),
            seq: self.next_seq,
            entity,
        };
        self.next_seq += 1;
        self.heap.push(Reverse(entry));
    }

    /// Pop every entity whose start time is at or before `upto_ms`, in
    /// admission order.
    pub fn pop_due(&mut self, upto_ms: u64) -> Vec<Box<dyn Entity>> {
        let mut due = Vec::new();
        while self
            .heap
            .peek()
            .is_some_and(|Reverse(e)| e.start_ms <= upto_ms)
        {
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.entity);
            }
        }
        due
    }

    /// Remove one entity by id, wherever it sits in the queue.
    pub fn remove(&mut self, id: EntityId) -> Option<Box<dyn Entity>> {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut found = None;
        let mut kept = Vec::with_capacity(entries.len());
        for Reverse(entry) in entries {
            if found.is_none() && entry.entity.id() == id {
                found = Some(entry.entity);
            } else {
                kept.push(Reverse(entry));
            }
        }
        self.heap = BinaryHeap::from(kept);
        found
    }

    /// Take every queued entity in admission order.
    pub fn drain_all(&mut self) -> Vec<Box<dyn Entity>> {
        self.pop_due(u64::MAX)
    }

    /// Earliest queued start time.
    pub fn peek_start(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(e)| e.start_ms)
    }

    /// Number of queued entities.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("len", &self.heap.len())
            .field("next_start_ms", &self.peek_start())
            .finish()
    }
}
