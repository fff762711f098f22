//! Double-buffered state cells and the per-Worker flip manager.
//!
//! A [`Buffered<T>`] exposes two versions of one value: `current`, which
//! every entity may read during the frame phase, and `pending`, which only
//! the owning entity writes. The flip phase commits pending into current
//! once every entity in the tick has finished computing, so a reader never
//! observes a peer's same-tick write.
//!
//! The cells hold their slots behind `std::sync` locks. The barrier protocol
//! keeps writers and the flip in different phases, so these locks are never
//! contended; they exist to make the types `Sync` without `unsafe`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use indexmap::IndexMap;

use crate::entity::SubscriptionList;

// ── BufferedBase ────────────────────────────────────────────────

/// Type-erased view of a buffered cell, as seen by the flip phase.
pub trait BufferedBase: Send + Sync {
    /// Commit the pending write, if any, into the current slot.
    fn flip(&self);

    /// Whether a write is waiting for the next flip.
    fn is_dirty(&self) -> bool;
}

// ── Buffered<T> ─────────────────────────────────────────────────

/// A double-buffered value.
///
/// `set()` during tick `t` becomes visible through `get()` only after the
/// flip that ends tick `t`. Multiple writes in one tick: last write wins.
#[derive(Debug)]
pub struct Buffered<T> {
    current: RwLock<T>,
    pending: Mutex<T>,
    dirty: AtomicBool,
}

impl<T: Clone + Send + Sync> Buffered<T> {
    /// Create a cell whose current and pending slots both hold `value`.
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(value.clone()),
            pending: Mutex::new(value),
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a cell already wrapped in an `Arc`, ready to be shared with
    /// readers and listed in a subscription list.
    pub fn shared(value: T) -> Arc<Self> {
        Arc::new(Self::new(value))
    }

    /// The committed value as of the last flip.
    pub fn get(&self) -> T {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Borrow the committed value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Stage `value` for the next flip.
    pub fn set(&self, value: T) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = value;
        self.dirty.store(true, Ordering::Release);
    }

    /// Overwrite both slots immediately and discard any staged write.
    ///
    /// Intended for initial state, before the entity is handed to a Worker.
    /// Calling it while other entities may be reading breaks flip isolation.
    pub fn force(&self, value: T) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = value.clone();
        *pending = value;
        self.dirty.store(false, Ordering::Release);
    }
}

impl<T: Clone + Send + Sync> BufferedBase for Buffered<T> {
    fn flip(&self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = pending.clone();
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

impl<T: Clone + Send + Sync + Default> Default for Buffered<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ── FixedDelayed<T> ─────────────────────────────────────────────

/// A buffered value read with a fixed perception delay.
///
/// The owner records samples stamped with the simulated time at which they
/// were observed; readers ask for the value as it was `delay_ms` before
/// their own clock. Samples committed by a flip are the only ones readers
/// can see, so the same isolation as [`Buffered`] holds.
#[derive(Debug)]
pub struct FixedDelayed<T> {
    delay_ms: u64,
    history: RwLock<VecDeque<(u64, T)>>,
    pending: Mutex<Option<(u64, T)>>,
}

impl<T: Clone + Send + Sync> FixedDelayed<T> {
    /// Create a delayed cell whose history starts with `initial` at time 0.
    pub fn new(delay_ms: u64, initial: T) -> Self {
        let mut history = VecDeque::new();
        history.push_back((0, initial));
        Self {
            delay_ms,
            history: RwLock::new(history),
            pending: Mutex::new(None),
        }
    }

    /// Create a delayed cell already wrapped in an `Arc`.
    pub fn shared(delay_ms: u64, initial: T) -> Arc<Self> {
        Arc::new(Self::new(delay_ms, initial))
    }

    /// The configured perception delay in milliseconds.
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Stage a sample observed at `observed_ms` for the next flip.
    pub fn delay(&self, observed_ms: u64, value: T) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some((observed_ms, value));
    }

    /// Whether enough time has elapsed for any sample to be perceivable.
    pub fn can_sense(&self, now_ms: u64) -> bool {
        now_ms >= self.delay_ms
    }

    /// The newest committed sample stamped at or before `now_ms - delay_ms`.
    ///
    /// Returns `None` while `now_ms` is still inside the initial delay window.
    pub fn delayed(&self, now_ms: u64) -> Option<T> {
        let horizon = now_ms.checked_sub(self.delay_ms)?;
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        history
            .iter()
            .rev()
            .find(|(at, _)| *at <= horizon)
            .map(|(_, v)| v.clone())
    }

    /// Number of committed samples currently retained.
    pub fn history_len(&self) -> usize {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T: Clone + Send + Sync> BufferedBase for FixedDelayed<T> {
    fn flip(&self) {
        let Some(sample) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let newest = sample.0;
        history.push_back(sample);

        // Readers never ask for anything older than `newest - delay`, so
        // keep only the last sample at or before that horizon.
        let horizon = newest.saturating_sub(self.delay_ms);
        while history.len() > 1 && history[1].0 <= horizon {
            history.pop_front();
        }
    }

    fn is_dirty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

// ── BufferedDataManager ─────────────────────────────────────────

/// The set of buffered cells a Worker flips in its flip phase.
///
/// Cells are keyed by allocation address, so a cell shared by several
/// entities flips exactly once per tick. Each cell counts its subscribers
/// and is only dropped when the last one leaves. Iteration follows
/// registration order.
#[derive(Default)]
pub struct BufferedDataManager {
    managed: IndexMap<usize, ManagedCell>,
}

struct ManagedCell {
    cell: Arc<dyn BufferedBase>,
    subscribers: usize,
}

fn cell_key(cell: &Arc<dyn BufferedBase>) -> usize {
    Arc::as_ptr(cell) as *const () as usize
}

impl BufferedDataManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start flipping every cell in `cells`.
    pub fn begin_managing(&mut self, cells: &SubscriptionList) {
        for cell in cells {
            self.managed
                .entry(cell_key(cell))
                .or_insert_with(|| ManagedCell {
                    cell: Arc::clone(cell),
                    subscribers: 0,
                })
                .subscribers += 1;
        }
    }

    /// Drop one subscription to every cell in `cells`. A cell stops
    /// flipping once no subscriber is left.
    ///
    /// Any write staged on a dropped cell is committed first, so a cell
    /// leaving mid-simulation does not lose its last update.
    pub fn stop_managing(&mut self, cells: &SubscriptionList) {
        for cell in cells {
            let key = cell_key(cell);
            let Some(managed) = self.managed.get_mut(&key) else {
                continue;
            };
            managed.subscribers -= 1;
            if managed.subscribers == 0 {
                if let Some(removed) = self.managed.shift_remove(&key) {
                    removed.cell.flip();
                }
            }
        }
    }

    /// Flip every managed cell. Returns the number of cells that had a
    /// staged write.
    pub fn flip_all(&self) -> usize {
        let mut flipped = 0;
        for ManagedCell { cell, .. } in self.managed.values() {
            if cell.is_dirty() {
                flipped += 1;
            }
            cell.flip();
        }
        flipped
    }

    /// Number of managed cells.
    pub fn len(&self) -> usize {
        self.managed.len()
    }

    /// Whether no cells are managed.
    pub fn is_empty(&self) -> bool {
        self.managed.is_empty()
    }
}

impl std::fmt::Debug for BufferedDataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedDataManager")
            .field("managed", &self.managed.len())
            .finish()
    }
}

// Compile-time assertion: buffered cells must be shareable across Workers.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Buffered<u64>>();
    assert::<FixedDelayed<f64>>();
    assert::<BufferedDataManager>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn set_is_invisible_until_flip() {
        let b = Buffered::new(1u32);
        b.set(2);
        assert_eq!(b.get(), 1);
        assert!(b.is_dirty());
        b.flip();
        assert_eq!(b.get(), 2);
        assert!(!b.is_dirty());
    }

    #[test]
    fn last_write_wins_within_a_tick() {
        let b = Buffered::new(0i64);
        b.set(5);
        b.set(-3);
        b.set(9);
        b.flip();
        assert_eq!(b.get(), 9);
    }

    #[test]
    fn clean_flip_keeps_current() {
        let b = Buffered::new(String::from("a"));
        b.flip();
        b.flip();
        assert_eq!(b.get(), "a");
    }

    #[test]
    fn force_writes_both_slots_and_clears_dirty() {
        let b = Buffered::new(0u8);
        b.set(4);
        b.force(7);
        assert_eq!(b.get(), 7);
        assert!(!b.is_dirty());
        b.flip();
        assert_eq!(b.get(), 7);
    }

    #[test]
    fn with_borrows_current() {
        let b = Buffered::new(vec![1, 2, 3]);
        assert_eq!(b.with(|v| v.len()), 3);
    }

    #[test]
    fn delayed_is_none_inside_initial_window() {
        let d = FixedDelayed::new(300, 0.0f64);
        assert!(!d.can_sense(200));
        assert_eq!(d.delayed(200), None);
        assert_eq!(d.delayed(300), Some(0.0));
    }

    #[test]
    fn delayed_reads_sample_from_delay_ago() {
        let d = FixedDelayed::new(200, 0u32);
        for t in 1..=10u64 {
            d.delay(t * 100, t as u32);
            d.flip();
        }
        // At 1000ms with a 200ms delay the reader sees the 800ms sample.
        assert_eq!(d.delayed(1000), Some(8));
        assert_eq!(d.delayed(1050), Some(8));
        assert_eq!(d.delayed(1100), Some(9));
    }

    #[test]
    fn delayed_history_is_pruned() {
        let d = FixedDelayed::new(100, 0u32);
        for t in 1..=50u64 {
            d.delay(t * 10, t as u32);
            d.flip();
        }
        // Samples at 400..=500 plus the one at the horizon.
        assert!(d.history_len() <= 12, "history kept {}", d.history_len());
        assert_eq!(d.delayed(500), Some(40));
    }

    #[test]
    fn delayed_staged_sample_is_invisible_until_flip() {
        let d = FixedDelayed::new(0, 1u32);
        d.delay(10, 2);
        assert!(d.is_dirty());
        assert_eq!(d.delayed(10), Some(1));
        d.flip();
        assert_eq!(d.delayed(10), Some(2));
    }

    #[test]
    fn manager_flips_each_cell_once() {
        let a = Buffered::shared(0u32);
        let b = Buffered::shared(0u32);
        let list: SubscriptionList = smallvec![
            a.clone() as Arc<dyn BufferedBase>,
            b.clone() as Arc<dyn BufferedBase>,
            a.clone() as Arc<dyn BufferedBase>,
        ];
        let mut mgr = BufferedDataManager::new();
        mgr.begin_managing(&list);
        assert_eq!(mgr.len(), 2);

        a.set(1);
        assert_eq!(mgr.flip_all(), 1);
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 0);
    }

    #[test]
    fn shared_cell_keeps_flipping_while_a_subscriber_remains() {
        let shared = Buffered::shared(0u32);
        let first: SubscriptionList = smallvec![shared.clone() as Arc<dyn BufferedBase>];
        let second: SubscriptionList = smallvec![shared.clone() as Arc<dyn BufferedBase>];
        let mut mgr = BufferedDataManager::new();
        mgr.begin_managing(&first);
        mgr.begin_managing(&second);
        assert_eq!(mgr.len(), 1);

        mgr.stop_managing(&first);
        assert_eq!(mgr.len(), 1);
        shared.set(7);
        assert_eq!(mgr.flip_all(), 1);
        assert_eq!(shared.get(), 7);

        mgr.stop_managing(&second);
        assert!(mgr.is_empty());
        // Unknown cells are ignored.
        mgr.stop_managing(&second);
        assert!(mgr.is_empty());
    }

    #[test]
    fn stop_managing_commits_staged_write() {
        let a = Buffered::shared(0u32);
        let list: SubscriptionList = smallvec![a.clone() as Arc<dyn BufferedBase>];
        let mut mgr = BufferedDataManager::new();
        mgr.begin_managing(&list);
        a.set(3);
        mgr.stop_managing(&list);
        assert!(mgr.is_empty());
        assert_eq!(a.get(), 3);
        a.set(4);
        assert_eq!(mgr.flip_all(), 0);
        assert_eq!(a.get(), 3);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delayed_matches_full_history(
                delay in 0u64..200,
                steps in prop::collection::vec(1u64..50, 1..60),
                lookahead in 0u64..400,
            ) {
                let d = FixedDelayed::new(delay, 0u64);
                let mut samples = vec![(0u64, 0u64)];
                let mut at = 0;
                for (i, step) in steps.iter().enumerate() {
                    at += step;
                    d.delay(at, i as u64 + 1);
                    d.flip();
                    samples.push((at, i as u64 + 1));
                }

                let now = at + lookahead;
                let expected = now
                    .checked_sub(delay)
                    .and_then(|h| samples.iter().rev().find(|(t, _)| *t <= h))
                    .map(|(_, v)| *v);
                prop_assert_eq!(d.delayed(now), expected);
            }
        }
    }
}
