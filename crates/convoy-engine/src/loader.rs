//! The boundary through which domain loaders hand entities to a WorkGroup.
//!
//! The scheduler never parses configuration or connects to a database. A
//! loader only reports which entities exist and when they start.

use convoy_core::Entity;

/// Source of entities for one WorkGroup.
///
/// `initial_entities()` is called once by
/// [`WorkGroup::init_workers`](crate::WorkGroup::init_workers).
/// `load_window()` is then polled by the cleanup leader with consecutive,
/// non-overlapping windows `(from_ms, to_ms]`, where `to_ms` is the start of
/// the group's next active tick.
pub trait EntityLoader: Send {
    /// Entities known before the run starts.
    fn initial_entities(&mut self) -> Vec<Box<dyn Entity>>;

    /// Entities that start in `(from_ms, to_ms]`.
    fn load_window(&mut self, _from_ms: u64, _to_ms: u64) -> Vec<Box<dyn Entity>> {
        Vec::new()
    }
}

/// A fixed entity set handed over in full at initialization.
///
/// Entities with future start times wait in the pending queue.
#[derive(Default)]
pub struct LoadParams {
    entities: Vec<Box<dyn Entity>>,
}

impl LoadParams {
    /// Wrap a fixed entity set.
    pub fn new(entities: Vec<Box<dyn Entity>>) -> Self {
        Self { entities }
    }

    /// No entities.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add one entity.
    pub fn with(mut self, entity: Box<dyn Entity>) -> Self {
        self.entities.push(entity);
        self
    }

    /// Number of entities held.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether no entities are held.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityLoader for LoadParams {
    fn initial_entities(&mut self) -> Vec<Box<dyn Entity>> {
        std::mem::take(&mut self.entities)
    }
}

impl From<Vec<Box<dyn Entity>>> for LoadParams {
    fn from(entities: Vec<Box<dyn Entity>>) -> Self {
        Self::new(entities)
    }
}

/// Releases entities window by window instead of all at once.
///
/// Only entities starting at time 0 are handed over at initialization; the
/// rest stay with the loader until their window is polled, so the pending
/// queue holds at most one window of entities.
pub struct PeriodicLoader {
    // Sorted by descending start time so the next due entity is at the end.
    remaining: Vec<Box<dyn Entity>>,
}

impl PeriodicLoader {
    /// Build a loader over `entities`.
    pub fn new(mut entities: Vec<Box<dyn Entity>>) -> Self {
        // Stable sort keeps insertion order among equal start times once
        // the vector is reversed back out of `remaining`.
        entities.reverse();
        entities.sort_by(|a, b| b.start_time_ms().cmp(&a.start_time_ms()));
        Self {
            remaining: entities,
        }
    }

    /// Entities not yet released.
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }

    fn release_upto(&mut self, to_ms: u64) -> Vec<Box<dyn Entity>> {
        let mut out = Vec::new();
        while self
            .remaining
            .last()
            .is_some_and(|e| e.start_time_ms() <= to_ms)
        {
            if let Some(e) = self.remaining.pop() {
                out.push(e);
            }
        }
        out
    }
}

impl EntityLoader for PeriodicLoader {
    fn initial_entities(&mut self) -> Vec<Box<dyn Entity>> {
        self.release_upto(0)
    }

    fn load_window(&mut self, _from_ms: u64, to_ms: u64) -> Vec<Box<dyn Entity>> {
        self.release_upto(to_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::{EntityError, EntityId, TickContext, UpdateStatus};

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

    fn ids(v: &[Box<dyn Entity>]) -> Vec<u64> {
        v.iter().map(|e| e.id().0).collect()
    }

    #[test]
    fn load_params_hands_over_everything_once() {
        let mut params = LoadParams::empty()
            .with(Box::new(Stub(1, 0)))
            .with(Box::new(Stub(2, 500)));
        assert_eq!(params.len(), 2);
        assert_eq!(ids(&params.initial_entities()), vec![1, 2]);
        assert!(params.initial_entities().is_empty());
        assert!(params.load_window(0, 1000).is_empty());
    }

    #[test]
    fn periodic_loader_releases_by_window() {
        let entities: Vec<Box<dyn Entity>> = vec![
            Box::new(Stub(1, 200)),
            Box::new(Stub(2, 0)),
            Box::new(Stub(3, 100)),
            Box::new(Stub(4, 100)),
            Box::new(Stub(5, 0)),
        ];
        let mut loader = PeriodicLoader::new(entities);
        assert_eq!(ids(&loader.initial_entities()), vec![2, 5]);
        assert!(loader.load_window(0, 99).is_empty());
        assert_eq!(ids(&loader.load_window(99, 100)), vec![3, 4]);
        assert_eq!(loader.remaining(), 1);
        assert_eq!(ids(&loader.load_window(100, 300)), vec![1]);
        assert_eq!(loader.remaining(), 0);
    }
}
