//! Fixture entities for Convoy development.
//!
//! Every fixture implements [`convoy_core::Entity`] and exposes its
//! observable state through shared handles (`Arc<Buffered<_>>` cells or
//! [`Log`]s), so tests can inspect results after the run without
//! downcasting entities.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{
    read_log, walker_ring, AddTickDivisibleAgent, ChattyEntity, CountingEntity, FailingEntity,
    Log, Observation, PanickingEntity, RandomWalker, ReaderEntity, Received, SpawningEntity,
    WriterEntity,
};

use convoy_core::Entity;

/// Box a list of fixtures as trait objects.
pub fn boxed<E: Entity + 'static>(entities: impl IntoIterator<Item = E>) -> Vec<Box<dyn Entity>> {
    entities
        .into_iter()
        .map(|e| Box::new(e) as Box<dyn Entity>)
        .collect()
}
