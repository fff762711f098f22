//! Convoy: a phased, multi-threaded scheduler for transport agent simulations.
//!
//! This is the top-level facade crate that re-exports the public API of the
//! Convoy sub-crates. For most users, adding `convoy` as a single dependency
//! is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use convoy::prelude::*;
//!
//! // An entity that advances its odometer by one every tick.
//! struct Odometer {
//!     id: EntityId,
//!     km: Arc<Buffered<u64>>,
//! }
//!
//! impl Entity for Odometer {
//!     fn id(&self) -> EntityId { self.id }
//!     fn start_time_ms(&self) -> u64 { 0 }
//!     fn update(&mut self, _ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
//!         self.km.set(self.km.get() + 1);
//!         Ok(UpdateStatus::Continue)
//!     }
//!     fn subscriptions(&self) -> SubscriptionList {
//!         let mut cells = SubscriptionList::new();
//!         cells.push(Arc::clone(&self.km) as Arc<dyn BufferedBase>);
//!         cells
//!     }
//! }
//!
//! let mut manager = WorkGroupManager::new(ManagerConfig::default()).unwrap();
//! let group = manager.new_work_group(WorkGroupConfig::new(2, 10, 1)).unwrap();
//! manager.init_all_groups().unwrap();
//!
//! let km = Buffered::shared(0);
//! group
//!     .init_workers(LoadParams::empty().with(Box::new(Odometer { id: EntityId(1), km: Arc::clone(&km) })))
//!     .unwrap();
//! manager.start_all_work_groups().unwrap();
//!
//! let metrics = manager.run_to_completion().unwrap();
//! assert_eq!(metrics.ticks_completed, 10);
//! assert_eq!(km.get(), 10);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `convoy-core` | IDs, clock, buffered cells, the `Entity` trait, messages |
//! | [`engine`] | `convoy-engine` | Barriers, WorkGroups, Workers, the manager, hooks |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and IDs (`convoy-core`).
///
/// Contains the simulation clock ([`types::Timeslice`]), double-buffered
/// state ([`types::Buffered`], [`types::FixedDelayed`]) and the
/// [`types::Entity`] trait.
pub use convoy_core as types;

/// The scheduling engine (`convoy-engine`).
///
/// [`engine::WorkGroupManager`] drives every [`engine::WorkGroup`] through
/// the shared phase barriers.
pub use convoy_engine as engine;

/// Common imports for typical Convoy usage.
///
/// ```rust
/// use convoy::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use convoy_core::{
        Buffered, BufferedBase, Entity, EntityId, FixedDelayed, GroupId, Message, SubscriptionList,
        TickContext, TickId, Timeslice, UpdateStatus, WorkerId,
    };

    // Errors
    pub use convoy_core::EntityError;
    pub use convoy_engine::{ConfigError, SchedulerError};

    // Engine
    pub use convoy_engine::{
        AssignmentPolicy, GroupServices, HookContext, LoadParams, ManagerConfig, PeriodicLoader,
        SchedulerMetrics, StallConfig, StallPolicy, TickMetrics, WorkGroup, WorkGroupConfig,
        WorkGroupManager,
    };
}
