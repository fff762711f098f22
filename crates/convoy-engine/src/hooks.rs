//! Cross-cutting services invoked once per macro tick of a WorkGroup.
//!
//! Hooks are run by a single elected thread, never concurrently with the
//! frame or flip phase, so they may read the registry and any committed
//! [`Buffered`](convoy_core::Buffered) state freely.
//!
//! | Hook | Phase | Typical use |
//! |------|-------|-------------|
//! | [`SpatialIndexHook`] | spatial index | rebuild the neighbor index |
//! | [`PartitionHook`] | message distribution | exchange boundary entities |
//! | [`MacroTickHook`] | macro tick | flush statistics, write output |
//!
//! Closures `FnMut(&HookContext<'_>) + Send` implement all three traits.

use convoy_core::{EntityId, GroupId, Timeslice};

use crate::registry::SimulationRegistry;

/// What a hook can see.
pub struct HookContext<'a> {
    /// The group the hook belongs to.
    pub group: GroupId,
    /// Current simulation time.
    pub now: Timeslice,
    /// Read access to every live entity's location.
    pub registry: &'a SimulationRegistry,
}

impl HookContext<'_> {
    /// Entities of this group currently on a Worker and not flagged
    /// non-spatial.
    pub fn spatial_entities(&self) -> Vec<EntityId> {
        let group = self.group;
        self.registry
            .snapshot()
            .into_iter()
            .filter(|(_, r)| !r.non_spatial && r.location.group() == group)
            .filter(|(_, r)| matches!(r.location, crate::EntityLocation::Assigned(_)))
            .map(|(id, _)| id)
            .collect()
    }
}

/// Rebuilds a spatial index after the flip phase.
pub trait SpatialIndexHook: Send {
    /// Called once per macro tick of the owning group.
    fn rebuild(&mut self, ctx: &HookContext<'_>);
}

/// Exchanges state with other partitions during message distribution.
pub trait PartitionHook: Send {
    /// Called once per macro tick of the owning group.
    fn exchange(&mut self, ctx: &HookContext<'_>);
}

/// Time-dependent bookkeeping such as statistics or output.
pub trait MacroTickHook: Send {
    /// Called once per macro tick of the owning group.
    fn on_macro_tick(&mut self, ctx: &HookContext<'_>);
}

impl<F: FnMut(&HookContext<'_>) + Send> SpatialIndexHook for F {
    fn rebuild(&mut self, ctx: &HookContext<'_>) {
        self(ctx)
    }
}

impl<F: FnMut(&HookContext<'_>) + Send> PartitionHook for F {
    fn exchange(&mut self, ctx: &HookContext<'_>) {
        self(ctx)
    }
}

impl<F: FnMut(&HookContext<'_>) + Send> MacroTickHook for F {
    fn on_macro_tick(&mut self, ctx: &HookContext<'_>) {
        self(ctx)
    }
}

/// Optional hooks attached to a WorkGroup at creation.
#[derive(Default)]
pub struct GroupServices {
    pub(crate) spatial: Option<Box<dyn SpatialIndexHook>>,
    pub(crate) partition: Option<Box<dyn PartitionHook>>,
    pub(crate) macro_tick: Option<Box<dyn MacroTickHook>>,
}

impl GroupServices {
    /// No hooks.
    pub fn none() -> Self {
        Self::default()
    }

    /// Attach a spatial index hook.
    pub fn with_spatial_index(mut self, hook: impl SpatialIndexHook + 'static) -> Self {
        self.spatial = Some(Box::new(hook));
        self
    }

    /// Attach a partition hook.
    pub fn with_partition(mut self, hook: impl PartitionHook + 'static) -> Self {
        self.partition = Some(Box::new(hook));
        self
    }

    /// Attach a macro tick hook.
    pub fn with_macro_tick(mut self, hook: impl MacroTickHook + 'static) -> Self {
        self.macro_tick = Some(Box::new(hook));
        self
    }

    /// Whether a spatial index hook is attached.
    pub fn has_spatial_index(&self) -> bool {
        self.spatial.is_some()
    }
}

impl std::fmt::Debug for GroupServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupServices")
            .field("spatial", &self.spatial.is_some())
            .field("partition", &self.partition.is_some())
            .field("macro_tick", &self.macro_tick.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntityLocation, EntityRecord};
    use convoy_core::{TickId, WorkerId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn closures_act_as_hooks() {
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        let mut services = GroupServices::none().with_macro_tick(move |ctx: &HookContext<'_>| {
            c.fetch_add(ctx.now.tick.0, Ordering::Relaxed);
        });
        let registry = SimulationRegistry::new();
        let ctx = HookContext {
            group: GroupId(0),
            now: Timeslice::new(TickId(5), 100),
            registry: &registry,
        };
        if let Some(hook) = services.macro_tick.as_mut() {
            hook.on_macro_tick(&ctx);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 5);
        assert!(!services.has_spatial_index());
    }

    #[test]
    fn spatial_entities_skip_non_spatial_and_pending() {
        let registry = SimulationRegistry::new();
        let on = |w| EntityLocation::Assigned(WorkerId::new(GroupId(0), w));
        registry
            .register(EntityId(1), EntityRecord::new(on(0), 0, false))
            .unwrap();
        registry
            .register(EntityId(2), EntityRecord::new(on(1), 0, true))
            .unwrap();
        registry
            .register(
                EntityId(3),
                EntityRecord::new(EntityLocation::Pending(GroupId(0)), 10, false),
            )
            .unwrap();
        registry
            .register(
                EntityId(4),
                EntityRecord::new(EntityLocation::Assigned(WorkerId::new(GroupId(1), 0)), 0, false),
            )
            .unwrap();
        let ctx = HookContext {
            group: GroupId(0),
            now: Timeslice::default(),
            registry: &registry,
        };
        assert_eq!(ctx.spatial_entities(), vec![EntityId(1)]);
    }
}
