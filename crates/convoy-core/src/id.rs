//! Strongly-typed identifiers and the [`Timeslice`] clock value.

use std::fmt;

/// Identifies a simulated entity (vehicle, pedestrian, signal, ...).
///
/// Assigned by the domain loader. The scheduler rejects a second live
/// entity with the same id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies a WorkGroup within one simulation run.
///
/// Groups are registered with the manager and assigned sequential IDs.
/// `GroupId(n)` is the n-th group created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for GroupId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies one Worker: its group plus its index inside that group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId {
    /// Owning group.
    pub group: GroupId,
    /// Position of the worker in the group's worker list.
    pub index: u32,
}

impl WorkerId {
    /// Build a worker id from its group and index.
    pub fn new(group: GroupId, index: u32) -> Self {
        Self { group, index }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.index)
    }
}

/// Index of a base tick.
///
/// Base tick 0 is the first tick of the simulation; every WorkGroup's
/// tick step is a multiple of the base tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickId(pub u64);

impl TickId {
    /// The tick after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TickId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TickId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// A point on the simulation clock: the base tick and the simulated
/// milliseconds elapsed at the start of that tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timeslice {
    /// Base tick index.
    pub tick: TickId,
    /// Simulated time at the start of the tick, in milliseconds.
    pub ms: u64,
}

impl Timeslice {
    /// Timeslice for `tick` with a base granularity of `granularity_ms`.
    pub fn new(tick: TickId, granularity_ms: u64) -> Self {
        Self {
            tick,
            ms: tick.0.saturating_mul(granularity_ms),
        }
    }
}

impl fmt::Display for Timeslice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tick {} ({} ms)", self.tick, self.ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeslice_scales_by_granularity() {
        let t = Timeslice::new(TickId(7), 100);
        assert_eq!(t.ms, 700);
        assert_eq!(t.tick, TickId(7));
    }

    #[test]
    fn timeslice_saturates_instead_of_overflowing() {
        let t = Timeslice::new(TickId(u64::MAX), 10);
        assert_eq!(t.ms, u64::MAX);
    }

    #[test]
    fn worker_id_display_includes_group() {
        let w = WorkerId::new(GroupId(2), 5);
        assert_eq!(w.to_string(), "2:5");
    }

    #[test]
    fn ids_order_numerically() {
        assert!(EntityId(3) < EntityId(10));
        assert!(WorkerId::new(GroupId(0), 9) < WorkerId::new(GroupId(1), 0));
        assert_eq!(TickId(4).next(), TickId(5));
    }
}
