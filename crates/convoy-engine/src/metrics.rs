//! Per-tick and cumulative scheduler metrics.
//!
//! [`TickMetrics`] is returned by every
//! [`wait_all_groups()`](crate::WorkGroupManager::wait_all_groups) call;
//! [`SchedulerMetrics`] accumulates them over the run.

use convoy_core::TickId;

/// Counters collected during a single base tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickMetrics {
    /// The base tick these counters describe.
    pub tick: TickId,
    /// WorkGroups whose tick step divided this tick.
    pub active_groups: u32,
    /// `update()` calls made in the frame phase.
    pub entities_updated: u64,
    /// Entities moved from a pending queue onto a Worker.
    pub admitted: u64,
    /// Entities removed (finished or by request).
    pub removed: u64,
    /// Entities moved to another WorkGroup.
    pub migrated: u64,
    /// Messages delivered to a recipient's inbox.
    pub messages_delivered: u64,
    /// Messages whose recipient was unknown or not on a Worker.
    pub messages_dropped: u64,
    /// Buffered cells that committed a staged write in the flip phase.
    pub buffers_flipped: u64,
    /// Wall-clock time of the frame phase, in microseconds.
    pub frame_us: u64,
    /// Entities on a Worker at the end of the tick.
    pub live_entities: u64,
    /// Entities waiting in pending queues at the end of the tick.
    pub pending_entities: u64,
}

/// Totals over a whole run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    /// Base ticks completed.
    pub ticks_completed: u64,
    /// Total `update()` calls.
    pub entities_updated: u64,
    /// Total admissions from pending queues.
    pub admitted: u64,
    /// Total removals.
    pub removed: u64,
    /// Total migrations.
    pub migrated: u64,
    /// Total delivered messages.
    pub messages_delivered: u64,
    /// Total dropped messages.
    pub messages_dropped: u64,
    /// Total frame-phase wall time, in microseconds.
    pub frame_us: u64,
    /// Highest `live_entities` seen at the end of any tick.
    pub peak_live_entities: u64,
    /// Stall warnings emitted by the shared barriers.
    pub stall_events: u64,
}

impl SchedulerMetrics {
    /// Fold one tick's counters into the totals.
    pub fn record(&mut self, tick: &TickMetrics) {
        self.ticks_completed += 1;
        self.entities_updated += tick.entities_updated;
        self.admitted += tick.admitted;
        self.removed += tick.removed;
        self.migrated += tick.migrated;
        self.messages_delivered += tick.messages_delivered;
        self.messages_dropped += tick.messages_dropped;
        self.frame_us += tick.frame_us;
        self.peak_live_entities = self.peak_live_entities.max(tick.live_entities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let m = TickMetrics::default();
        assert_eq!(m.tick, TickId(0));
        assert_eq!(m.active_groups, 0);
        assert_eq!(m.entities_updated, 0);
        assert_eq!(m.admitted, 0);
        assert_eq!(m.removed, 0);
        assert_eq!(m.messages_delivered, 0);
        assert_eq!(m.frame_us, 0);
        assert_eq!(SchedulerMetrics::default().ticks_completed, 0);
    }

    #[test]
    fn record_accumulates_and_tracks_peak() {
        let mut total = SchedulerMetrics::default();
        total.record(&TickMetrics {
            tick: TickId(0),
            entities_updated: 10,
            admitted: 4,
            live_entities: 7,
            messages_dropped: 1,
            ..TickMetrics::default()
        });
        total.record(&TickMetrics {
            tick: TickId(1),
            entities_updated: 5,
            removed: 2,
            live_entities: 3,
            ..TickMetrics::default()
        });
        assert_eq!(total.ticks_completed, 2);
        assert_eq!(total.entities_updated, 15);
        assert_eq!(total.admitted, 4);
        assert_eq!(total.removed, 2);
        assert_eq!(total.messages_dropped, 1);
        assert_eq!(total.peak_live_entities, 7);
    }
}
