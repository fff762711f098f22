//! Flip consistency: reads during a frame phase see exactly the state
//! committed by the previous flip, and every cell is flipped exactly once
//! per active tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use convoy_core::{
    BufferedBase, Entity, EntityError, EntityId, SubscriptionList, TickContext, UpdateStatus,
};
use convoy_engine::{LoadParams, ManagerConfig, WorkGroupConfig, WorkGroupManager};
use convoy_test_utils::{read_log, Log, Observation, ReaderEntity, WriterEntity};

const WRITERS: u64 = 6;
const READERS: u64 = 6;
const TICKS: u64 = 25;

fn manager(single_threaded: bool) -> WorkGroupManager {
    WorkGroupManager::new(ManagerConfig {
        single_threaded,
        ..ManagerConfig::default()
    })
    .unwrap()
}

#[test]
fn readers_see_previous_tick_values() {
    for single_threaded in [true, false] {
        let mut m = manager(single_threaded);
        let group = m.new_work_group(WorkGroupConfig::new(4, TICKS, 1)).unwrap();
        m.init_all_groups().unwrap();

        let writers: Vec<_> = (0..WRITERS).map(WriterEntity::new).collect();
        let cells: Vec<_> = writers.iter().map(|w| Arc::clone(&w.cell)).collect();
        let seen: Log<Observation> = Log::default();

        let mut params = LoadParams::empty();
        // Interleave so writers and readers share Workers.
        for (i, writer) in writers.into_iter().enumerate() {
            params = params.with(Box::new(writer)).with(Box::new(ReaderEntity::new(
                100 + i as u64,
                cells.clone(),
                Arc::clone(&seen),
            )));
        }
        assert_eq!(params.len() as u64, WRITERS + READERS);
        group.init_workers(params).unwrap();
        m.start_all_work_groups().unwrap();
        m.run_to_completion().unwrap();

        let seen = read_log(&seen);
        assert_eq!(seen.len() as u64, TICKS * READERS * WRITERS);
        for obs in seen {
            let expected = obs.tick.checked_sub(1);
            assert_eq!(obs.seen, expected, "{obs:?}");
        }
        for cell in &cells {
            assert_eq!(cell.get(), Some(TICKS - 1));
        }
    }
}

#[test]
fn cross_group_reads_see_last_committed_value() {
    let mut m = manager(false);
    let writer_group = m.new_work_group(WorkGroupConfig::new(2, 12, 3)).unwrap();
    let reader_group = m.new_work_group(WorkGroupConfig::new(2, 12, 1)).unwrap();
    m.init_all_groups().unwrap();

    let writer = WriterEntity::new(1);
    let cell = Arc::clone(&writer.cell);
    let seen: Log<Observation> = Log::default();
    writer_group
        .init_workers(LoadParams::empty().with(Box::new(writer)))
        .unwrap();
    reader_group
        .init_workers(
            LoadParams::empty().with(Box::new(ReaderEntity::new(2, vec![cell], Arc::clone(&seen)))),
        )
        .unwrap();
    m.start_all_work_groups().unwrap();
    m.run_to_completion().unwrap();

    let seen: Vec<_> = read_log(&seen).into_iter().map(|o| (o.tick, o.seen)).collect();
    let expected: Vec<_> = (0..12u64)
        .map(|t| (t, if t == 0 { None } else { Some((t - 1) / 3 * 3) }))
        .collect();
    assert_eq!(seen, expected);
}

/// Counts how often the scheduler flips it.
#[derive(Default)]
struct FlipTracker {
    flips: AtomicU64,
    dirty: AtomicBool,
}

impl BufferedBase for FlipTracker {
    fn flip(&self) {
        self.flips.fetch_add(1, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

struct TrackerOwner {
    id: u64,
    tracker: Arc<FlipTracker>,
}

impl Entity for TrackerOwner {
    fn id(&self) -> EntityId {
        EntityId(self.id)
    }

    fn start_time_ms(&self) -> u64 {
        0
    }

    fn update(&mut self, _ctx: &mut TickContext<'_>) -> Result<UpdateStatus, EntityError> {
        // A flip must never land inside a frame phase.
        if self.tracker.dirty.swap(true, Ordering::SeqCst) {
            return Err(EntityError::update("cell still dirty at update"));
        }
        Ok(UpdateStatus::Continue)
    }

    fn subscriptions(&self) -> SubscriptionList {
        let mut list = SubscriptionList::new();
        list.push(Arc::clone(&self.tracker) as Arc<dyn BufferedBase>);
        list
    }
}

#[test]
fn each_cell_flips_once_per_active_tick() {
    for single_threaded in [true, false] {
        let mut m = manager(single_threaded);
        let every = m.new_work_group(WorkGroupConfig::new(3, 10, 1)).unwrap();
        let second = m.new_work_group(WorkGroupConfig::new(2, 10, 2)).unwrap();
        m.init_all_groups().unwrap();

        let fast: Vec<_> = (0..6).map(|_| Arc::new(FlipTracker::default())).collect();
        let slow: Vec<_> = (0..4).map(|_| Arc::new(FlipTracker::default())).collect();
        let owners = |trackers: &[Arc<FlipTracker>], base: u64| {
            LoadParams::new(
                trackers
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        Box::new(TrackerOwner {
                            id: base + i as u64,
                            tracker: Arc::clone(p),
                        }) as Box<dyn Entity>
                    })
                    .collect(),
            )
        };
        every.init_workers(owners(&fast, 0)).unwrap();
        second.init_workers(owners(&slow, 100)).unwrap();
        m.start_all_work_groups().unwrap();
        let metrics = m.run_to_completion().unwrap();

        for p in &fast {
            assert_eq!(p.flips.load(Ordering::SeqCst), 10);
        }
        for p in &slow {
            assert_eq!(p.flips.load(Ordering::SeqCst), 5);
        }
        assert_eq!(metrics.entities_updated, 6 * 10 + 4 * 5);
    }
}
