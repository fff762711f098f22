//! End-to-end update-phase scenarios: several WorkGroups with different
//! tick steps share one base clock.
//!
//! Every scenario runs in both single-threaded and threaded mode.

use std::sync::Arc;

use convoy_core::Buffered;
use convoy_engine::{LoadParams, ManagerConfig, WorkGroupConfig, WorkGroupManager};
use convoy_test_utils::{boxed, read_log, AddTickDivisibleAgent, CountingEntity};

fn manager(single_threaded: bool) -> WorkGroupManager {
    WorkGroupManager::new(ManagerConfig {
        single_threaded,
        ..ManagerConfig::default()
    })
    .unwrap()
}

#[test]
fn three_groups_with_steps_one_two_three() {
    for single_threaded in [true, false] {
        let mut m = manager(single_threaded);
        let groups: Vec<_> = (1..=3)
            .map(|step| m.new_work_group(WorkGroupConfig::new(1, 5, step)).unwrap())
            .collect();
        m.init_all_groups().unwrap();

        let mut totals: Vec<Arc<Buffered<u64>>> = Vec::new();
        for (i, group) in groups.iter().enumerate() {
            let agent = AddTickDivisibleAgent::new(i as u64, 1);
            totals.push(agent.total());
            group
                .init_workers(LoadParams::empty().with(Box::new(agent)))
                .unwrap();
        }
        m.start_all_work_groups().unwrap();
        let metrics = m.run_to_completion().unwrap();
        assert_eq!(metrics.ticks_completed, 5);

        let values: Vec<u64> = totals.iter().map(|t| t.get()).collect();
        assert_eq!(values, vec![10, 6, 3], "single_threaded={single_threaded}");

        let report = m.finish();
        assert!(report.completed);
        assert_eq!(report.entities.len(), 3);
        assert!(report.failure.is_none());
    }
}

#[test]
fn divisible_sums_over_ninety_nine_ticks() {
    const TICKS: u64 = 99;
    for single_threaded in [true, false] {
        let mut m = manager(single_threaded);
        let group = m.new_work_group(WorkGroupConfig::new(2, TICKS, 1)).unwrap();
        m.init_all_groups().unwrap();

        let agents: Vec<_> = (1..=5).map(|d| AddTickDivisibleAgent::new(d, d)).collect();
        let totals: Vec<_> = agents.iter().map(|a| a.total()).collect();
        group.init_workers(LoadParams::new(boxed(agents))).unwrap();
        m.start_all_work_groups().unwrap();
        m.run_to_completion().unwrap();

        for (d, total) in (1..=5u64).zip(&totals) {
            let m_ = 98 / d;
            assert_eq!(total.get(), d * m_ * (m_ + 1) / 2, "divisor {d}");
            assert_eq!(total.get(), AddTickDivisibleAgent::expected(d, TICKS));
        }
    }
}

#[test]
fn independent_granularities_get_proportional_updates() {
    for single_threaded in [true, false] {
        let mut m = manager(single_threaded);
        let fast = m.new_work_group(WorkGroupConfig::new(2, 9, 1)).unwrap();
        let slow = m.new_work_group(WorkGroupConfig::new(2, 9, 3)).unwrap();
        m.init_all_groups().unwrap();

        let a = CountingEntity::new(1, 0);
        let b = CountingEntity::new(2, 0);
        let (fast_ticks, _, _) = a.logs();
        let (slow_ticks, _, _) = b.logs();
        fast.init_workers(LoadParams::empty().with(Box::new(a))).unwrap();
        slow.init_workers(LoadParams::empty().with(Box::new(b))).unwrap();
        m.start_all_work_groups().unwrap();
        m.run_to_completion().unwrap();

        assert_eq!(read_log(&fast_ticks), (0..9).collect::<Vec<_>>());
        assert_eq!(read_log(&slow_ticks), vec![0, 3, 6]);
    }
}

#[test]
fn groups_with_different_lengths_end_independently() {
    let mut m = manager(false);
    let short = m.new_work_group(WorkGroupConfig::new(1, 4, 1)).unwrap();
    let long = m.new_work_group(WorkGroupConfig::new(1, 10, 2)).unwrap();
    m.init_all_groups().unwrap();
    assert_eq!(m.run_ticks(), 10);

    let a = CountingEntity::new(1, 0);
    let b = CountingEntity::new(2, 0);
    let (short_ticks, _, _) = a.logs();
    let (long_ticks, _, _) = b.logs();
    short.init_workers(LoadParams::empty().with(Box::new(a))).unwrap();
    long.init_workers(LoadParams::empty().with(Box::new(b))).unwrap();
    m.start_all_work_groups().unwrap();

    let mut active = Vec::new();
    while !m.is_finished() {
        active.push(m.wait_all_groups().unwrap().active_groups);
    }
    assert_eq!(active, vec![2, 1, 2, 1, 1, 0, 1, 0, 1, 0]);
    assert_eq!(read_log(&short_ticks), vec![0, 1, 2, 3]);
    assert_eq!(read_log(&long_ticks), vec![0, 2, 4, 6, 8]);
}

#[test]
fn frame_init_runs_once_per_entity() {
    for single_threaded in [true, false] {
        let mut m = manager(single_threaded);
        let group = m.new_work_group(WorkGroupConfig::new(3, 12, 2)).unwrap();
        m.init_all_groups().unwrap();
        let entities: Vec<_> = (0..9).map(|i| CountingEntity::new(i, 0)).collect();
        let inits: Vec<_> = entities.iter().map(|e| Arc::clone(&e.inits)).collect();
        group.init_workers(LoadParams::new(boxed(entities))).unwrap();
        m.start_all_work_groups().unwrap();
        m.run_to_completion().unwrap();
        for init in inits {
            assert_eq!(init.load(std::sync::atomic::Ordering::Relaxed), 1);
        }
    }
}
