//! Convoy demo: two WorkGroups on one base clock.
//!
//! Demonstrates:
//!   1. A fine-grained "movement" group ticking every base tick
//!   2. A coarse "signals" group ticking every fifth tick, with an output
//!      hook on its macro tick
//!   3. Entities joining on their start times through a periodic loader
//!   4. Reading committed buffered state after the run
//!
//! Run with:
//!   RUST_LOG=convoy_engine=debug cargo run --example staggered_groups

use convoy_core::GroupId;
use convoy_engine::{
    GroupServices, HookContext, LoadParams, ManagerConfig, PeriodicLoader, WorkGroupConfig,
    WorkGroupManager,
};
use convoy_test_utils::{boxed, walker_ring, AddTickDivisibleAgent, CountingEntity};
use tracing_subscriber::EnvFilter;

// ─── Parameters ─────────────────────────────────────────────────

const TICK_MS: u64 = 100;
const TOTAL_TICKS: u64 = 60;
const SIGNAL_STEP: u64 = 5;
const WALKERS: usize = 32;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut manager = WorkGroupManager::new(ManagerConfig {
        base_granularity_ms: TICK_MS,
        ..ManagerConfig::default()
    })?;

    let movement = manager.new_work_group(WorkGroupConfig::new(4, TOTAL_TICKS, 1))?;
    let signals = manager.new_work_group_with_services(
        WorkGroupConfig::new(1, TOTAL_TICKS, SIGNAL_STEP),
        GroupServices::none().with_macro_tick(|ctx: &HookContext<'_>| {
            let on_workers = ctx.registry.assigned_in(GroupId(0)).len();
            println!("t={:>5}ms  movement entities on workers: {on_workers}", ctx.now.ms);
        }),
    )?;
    manager.init_all_groups()?;

    // Walkers start at 0; commuters trickle in every 500ms.
    let (mut entities, positions) = walker_ring(WALKERS, 42);
    entities.extend(boxed((0..10).map(|i| CountingEntity::new(1_000 + i, i * 500))));
    movement.init_workers(PeriodicLoader::new(entities))?;

    let signal = AddTickDivisibleAgent::new(9_000, SIGNAL_STEP);
    let signal_total = signal.total();
    signals.init_workers(LoadParams::empty().with(Box::new(signal)))?;

    manager.start_all_work_groups()?;
    let metrics = manager.run_to_completion()?;

    println!();
    println!("ticks run:          {}", metrics.ticks_completed);
    println!("entity updates:     {}", metrics.entities_updated);
    println!("admitted mid-run:   {}", metrics.admitted);
    println!("peak live entities: {}", metrics.peak_live_entities);
    println!("signal total:       {}", signal_total.get());
    let spread = positions.iter().map(|p| p.get()).max().unwrap_or(0)
        - positions.iter().map(|p| p.get()).min().unwrap_or(0);
    println!("walker spread:      {spread}");

    let report = manager.finish();
    println!("threads joined:     {}", report.threads_joined);
    Ok(())
}
