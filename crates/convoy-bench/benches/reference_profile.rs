//! Criterion benchmarks for full base ticks of the reference layouts.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use convoy_bench::{reference_profile, stress_profile, Profile};

fn bench_tick_256(c: &mut Criterion) {
    let mut profile = reference_profile(42).unwrap();

    // Warm up: first tick admits every initial entity
    profile.manager.wait_all_groups().unwrap();

    c.bench_function("tick_256_walkers", |b| {
        b.iter(|| {
            let metrics = profile.manager.wait_all_groups().unwrap();
            black_box(&metrics);
        });
    });
}

fn bench_tick_256_single_threaded(c: &mut Criterion) {
    let mut profile = Profile::single_threaded(42).unwrap();
    profile.manager.wait_all_groups().unwrap();

    c.bench_function("tick_256_walkers_single_threaded", |b| {
        b.iter(|| {
            let metrics = profile.manager.wait_all_groups().unwrap();
            black_box(&metrics);
        });
    });
}

fn bench_tick_4096(c: &mut Criterion) {
    let mut profile = stress_profile(42).unwrap();
    profile.manager.wait_all_groups().unwrap();

    c.bench_function("tick_4096_walkers", |b| {
        b.iter(|| {
            let metrics = profile.manager.wait_all_groups().unwrap();
            black_box(&metrics);
        });
    });
}

fn bench_100_ticks_startup(c: &mut Criterion) {
    let mut group = c.benchmark_group("startup");
    group.sample_size(20);
    group.bench_function("build_run_100_ticks", |b| {
        b.iter(|| {
            let mut profile = Profile::build(42, 256, 1, 4, 100, false).unwrap();
            let metrics = profile.manager.run_to_completion().unwrap();
            black_box(metrics.entities_updated);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_tick_256,
    bench_tick_256_single_threaded,
    bench_tick_4096,
    bench_100_ticks_startup,
);
criterion_main!(benches);
