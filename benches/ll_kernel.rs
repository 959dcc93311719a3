//! Benchmarks using Criterion.
//!
//! The likelihood kernel's bulk fill dominates inference time on large
//! trees, so that is what gets measured, together with a forest MLE over
//! simulated trees.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use once_cell::sync::Lazy;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use gwtree::{CollapsedForest, LlKernel};

static SIMULATED_FOREST: Lazy<CollapsedForest> = Lazy::new(|| {
    let mut rng = SmallRng::seed_from_u64(17);
    CollapsedForest::simulate(0.4, 0.4, 200, &mut rng).expect("simulation parameters are valid")
});

pub fn bench_kernel_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_fill");
    for size in [16u32, 64, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, size| {
            b.iter(|| {
                let mut kernel = LlKernel::new(0.45, 0.35).expect("parameters in unit interval");
                kernel.fill(*size, *size);
                kernel
            });
        });
    }
    group.finish();
}

pub fn bench_forest_mle(c: &mut Criterion) {
    c.bench_function("forest_mle", |b| {
        b.iter(|| {
            let mut forest = SIMULATED_FOREST.clone();
            forest.mle(false).expect("simulated forest has a likelihood")
        });
    });
}

criterion_group!(benches, bench_kernel_fill, bench_forest_mle);
criterion_main!(benches);
