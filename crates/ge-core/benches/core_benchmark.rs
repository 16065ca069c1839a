use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ge_core::{Histogram, Polynomial};
use std::hint::black_box;

fn calibration_points(n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let truth = Polynomial::new(vec![1.5e-7, 0.3312, 0.8]);
    let x: Vec<f64> = (0..n).map(|i| 600.0 + 7400.0 * i as f64 / (n - 1) as f64).collect();
    let y = truth.eval_many(&x);
    let w = (0..n).map(|i| 1.0 / (0.05 + 1e-3 * i as f64)).collect();
    (x, y, w)
}

fn bench_polynomial_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("core_polynomial");

    for n in [4usize, 12, 64] {
        let (x, y, w) = calibration_points(n);
        group.bench_with_input(BenchmarkId::new("weighted_fit_deg2", n), &n, |b, _| {
            b.iter(|| black_box(Polynomial::fit_with_covariance(&x, &y, 2, Some(&w)).unwrap()))
        });
    }

    let p = Polynomial::new(vec![1.5e-7, 0.3312, 0.8]);
    group.bench_function("solve", |b| b.iter(|| black_box(p.solve(black_box(2614.5), 8000.0))));

    group.finish();
}

fn bench_noise_normalized(c: &mut Criterion) {
    let n = 16_384;
    let counts: Vec<f64> = (0..n).map(|i| ((i * 7919) % 97) as f64).collect();
    let edges: Vec<f64> = (0..=n).map(|i| i as f64 * 0.2).collect();
    let h = Histogram::with_poisson_variance(counts, edges).unwrap();

    c.bench_function("core_histogram/noise_normalized", |b| {
        b.iter(|| black_box(h.noise_normalized(1.0)))
    });
}

criterion_group!(benches, bench_polynomial_fit, bench_noise_normalized);
criterion_main!(benches);
