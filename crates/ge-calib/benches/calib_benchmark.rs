use criterion::{Criterion, criterion_group, criterion_main};
use ge_calib::{StagedFitOptions, StagedFitter, poly_match, reference::TH228};
use ge_core::NullSink;
use ge_inference::Minimizer;
use ge_shapes::ShapeModel;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use std::hint::black_box;

fn bench_poly_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("calib_poly_match");

    // Detected positions: every Th-228 line plus two spurious maxima.
    let mut detected: Vec<f64> = TH228.iter().map(|e| (e - 1.2) / 0.3312).collect();
    detected.extend([150.0, 4000.0]);
    detected.sort_by(f64::total_cmp);

    for deg in [0, 1, 2] {
        group.bench_function(format!("th228_deg{deg}"), |b| {
            b.iter(|| black_box(poly_match(&detected, &TH228, deg, 1e-5, 2.0).unwrap()))
        });
    }
    group.finish();
}

fn bench_staged_fit(c: &mut Criterion) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let peak = Normal::new(1000.0, 3.0).unwrap();
    let flat = Uniform::new(960.0, 1040.0).unwrap();
    let mut data: Vec<f64> = (0..4_000).map(|_| peak.sample(&mut rng)).collect();
    data.extend((0..2_000).map(|_| flat.sample(&mut rng)));

    let minimizer = Minimizer::default();
    let fitter = StagedFitter::new(&minimizer, StagedFitOptions { bin_width: 1.0, ..Default::default() });

    let mut group = c.benchmark_group("calib_staged_fit");
    group.sample_size(10);
    for model in [ShapeModel::GaussStep, ShapeModel::Radford] {
        group.bench_function(model.name(), |b| {
            b.iter(|| {
                black_box(
                    fitter.fit_unbinned(&data, model, None, Some(1000.0), (970.0, 1030.0), &NullSink),
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_poly_match, bench_staged_fit);
criterion_main!(benches);
