//! Single-peak fits on sampled spectra.

use ge_calib::{
    FitMethod, FitPeaksOptions, PeakRequest, Stage, StagedFitOptions, StagedFitter, WindowSpec,
    fit_peaks,
};
use ge_core::{CollectingSink, NullSink};
use ge_inference::Minimizer;
use ge_shapes::ShapeModel;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

/// Gaussian line at `mu` on a flat continuum over `[lo, hi)`.
fn line_on_flat(mu: f64, sigma: f64, n_sig: usize, lo: f64, hi: f64, n_bkg: usize, seed: u64) -> Vec<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let peak = Normal::new(mu, sigma).unwrap();
    let flat = Uniform::new(lo, hi).unwrap();
    let mut data: Vec<f64> = (0..n_sig).map(|_| peak.sample(&mut rng)).collect();
    data.extend((0..n_bkg).map(|_| flat.sample(&mut rng)));
    data
}

fn lenient() -> FitPeaksOptions {
    FitPeaksOptions { allowed_p_value: 1e-4, ..FitPeaksOptions::default() }
}

#[test]
fn unbinned_fit_recovers_centroid() {
    let data = line_on_flat(1000.0, 5.0, 10_000, 800.0, 1200.0, 8_000, 3);
    let request = PeakRequest {
        mode_guess: 1002.0,
        window: WindowSpec::Width(100.0),
        n_bins: 50,
        model: ShapeModel::GaussStep,
    };
    let fits = fit_peaks(&data, &[request], &lenient(), &Minimizer::default(), &NullSink);
    let fit = &fits[0];
    assert!(fit.valid, "rejected: {:?}", fit.reason);
    assert_eq!(fit.range, (952.0, 1052.0));
    assert_eq!(fit.bin_width, 2.0);

    let (mu, mu_err) = fit.centroid();
    assert!((mu - 1000.0).abs() < 3.0 * mu_err, "mu = {mu} ± {mu_err}");
    assert!(mu_err > 0.0 && mu_err < 0.2);
    let (fwhm, _) = fit.fwhm();
    assert!((fwhm - 2.3548 * 5.0).abs() < 0.5, "fwhm = {fwhm}");
}

#[test]
fn binned_fit_recovers_centroid() {
    let data = line_on_flat(1000.0, 5.0, 10_000, 800.0, 1200.0, 8_000, 5);
    let request = PeakRequest {
        mode_guess: 1000.0,
        window: WindowSpec::LeftRight(40.0, 60.0),
        n_bins: 50,
        model: ShapeModel::GaussStep,
    };
    let options = FitPeaksOptions { method: FitMethod::Binned, simplex: true, ..lenient() };
    let fits = fit_peaks(&data, &[request], &options, &Minimizer::default(), &NullSink);
    let fit = &fits[0];
    assert!(fit.valid, "rejected: {:?}", fit.reason);
    let (mu, mu_err) = fit.centroid();
    assert!((mu - 1000.0).abs() < 3.0 * mu_err, "mu = {mu} ± {mu_err}");
}

#[test]
fn batch_keeps_input_order() {
    let mut data = line_on_flat(500.0, 3.0, 6_000, 300.0, 1300.0, 10_000, 9);
    data.extend(line_on_flat(1100.0, 4.0, 6_000, 1050.0, 1150.0, 0, 10));
    let requests = [
        PeakRequest { mode_guess: 1100.0, window: WindowSpec::Width(80.0), n_bins: 40, model: ShapeModel::GaussStep },
        PeakRequest { mode_guess: 2000.0, window: WindowSpec::Width(80.0), n_bins: 40, model: ShapeModel::GaussStep },
        PeakRequest { mode_guess: 500.0, window: WindowSpec::Width(60.0), n_bins: 40, model: ShapeModel::GaussStep },
    ];
    let fits = fit_peaks(&data, &requests, &lenient(), &Minimizer::default(), &NullSink);
    assert_eq!(fits.len(), 3);
    assert!((fits[0].centroid().0 - 1100.0).abs() < 0.5);
    // Nothing to fit at 2000: the failure stays local.
    assert!(!fits[1].valid);
    assert!(fits[1].parameters.iter().all(|p| p.is_nan()));
    assert!((fits[2].centroid().0 - 500.0).abs() < 0.5);
}

#[test]
fn staged_fit_walks_tail_free_path() {
    let data = line_on_flat(200.0, 1.5, 5_000, 180.0, 220.0, 2_000, 21);
    let minimizer = Minimizer::default();
    let fitter = StagedFitter::new(&minimizer, StagedFitOptions { bin_width: 0.5, ..StagedFitOptions::default() });
    // A poor supplied guess loses against the fresh one.
    let bad_guess = [10.0, 190.0, 8.0, 10.0, 0.5, 0.0, 0.0];
    let staged = fitter
        .fit_unbinned(&data, ShapeModel::GaussStep, Some(&bad_guess), Some(200.0), (185.0, 215.0), &NullSink)
        .unwrap();
    assert_eq!(staged.model(), ShapeModel::GaussStep);
    assert!(!staged.tail_dropped);
    assert_eq!(staged.trace, vec![Stage::Guessing, Stage::FittingNoTail, Stage::Arbitrating, Stage::Done]);
    assert!(staged.selected.valid);
    assert!((staged.parameters()[1] - 200.0).abs() < 3.0 * staged.uncertainties()[1]);
    assert_eq!(staged.parameters()[5], 185.0);
    assert_eq!(staged.parameters()[6], 215.0);
}

#[test]
fn tail_is_dropped_on_gaussian_data() {
    let data = line_on_flat(200.0, 1.5, 5_000, 180.0, 220.0, 2_000, 33);
    let minimizer = Minimizer::default();
    let fitter = StagedFitter::new(&minimizer, StagedFitOptions { bin_width: 0.5, ..StagedFitOptions::default() });
    let sink = CollectingSink::new();
    let staged = fitter
        .fit_unbinned(&data, ShapeModel::Radford, None, Some(200.0), (185.0, 215.0), &sink)
        .unwrap();
    assert_eq!(staged.requested, ShapeModel::Radford);
    assert!(staged.tail_dropped);
    assert_eq!(staged.model(), ShapeModel::GaussStep);
    assert_eq!(staged.parameters().len(), 7);
    assert_eq!(staged.trace.last(), Some(&Stage::Done));
    assert!(staged.trace.contains(&Stage::FittingTailed));
}
