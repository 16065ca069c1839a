//! Parameter recovery for the peak-shape likelihoods on sampled spectra.

use approx::assert_relative_eq;
use ge_inference::{ErrorDef, Minimizer, Strategy};
use ge_shapes::{BinSpec, ExtendedBinnedNll, ExtendedUnbinnedNll, ShapeModel, histogram};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

const LO: f64 = 85.0;
const HI: f64 = 115.0;

fn sample_peak(n_sig: usize, n_bkg: usize, seed: u64) -> Vec<f64> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let peak = Normal::new(100.0, 1.5).unwrap();
    let flat = Uniform::new(LO, HI).unwrap();
    let mut data: Vec<f64> = Vec::with_capacity(n_sig + n_bkg);
    while data.len() < n_sig {
        let x = peak.sample(&mut rng);
        if x > LO && x < HI {
            data.push(x);
        }
    }
    data.extend((0..n_bkg).map(|_| flat.sample(&mut rng)));
    data
}

#[test]
fn unbinned_gauss_step_recovers_peak() {
    let data = sample_peak(4000, 2000, 7);
    let hist = histogram(&data, (LO, HI), BinSpec::Width(0.5)).unwrap();
    let minimizer = Minimizer::default();
    let model = ShapeModel::GaussStep;
    let guess = model.guess(&hist, (LO, HI), None, &minimizer).unwrap();

    let cost = ExtendedUnbinnedNll::new(model, &data);
    let fit = minimizer
        .minimize(
            &cost,
            &guess,
            &model.bounds(&guess),
            &model.fixed_mask(),
            ErrorDef::Likelihood,
            Strategy::SimplexThenGradient,
        )
        .unwrap();

    assert!(fit.converged);
    let (mu, mu_err) = model.mean_and_uncertainty(&fit.parameters, &fit.uncertainties);
    assert!((mu - 100.0).abs() < 3.0 * mu_err + 1e-3, "mu = {mu} ± {mu_err}");
    assert_relative_eq!(mu_err, 1.5 / 4000f64.sqrt(), max_relative = 0.2);
    assert_relative_eq!(fit.parameters[2], 1.5, max_relative = 0.05);
    assert_relative_eq!(fit.parameters[0], 4000.0, max_relative = 0.05);

    let (total, _) = model.total_event_count(&fit.parameters, &fit.uncertainties);
    assert_relative_eq!(total, 6000.0, max_relative = 1e-3);
    assert_eq!(fit.parameters[5], LO);
    assert_eq!(fit.parameters[6], HI);
}

#[test]
fn binned_gauss_step_recovers_peak() {
    let data = sample_peak(4000, 2000, 11);
    let hist = histogram(&data, (LO, HI), BinSpec::Count(60)).unwrap();
    let minimizer = Minimizer::default();
    let model = ShapeModel::GaussStep;
    let guess = model.guess(&hist, (LO, HI), None, &minimizer).unwrap();

    let cost = ExtendedBinnedNll::new(model, &hist);
    let fit = minimizer
        .minimize(
            &cost,
            &guess,
            &model.bounds(&guess),
            &model.fixed_mask(),
            ErrorDef::Likelihood,
            Strategy::Gradient,
        )
        .unwrap();

    assert!(fit.converged);
    assert!((fit.parameters[1] - 100.0).abs() < 3.0 * fit.uncertainties[1] + 1e-3);
    let gof = model.goodness_of_fit(&hist, &fit.parameters).unwrap();
    // 60 bins, 5 free parameters: a sensible fit has χ²/dof of order one.
    assert!(gof.statistic / gof.dof < 2.5, "chi2/dof = {}", gof.statistic / gof.dof);
}
