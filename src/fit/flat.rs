//! Age-independent fits, one per subject.
//!
//! A flat fit is the backfitting engine with every parameter reduced to an
//! intercept and unit prior weights. Subjects are independent, so they are
//! fitted in parallel and gathered back in subject-id order. A failing subject
//! does not abort the batch: its error is stored next to its id.

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{DistributionParams, FitConfig, Param, Sample};
use crate::error::{FitError, Result};
use crate::family::Family;
use crate::fit::backfit::{self, BackfitProblem, BackfitSettings};

/// Relative distance to `tau_min`/`tau_max` at which a flat fit counts as
/// having ended on the bound.
const TAU_BOUND_MARGIN: f64 = 0.01;

/// Parameters estimated from a single sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatFit {
    pub family: Family,
    pub params: DistributionParams,
    /// Global deviance `-2 log L` at the estimate.
    pub deviance: f64,
    pub cycles: usize,
    pub n: usize,
    /// `tau` ended at (or within `TAU_BOUND_MARGIN` of) the admissible range.
    /// Such estimates say little about the kurtosis of the subject.
    #[serde(default)]
    pub tau_at_bound: bool,
}

/// Outcome of fitting one subject.
#[derive(Debug, Clone)]
pub struct SubjectFit {
    pub subject_id: String,
    pub age: f64,
    pub n: usize,
    pub outcome: Result<FlatFit>,
}

impl SubjectFit {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn fit(&self) -> Option<&FlatFit> {
        self.outcome.as_ref().ok()
    }
}

/// Fit `config.family` to `values` with every parameter constant.
pub fn fit_flat(values: &[f64], config: &FitConfig) -> Result<FlatFit> {
    let n = values.len();
    if n < config.min_sample_size {
        return Err(FitError::InsufficientData(format!(
            "sample has {n} values, at least {} required",
            config.min_sample_size
        )));
    }

    let family = config.family;
    let ones = vec![1.0; n];
    let start = family.initial_params(values, &ones)?;
    let problem = BackfitProblem::new(
        family,
        vec![0.0; n],
        values.to_vec(),
        ones,
        [None, None, None, None],
        config.penalty_order,
        BackfitSettings::from_config(config, config.flat_max_cycles)?,
    )?;

    let state = backfit::run(&problem, problem.initial_state(&start)?)?;
    let mut params = DistributionParams::new(0.0, 0.0, 0.0, 0.0);
    for p in Param::ALL {
        params.set(p, family.link(p).inverse(state.terms[p.index()].eta(0.0)));
    }

    let params = family.normalize(params);
    let tau_at_bound = family.is_active(Param::Tau)
        && (params.tau <= config.tau_min * (1.0 + TAU_BOUND_MARGIN)
            || params.tau >= config.tau_max / (1.0 + TAU_BOUND_MARGIN));
    if tau_at_bound {
        debug!("flat fit ended with tau={:.4} at the admissible bound", params.tau);
    }

    Ok(FlatFit {
        family,
        params,
        deviance: state.deviance,
        cycles: state.cycles,
        n,
        tau_at_bound,
    })
}

/// Fit one subject's sample.
pub fn fit_sample(sample: &Sample, config: &FitConfig) -> Result<FlatFit> {
    fit_flat(sample.values(), config)
}

/// Fit every subject in parallel; results are sorted by subject id.
pub fn fit_subjects(samples: &[Sample], config: &FitConfig) -> Vec<SubjectFit> {
    let mut fits: Vec<SubjectFit> = samples
        .par_iter()
        .map(|sample| {
            let outcome = fit_sample(sample, config);
            match &outcome {
                Ok(fit) => debug!(
                    "subject {}: mu={:.4} sigma={:.4} nu={:.4} tau={:.4} ({} cycles)",
                    sample.subject_id(),
                    fit.params.mu,
                    fit.params.sigma,
                    fit.params.nu,
                    fit.params.tau,
                    fit.cycles
                ),
                Err(e) => debug!("subject {}: {e}", sample.subject_id()),
            }
            SubjectFit {
                subject_id: sample.subject_id().to_string(),
                age: sample.age(),
                n: sample.len(),
                outcome,
            }
        })
        .collect();
    fits.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));

    let ok = fits.iter().filter(|f| f.is_ok()).count();
    info!("fitted {ok} of {} subjects ({})", fits.len(), config.family.display_name());
    fits
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn bcpe_draws(params: DistributionParams, n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let opts = crate::math::RootOptions::default();
        (0..n)
            .map(|_| Family::Bcpe.sample(&mut rng, &params, &opts).unwrap())
            .collect()
    }

    #[test]
    fn recovers_location_and_scale() {
        let truth = DistributionParams::new(0.5, 0.2, 1.0, 2.0);
        let values = bcpe_draws(truth, 500, 2024);
        let fit = fit_flat(&values, &FitConfig::default()).unwrap();
        assert!((0.47..=0.53).contains(&fit.params.mu), "mu={}", fit.params.mu);
        assert!((0.17..=0.23).contains(&fit.params.sigma), "sigma={}", fit.params.sigma);
        assert!(fit.cycles <= 200);
    }

    #[test]
    fn small_samples_never_panic_and_keep_tau_in_range() {
        let truth = DistributionParams::new(0.5, 0.2, 1.0, 2.0);
        let config = FitConfig::default();
        for seed in [83, 100, 190, 288] {
            let values = bcpe_draws(truth, 30, seed);
            match fit_flat(&values, &config) {
                Ok(fit) => {
                    let tau = fit.params.tau;
                    assert!(tau.is_finite(), "seed {seed}: tau={tau}");
                    let (lo, hi) = (config.tau_min * (1.0 - 1e-9), config.tau_max * (1.0 + 1e-9));
                    assert!((lo..=hi).contains(&tau), "seed {seed}: tau={tau}");
                    assert!(fit.deviance.is_finite());
                }
                Err(e) => assert!(
                    matches!(
                        e,
                        FitError::ConvergenceFailure { .. } | FitError::NumericalNonConvergence(_)
                    ),
                    "seed {seed}: {e}"
                ),
            }
        }
    }

    #[test]
    fn batch_survives_subjects_with_runaway_tau() {
        let truth = DistributionParams::new(0.5, 0.2, 1.0, 2.0);
        let samples: Vec<Sample> = [83u64, 100, 190, 288, 7]
            .iter()
            .map(|&seed| {
                let age = 20.0 + seed as f64 / 10.0;
                Sample::new(format!("s{seed:03}"), age, bcpe_draws(truth, 30, seed)).unwrap()
            })
            .collect();
        let fits = fit_subjects(&samples, &FitConfig::default());
        assert_eq!(fits.len(), 5);
        for f in fits.iter().filter_map(|f| f.fit()) {
            assert!(f.params.tau <= FitConfig::default().tau_max * (1.0 + 1e-9));
        }
    }

    #[test]
    fn tau_at_bound_is_only_flagged_for_bcpe() {
        let values = bcpe_draws(DistributionParams::new(1.0, 0.15, 1.0, 2.0), 80, 5);
        let config = FitConfig {
            family: Family::Bccg,
            ..FitConfig::default()
        };
        let fit = fit_flat(&values, &config).unwrap();
        assert!(!fit.tau_at_bound);
        assert_eq!(fit.params.tau, 2.0);
    }

    #[test]
    fn small_samples_are_rejected() {
        let err = fit_flat(&[0.4, 0.5, 0.6], &FitConfig::default()).unwrap_err();
        assert!(matches!(err, FitError::InsufficientData(_)));
    }

    #[test]
    fn normal_family_matches_moments() {
        let config = FitConfig {
            family: Family::No,
            outer_tol: 1e-8,
            inner_tol: 1e-8,
            ..FitConfig::default()
        };
        let values: Vec<f64> = (0..40).map(|i| (i as f64 * 0.37).sin() + 2.0).collect();
        let fit = fit_flat(&values, &config).unwrap();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let sd = (values.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n).sqrt();
        assert!((fit.params.mu - mean).abs() < 1e-4);
        assert!((fit.params.sigma - sd).abs() < 1e-4);
        assert_eq!((fit.params.nu, fit.params.tau), (1.0, 2.0));
    }

    #[test]
    fn batch_keeps_failures_and_sorts_by_subject() {
        let truth = DistributionParams::new(1.0, 0.15, 1.0, 2.0);
        let samples = vec![
            Sample::new("s2", 40.0, bcpe_draws(truth, 60, 1)).unwrap(),
            Sample::new("s1", 30.0, bcpe_draws(truth, 60, 2)).unwrap(),
            Sample::new("s0", 50.0, vec![1.0, 1.1]).unwrap(),
        ];
        let config = FitConfig {
            family: Family::Bccg,
            ..FitConfig::default()
        };
        let fits = fit_subjects(&samples, &config);
        let ids: Vec<&str> = fits.iter().map(|f| f.subject_id.as_str()).collect();
        assert_eq!(ids, ["s0", "s1", "s2"]);
        assert!(matches!(fits[0].outcome, Err(FitError::InsufficientData(_))));
        assert!(fits[1].is_ok() && fits[2].is_ok());
        assert_eq!(fits[1].age, 30.0);
    }
}
