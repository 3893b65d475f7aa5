//! Pooled distributional regression across all subjects.
//!
//! Every observation of every subject enters one likelihood, weighted by the
//! configured [`WeightScheme`](crate::domain::WeightScheme). Each active
//! parameter is either an intercept or a P-spline in age, as chosen by the
//! [`LinkSpec`]; the fit itself is the backfitting engine.

use log::info;

use crate::domain::{FitConfig, LinkKind, LinkSpec, Param, Sample};
use crate::error::{FitError, Result};
use crate::fit::backfit::{self, BackfitProblem, BackfitSettings};
use crate::fit::model::{FitDiagnostics, FittedModel};
use crate::math::PSplineBasis;

/// Number of distinct values in `ages`.
pub fn distinct_ages(ages: &[f64]) -> usize {
    let mut sorted = ages.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}

/// Fit the population model.
///
/// Link kinds given for parameters the family does not estimate are ignored
/// (those parameters stay pinned).
pub fn fit_population(samples: &[Sample], links: &LinkSpec, config: &FitConfig) -> Result<FittedModel> {
    config.validate()?;
    if samples.is_empty() {
        return Err(FitError::InsufficientData("no samples to pool".to_string()));
    }

    let family = config.family;
    let links = Param::ALL.iter().fold(LinkSpec::all_constant(), |acc, &p| {
        if family.is_active(p) {
            acc.with(p, links.get(p))
        } else {
            acc
        }
    });

    let total: usize = samples.iter().map(Sample::len).sum();
    let mut ages = Vec::with_capacity(total);
    let mut values = Vec::with_capacity(total);
    let mut weights = Vec::with_capacity(total);
    for sample in samples {
        let w = config.weighting.weight(sample.len());
        for &y in sample.values() {
            ages.push(sample.age());
            values.push(y);
            weights.push(w);
        }
    }

    let subject_ages: Vec<f64> = samples.iter().map(Sample::age).collect();
    let lo = subject_ages.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = subject_ages.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let age_range = if links.any_smooth() {
        let distinct = distinct_ages(&subject_ages);
        if distinct < config.min_distinct_ages {
            return Err(FitError::InsufficientData(format!(
                "{distinct} distinct ages, at least {} required for an age-dependent fit",
                config.min_distinct_ages
            )));
        }
        Some((lo, hi))
    } else {
        None
    };

    let mut smooth: [Option<PSplineBasis>; 4] = [None, None, None, None];
    if let Some((lo, hi)) = age_range {
        for p in Param::ALL {
            if links.get(p) == LinkKind::Smooth {
                smooth[p.index()] =
                    Some(PSplineBasis::new(lo, hi, config.spline_segments, config.spline_degree)?);
            }
        }
    }

    let start = family.initial_params(&values, &weights)?;
    let problem = BackfitProblem::new(
        family,
        ages,
        values,
        weights,
        smooth,
        config.penalty_order,
        BackfitSettings::from_config(config, config.population_max_cycles)?,
    )?;
    let state = backfit::run(&problem, problem.initial_state(&start)?)?;

    let edf = Param::ALL.map(|p| state.terms[p.index()].edf());
    let diagnostics = FitDiagnostics {
        cycles: state.cycles,
        deviance: state.deviance,
        penalized_deviance: state.penalized_deviance,
        edf,
        total_edf: edf.iter().sum(),
        history: state.history.clone(),
        inner_cap_hits: state.inner_cap_hits,
        n_observations: problem.len(),
        n_subjects: samples.len(),
    };
    info!(
        "population fit ({}): {} subjects, {} observations, {} cycles, deviance {:.4}, edf {:.2}",
        family.display_name(),
        diagnostics.n_subjects,
        diagnostics.n_observations,
        diagnostics.cycles,
        diagnostics.deviance,
        diagnostics.total_edf
    );

    Ok(FittedModel::new(family, links, state.terms, age_range, diagnostics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DistributionParams, WeightScheme};
    use crate::family::Family;
    use crate::fit::flat::fit_flat;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn cohort(subjects: usize, per_subject: usize, slope: f64, seed: u64) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..subjects)
            .map(|s| {
                let age = 20.0 + 60.0 * s as f64 / (subjects - 1) as f64;
                let mu = 1.0 + slope * (age - 20.0);
                let dist = Normal::new(mu, 0.1 * mu).unwrap();
                let values = (0..per_subject).map(|_| dist.sample(&mut rng)).collect();
                Sample::new(format!("s{s:03}"), age, values).unwrap()
            })
            .collect()
    }

    #[test]
    fn constant_links_reproduce_the_pooled_flat_fit() {
        let samples = cohort(12, 15, 0.0, 9);
        let config = FitConfig {
            family: Family::Bccg,
            weighting: WeightScheme::Unit,
            population_max_cycles: 200,
            ..FitConfig::default()
        };
        let model = fit_population(&samples, &LinkSpec::all_constant(), &config).unwrap();
        let pooled: Vec<f64> = samples.iter().flat_map(|s| s.values().to_vec()).collect();
        let flat = fit_flat(&pooled, &config).unwrap();

        let p = model.params_at(50.0);
        assert!((p.mu - flat.params.mu).abs() < 1e-9);
        assert!((p.sigma - flat.params.sigma).abs() < 1e-9);
        assert!((p.nu - flat.params.nu).abs() < 1e-9);
        assert!(model.age_range().is_none());
    }

    #[test]
    fn smooth_mu_tracks_a_linear_trend() {
        let samples = cohort(30, 20, 0.02, 4);
        let config = FitConfig {
            family: Family::Bccg,
            ..FitConfig::default()
        };
        let links = LinkSpec::all_constant().with(Param::Mu, LinkKind::Smooth);
        let model = fit_population(&samples, &links, &config).unwrap();
        assert_eq!(model.age_range(), Some((20.0, 80.0)));
        for &age in &[25.0, 50.0, 75.0] {
            let expected = 1.0 + 0.02 * (age - 20.0);
            let mu = model.eval(Param::Mu, age);
            assert!((mu - expected).abs() < 0.05 * expected, "mu({age})={mu}");
        }
        assert!(model.diagnostics().edf[Param::Mu.index()] >= 1.9);
        assert!(model.diagnostics().cycles <= config.population_max_cycles);
    }

    #[test]
    fn smooth_links_need_enough_distinct_ages() {
        let truth = DistributionParams::new(1.0, 0.1, 1.0, 2.0);
        let samples: Vec<Sample> = (0..3)
            .map(|s| {
                let values = (0..20).map(|i| truth.mu + 0.01 * i as f64).collect();
                Sample::new(format!("s{s}"), 30.0 + s as f64, values).unwrap()
            })
            .collect();
        let links = LinkSpec::all_constant().with(Param::Sigma, LinkKind::Smooth);
        let err = fit_population(&samples, &links, &FitConfig::default()).unwrap_err();
        assert!(matches!(err, FitError::InsufficientData(_)));
    }

    #[test]
    fn inactive_smooth_links_are_ignored() {
        let samples = cohort(8, 15, 0.0, 21);
        let config = FitConfig {
            family: Family::No,
            ..FitConfig::default()
        };
        let model = fit_population(&samples, &LinkSpec::all_constant().with(Param::Tau, LinkKind::Smooth), &config)
            .unwrap();
        assert_eq!(model.links().tau, LinkKind::Constant);
        assert!(model.age_range().is_none());
    }

    #[test]
    fn empty_pool_is_insufficient() {
        let err = fit_population(&[], &LinkSpec::all_constant(), &FitConfig::default()).unwrap_err();
        assert!(matches!(err, FitError::InsufficientData(_)));
    }

    #[test]
    fn distinct_age_count() {
        assert_eq!(distinct_ages(&[3.0, 1.0, 3.0, 2.0, 1.0]), 3);
    }
}
