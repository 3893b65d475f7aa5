//! Age-effect screening.
//!
//! Before the population fit we ask, for every parameter, whether the
//! per-subject estimates change with age at all. Each parameter (on its link
//! scale) is regressed on subject age with a P-spline whose smoothing is
//! chosen by GCV. The parameter becomes age-dependent in the population model
//! when the fit explains at least `effect_size_threshold` of the variance.
//!
//! Flat fits whose `tau` ended on the admissible bound are left out of the
//! `tau` regression; when too few remain, `tau` stays constant.
//!
//! The F statistic `((TSS - RSS)/(edf - 1)) / (RSS/(n - edf))` and its p-value
//! are reported alongside R² but do not drive the decision.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::domain::{FitConfig, LinkKind, LinkSpec, Param};
use crate::error::{FitError, Result};
use crate::fit::population::distinct_ages;
use crate::fit::selection::{SmoothingCriterion, select_smoothing};
use crate::fit::{FlatFit, SubjectFit};
use crate::math::{PSplineBasis, WeightedGram, difference_penalty};

/// Relative floor below which the total sum of squares counts as zero.
const ZERO_VARIANCE_TOL: f64 = 1e-12;

/// Smooth regression summary for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectSize {
    pub r_squared: f64,
    pub edf: f64,
    pub lambda: f64,
    pub f_statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub n: usize,
}

/// Screening outcome for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamScreen {
    pub param: Param,
    pub link: LinkKind,
    /// `None` for parameters the family does not estimate, or when too few
    /// usable estimates remain.
    pub effect: Option<EffectSize>,
    /// Subject estimates left out of the regression.
    #[serde(default)]
    pub excluded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenReport {
    pub threshold: f64,
    pub n_subjects: usize,
    pub entries: Vec<ParamScreen>,
}

impl ScreenReport {
    /// Recommended link per parameter.
    pub fn links(&self) -> LinkSpec {
        self.entries
            .iter()
            .fold(LinkSpec::all_constant(), |acc, e| acc.with(e.param, e.link))
    }

    pub fn get(&self, param: Param) -> Option<&ParamScreen> {
        self.entries.iter().find(|e| e.param == param)
    }
}

/// P-spline regression of `values` on `ages` with GCV smoothing.
pub fn effect_size(ages: &[f64], values: &[f64], config: &FitConfig) -> Result<EffectSize> {
    if ages.len() != values.len() {
        return Err(FitError::InvalidInput(format!(
            "{} ages but {} values",
            ages.len(),
            values.len()
        )));
    }
    let n = values.len();
    let distinct = distinct_ages(ages);
    if distinct < config.min_distinct_ages {
        return Err(FitError::InsufficientData(format!(
            "{distinct} distinct ages, at least {} required for screening",
            config.min_distinct_ages
        )));
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(FitError::InvalidInput(format!("non-finite estimate {bad}")));
    }

    let lo = ages.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = ages.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let basis = PSplineBasis::new(lo, hi, config.spline_segments, config.spline_degree)?;
    let penalty = difference_penalty(basis.len(), config.penalty_order)?;
    let gram = WeightedGram::from_design(&basis.design(ages), &vec![1.0; n], values);
    let choice = select_smoothing(&gram, &penalty, &config.lambda_grid()?, SmoothingCriterion::Gcv)?;

    let mean = values.iter().sum::<f64>() / n as f64;
    let tss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    let rss = choice.fit.rss;
    let edf = choice.fit.edf;
    // Identical estimates leave rounding noise in `tss`; treat it as zero.
    let flat = tss <= ZERO_VARIANCE_TOL * n as f64 * (1.0 + mean * mean);
    let r_squared = if flat { 0.0 } else { (1.0 - rss / tss).clamp(0.0, 1.0) };

    let df_model = edf - 1.0;
    let df_resid = n as f64 - edf;
    let f_statistic = (!flat && df_model > 1e-8 && df_resid > 0.0 && rss > 0.0)
        .then(|| ((tss - rss).max(0.0) / df_model) / (rss / df_resid));
    let p_value = f_statistic.and_then(|f| {
        FisherSnedecor::new(df_model, df_resid)
            .ok()
            .map(|dist| dist.sf(f))
    });

    Ok(EffectSize {
        r_squared,
        edf,
        lambda: choice.lambda,
        f_statistic,
        p_value,
        n,
    })
}

/// Screen every parameter of `config.family` using the successful subject fits.
pub fn screen_effects(fits: &[SubjectFit], config: &FitConfig) -> Result<ScreenReport> {
    let ok: Vec<(f64, &FlatFit)> =
        fits.iter().filter_map(|f| f.fit().map(|fit| (f.age, fit))).collect();
    let family = config.family;

    let mut entries = Vec::with_capacity(Param::ALL.len());
    for param in Param::ALL {
        if !family.is_active(param) {
            entries.push(ParamScreen {
                param,
                link: LinkKind::Constant,
                effect: None,
                excluded: 0,
            });
            continue;
        }
        let link = family.link(param);
        let usable: Vec<&(f64, &FlatFit)> = ok
            .iter()
            .filter(|(_, fit)| param != Param::Tau || !fit.tau_at_bound)
            .collect();
        let excluded = ok.len() - usable.len();
        let ages: Vec<f64> = usable.iter().map(|(age, _)| *age).collect();
        if excluded > 0 && distinct_ages(&ages) < config.min_distinct_ages {
            warn!(
                "{param}: {excluded} of {} estimates at the bound; kept constant",
                ok.len()
            );
            entries.push(ParamScreen {
                param,
                link: LinkKind::Constant,
                effect: None,
                excluded,
            });
            continue;
        }
        let values: Vec<f64> = usable.iter().map(|(_, fit)| link.link(fit.params.get(param))).collect();
        let effect = effect_size(&ages, &values, config)?;
        let kind = if effect.r_squared >= config.effect_size_threshold {
            LinkKind::Smooth
        } else {
            LinkKind::Constant
        };
        debug!(
            "{param}: R²={:.4} edf={:.2} p={:?} -> {kind:?}",
            effect.r_squared, effect.edf, effect.p_value
        );
        entries.push(ParamScreen {
            param,
            link: kind,
            effect: Some(effect),
            excluded,
        });
    }

    let report = ScreenReport {
        threshold: config.effect_size_threshold,
        n_subjects: ok.len(),
        entries,
    };
    let smooth: Vec<&str> = report
        .entries
        .iter()
        .filter(|e| e.link == LinkKind::Smooth)
        .map(|e| e.param.name())
        .collect();
    info!("screened {} subjects; age-dependent: {:?}", report.n_subjects, smooth);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DistributionParams;
    use crate::family::Family;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn ages(n: usize, rng: &mut StdRng) -> Vec<f64> {
        use rand::Rng;
        (0..n).map(|_| rng.gen_range(20.0..80.0)).collect()
    }

    #[test]
    fn null_trend_stays_below_threshold() {
        let config = FitConfig::default();
        let mut below = 0;
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let a = ages(200, &mut rng);
            let noise = Normal::new(0.0, 1.0).unwrap();
            let v: Vec<f64> = (0..200).map(|_| noise.sample(&mut rng)).collect();
            let effect = effect_size(&a, &v, &config).unwrap();
            if effect.r_squared < config.effect_size_threshold {
                below += 1;
            }
        }
        assert!(below >= 16, "only {below} of 20 null fits below threshold");
    }

    #[test]
    fn strong_trend_is_detected() {
        let mut rng = StdRng::seed_from_u64(77);
        let a = ages(200, &mut rng);
        let noise = Normal::new(0.0, 0.1).unwrap();
        let v: Vec<f64> = a.iter().map(|x| 0.01 * x + noise.sample(&mut rng)).collect();
        let effect = effect_size(&a, &v, &FitConfig::default()).unwrap();
        assert!(effect.r_squared > 0.25, "R²={}", effect.r_squared);
        assert!(effect.p_value.unwrap() < 1e-6);
    }

    #[test]
    fn identical_estimates_explain_nothing() {
        let a: Vec<f64> = (0..40).map(|i| 20.0 + 1.5 * i as f64).collect();
        for level in [0.1f64, 0.2, 3.7] {
            let effect = effect_size(&a, &vec![level.ln(); 40], &FitConfig::default()).unwrap();
            assert_eq!(effect.r_squared, 0.0, "level {level}");
            assert!(effect.p_value.is_none());
        }
    }

    #[test]
    fn too_few_distinct_ages() {
        let a = [30.0, 30.0, 40.0, 40.0, 50.0, 50.0];
        let v = [1.0, 2.0, 1.5, 1.2, 0.8, 1.1];
        let err = effect_size(&a, &v, &FitConfig::default()).unwrap_err();
        assert!(matches!(err, FitError::InsufficientData(_)));
    }

    #[test]
    fn report_marks_inactive_parameters_constant() {
        let mut rng = StdRng::seed_from_u64(3);
        let fits: Vec<SubjectFit> = (0..40)
            .map(|i| {
                let age = 20.0 + i as f64 * 1.5;
                let mu = 0.5 + 0.01 * age + 0.01 * Normal::new(0.0, 1.0).unwrap().sample(&mut rng);
                SubjectFit {
                    subject_id: format!("s{i:02}"),
                    age,
                    n: 30,
                    outcome: Ok(FlatFit {
                        family: Family::Bccg,
                        params: DistributionParams::new(mu, 0.1, 1.0, 2.0),
                        deviance: 0.0,
                        cycles: 3,
                        n: 30,
                        tau_at_bound: false,
                    }),
                }
            })
            .collect();
        let config = FitConfig {
            family: Family::Bccg,
            ..FitConfig::default()
        };
        let report = screen_effects(&fits, &config).unwrap();
        let links = report.links();
        assert_eq!(links.mu, LinkKind::Smooth);
        // Constant estimates explain nothing.
        assert_eq!(links.sigma, LinkKind::Constant);
        assert_eq!(links.tau, LinkKind::Constant);
        assert!(report.get(Param::Tau).unwrap().effect.is_none());
        assert_eq!(report.n_subjects, 40);
    }

    fn bcpe_fit(i: usize, tau: f64, tau_at_bound: bool) -> SubjectFit {
        let age = 20.0 + i as f64;
        SubjectFit {
            subject_id: format!("s{i:02}"),
            age,
            n: 30,
            outcome: Ok(FlatFit {
                family: Family::Bcpe,
                params: DistributionParams::new(0.5, 0.2, 1.0 + 0.01 * (i % 7) as f64, tau),
                deviance: 0.0,
                cycles: 5,
                n: 30,
                tau_at_bound,
            }),
        }
    }

    #[test]
    fn tau_estimates_on_the_bound_are_left_out() {
        let config = FitConfig::default();
        // Interior tau flat at 2; every fifth subject ran to the upper bound.
        let fits: Vec<SubjectFit> = (0..40)
            .map(|i| {
                if i % 5 == 0 {
                    bcpe_fit(i, config.tau_max, true)
                } else {
                    bcpe_fit(i, 2.0, false)
                }
            })
            .collect();
        let report = screen_effects(&fits, &config).unwrap();
        let tau = report.get(Param::Tau).unwrap();
        assert_eq!(tau.excluded, 8);
        assert_eq!(tau.link, LinkKind::Constant);
        assert_eq!(tau.effect.unwrap().r_squared, 0.0);
        assert_eq!(tau.effect.unwrap().n, 32);
        assert_eq!(report.get(Param::Mu).unwrap().excluded, 0);
    }

    #[test]
    fn tau_stays_constant_when_too_few_interior_estimates() {
        let config = FitConfig::default();
        let fits: Vec<SubjectFit> = (0..20)
            .map(|i| bcpe_fit(i, config.tau_max, i > 2))
            .collect();
        let report = screen_effects(&fits, &config).unwrap();
        let tau = report.get(Param::Tau).unwrap();
        assert!(tau.effect.is_none());
        assert_eq!(tau.excluded, 17);
        assert_eq!(tau.link, LinkKind::Constant);
    }
}
