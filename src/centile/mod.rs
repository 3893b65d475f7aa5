//! Centile curves from a fitted model.
//!
//! For every requested age the model's parameters are evaluated and the cdf is
//! inverted at every requested probability level. The `(age, level)` pairs are
//! independent and are solved in parallel.
//!
//! Thresholds at one age must not decrease with the level. A violation means
//! the root-finder returned an inaccurate value; it is kept and reported as a
//! [`MonotonicityWarning`] on the curve of the higher level.

use log::warn;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};
use crate::fit::FittedModel;
use crate::math::RootOptions;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonotonicityWarning {
    pub age: f64,
    pub level: f64,
    pub value: f64,
    /// Next lower level at the same age and its threshold.
    pub lower_level: f64,
    pub lower_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentileCurve {
    pub level: f64,
    pub ages: Vec<f64>,
    pub values: Vec<f64>,
    pub warnings: Vec<MonotonicityWarning>,
}

/// Thresholds for one age, in the order of [`CentileSet::levels`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentileRow {
    pub age: f64,
    pub thresholds: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentileSet {
    pub ages: Vec<f64>,
    pub curves: Vec<CentileCurve>,
}

impl CentileSet {
    pub fn levels(&self) -> Vec<f64> {
        self.curves.iter().map(|c| c.level).collect()
    }

    pub fn curve(&self, level: f64) -> Option<&CentileCurve> {
        self.curves.iter().find(|c| c.level == level)
    }

    /// One record per age.
    pub fn rows(&self) -> Vec<CentileRow> {
        self.ages
            .iter()
            .enumerate()
            .map(|(i, &age)| CentileRow {
                age,
                thresholds: self.curves.iter().map(|c| c.values[i]).collect(),
            })
            .collect()
    }

    pub fn warning_count(&self) -> usize {
        self.curves.iter().map(|c| c.warnings.len()).sum()
    }
}

/// `points` evenly spaced ages from `lo` to `hi` inclusive.
pub fn age_grid(lo: f64, hi: f64, points: usize) -> Result<Vec<f64>> {
    if !(lo.is_finite() && hi.is_finite() && hi >= lo) || points < 2 {
        return Err(FitError::InvalidInput(format!(
            "age grid needs finite lo <= hi and >= 2 points, got [{lo}, {hi}] x {points}"
        )));
    }
    let step = (hi - lo) / (points - 1) as f64;
    Ok((0..points)
        .map(|i| if i + 1 == points { hi } else { lo + step * i as f64 })
        .collect())
}

fn validate_inputs(ages: &[f64], levels: &[f64]) -> Result<()> {
    if ages.is_empty() || levels.is_empty() {
        return Err(FitError::InvalidInput("ages and levels must be non-empty".to_string()));
    }
    if let Some(bad) = ages.iter().find(|a| !a.is_finite()) {
        return Err(FitError::InvalidInput(format!("non-finite age {bad}")));
    }
    if let Some(w) = ages.windows(2).find(|w| w[1] < w[0]) {
        return Err(FitError::InvalidInput(format!(
            "ages must be non-decreasing ({} follows {})",
            w[1], w[0]
        )));
    }
    if let Some(bad) = levels.iter().find(|p| !(p.is_finite() && **p > 0.0 && **p < 1.0)) {
        return Err(FitError::InvalidInput(format!("level {bad} is outside (0, 1)")));
    }
    Ok(())
}

/// Warnings for one age; `values[j]` is the threshold at `levels[j]`.
/// Returned pairs are `(curve index, warning)`.
fn monotonicity_warnings(age: f64, levels: &[f64], values: &[f64]) -> Vec<(usize, MonotonicityWarning)> {
    let mut order: Vec<usize> = (0..levels.len()).collect();
    order.sort_by(|&a, &b| levels[a].total_cmp(&levels[b]).then(a.cmp(&b)));

    order
        .windows(2)
        .filter(|pair| values[pair[1]] < values[pair[0]])
        .map(|pair| {
            let (lower, upper) = (pair[0], pair[1]);
            (
                upper,
                MonotonicityWarning {
                    age,
                    level: levels[upper],
                    value: values[upper],
                    lower_level: levels[lower],
                    lower_value: values[lower],
                },
            )
        })
        .collect()
}

/// Evaluate centile curves of `model` at `ages` for each of `levels`.
pub fn predict_centiles(
    model: &FittedModel,
    ages: &[f64],
    levels: &[f64],
    opts: &RootOptions,
) -> Result<CentileSet> {
    validate_inputs(ages, levels)?;

    let outside = ages.iter().filter(|&&a| model.is_extrapolating(a)).count();
    if outside > 0 {
        if let Some((lo, hi)) = model.age_range() {
            warn!(
                "{outside} of {} ages lie outside the training range [{lo}, {hi}]; parameters are extrapolated linearly",
                ages.len()
            );
        }
    }

    let k = levels.len();
    let family = model.family();
    let values: Vec<f64> = (0..ages.len() * k)
        .into_par_iter()
        .map(|idx| {
            let (i, j) = (idx / k, idx % k);
            family.quantile(levels[j], &model.params_at(ages[i]), opts)
        })
        .collect::<Result<Vec<f64>>>()?;

    let mut curves: Vec<CentileCurve> = levels
        .iter()
        .enumerate()
        .map(|(j, &level)| CentileCurve {
            level,
            ages: ages.to_vec(),
            values: (0..ages.len()).map(|i| values[i * k + j]).collect(),
            warnings: Vec::new(),
        })
        .collect();

    for (i, &age) in ages.iter().enumerate() {
        for (j, warning) in monotonicity_warnings(age, levels, &values[i * k..(i + 1) * k]) {
            warn!(
                "centile at level {} ({}) falls below level {} ({}) at age {age}",
                warning.level, warning.value, warning.lower_level, warning.lower_value
            );
            curves[j].warnings.push(warning);
        }
    }

    Ok(CentileSet {
        ages: ages.to_vec(),
        curves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DistributionParams, FitConfig, LinkKind, LinkSpec, Param, Sample};
    use crate::domain::DEFAULT_CENTILE_LEVELS;
    use crate::family::Family;
    use crate::fit::fit_population;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn median_of_log_normal_is_mu() {
        let model =
            FittedModel::from_constant(Family::Bccg, DistributionParams::new(0.5, 0.2, 0.0, 2.0)).unwrap();
        let ages = [10.0, 20.0, 30.0];
        let set = predict_centiles(&model, &ages, &[0.5], &RootOptions::default()).unwrap();
        for &v in &set.curves[0].values {
            assert!((v - 0.5).abs() < 1e-8, "median {v}");
        }
    }

    #[test]
    fn bcpe_median_tracks_mu_for_moderate_sigma() {
        let opts = RootOptions::default();
        let median = |sigma: f64| {
            let model =
                FittedModel::from_constant(Family::Bcpe, DistributionParams::new(0.5, sigma, 1.0, 2.0))
                    .unwrap();
            predict_centiles(&model, &[30.0], &[0.5], &opts).unwrap().curves[0].values[0]
        };
        for sigma in [0.1, 0.2] {
            let rel = (median(sigma) - 0.5).abs() / 0.5;
            assert!(rel < 1e-6, "sigma={sigma}: relative error {rel}");
        }
        // Truncation below y = 0 pushes the median up as sigma grows.
        let wide = median(0.5);
        assert!(wide > 0.5 && wide < 0.5 * 1.02, "median={wide}");
    }

    #[test]
    fn median_curve_follows_smooth_mu() {
        let mut rng = StdRng::seed_from_u64(12);
        let samples: Vec<Sample> = (0..25)
            .map(|s| {
                let age = 20.0 + 2.5 * s as f64;
                let dist = Normal::new(1.0 + 0.03 * (age - 20.0), 0.2).unwrap();
                Sample::new(format!("s{s}"), age, (0..20).map(|_| dist.sample(&mut rng)).collect()).unwrap()
            })
            .collect();
        let config = FitConfig {
            family: Family::No,
            ..FitConfig::default()
        };
        let links = LinkSpec::all_constant().with(Param::Mu, LinkKind::Smooth);
        let model = fit_population(&samples, &links, &config).unwrap();

        let ages = age_grid(20.0, 80.0, 13).unwrap();
        let set = predict_centiles(&model, &ages, &DEFAULT_CENTILE_LEVELS, &config.root_options()).unwrap();
        let median = set.curve(0.5).unwrap();
        for (age, v) in ages.iter().zip(&median.values) {
            assert!((v - model.eval(Param::Mu, *age)).abs() < 1e-8);
        }
        assert_eq!(set.warning_count(), 0);
        for row in set.rows() {
            assert!(row.thresholds.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn out_of_order_thresholds_are_flagged_on_the_higher_level() {
        let levels = [0.5, 0.1, 0.9];
        let values = [1.0, 0.8, 0.95];
        let warnings = monotonicity_warnings(40.0, &levels, &values);
        assert_eq!(warnings.len(), 1);
        let (curve, w) = warnings[0];
        assert_eq!(curve, 2);
        assert_eq!(w.level, 0.9);
        assert_eq!(w.lower_level, 0.5);
    }

    #[test]
    fn rejects_bad_inputs() {
        let model =
            FittedModel::from_constant(Family::No, DistributionParams::new(0.0, 1.0, 1.0, 2.0)).unwrap();
        let opts = RootOptions::default();
        for (ages, levels) in [
            (vec![30.0, 20.0], vec![0.5]),
            (vec![f64::NAN], vec![0.5]),
            (vec![30.0], vec![1.0]),
            (vec![], vec![0.5]),
        ] {
            let err = predict_centiles(&model, &ages, &levels, &opts).unwrap_err();
            assert!(matches!(err, FitError::InvalidInput(_)));
        }
    }

    #[test]
    fn grid_includes_both_ends() {
        let grid = age_grid(18.0, 80.0, 5).unwrap();
        assert_eq!(grid.len(), 5);
        assert_eq!(grid[0], 18.0);
        assert_eq!(grid[4], 80.0);
        assert!(age_grid(1.0, 0.0, 5).is_err());
    }
}
