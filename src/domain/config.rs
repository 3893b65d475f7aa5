//! Run configuration.
//!
//! All thresholds, tolerances and caps live here rather than in the fitting
//! code. Every field has a default, so a TOML file only needs to list the
//! values it overrides:
//!
//! ```toml
//! family = "bcpe"
//! effect_size_threshold = 0.04
//! gaic_penalty = 3.84
//! centile_levels = [0.02275, 0.5, 0.97725]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::WeightScheme;
use crate::error::{FitError, Result};
use crate::family::Family;
use crate::math::RootOptions;

/// Probability levels matching z = -2, -1, 0, +1, +2.
pub const DEFAULT_CENTILE_LEVELS: [f64; 5] = [0.02275, 0.15866, 0.50, 0.84134, 0.97725];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Distribution family fitted everywhere (per subject and pooled).
    pub family: Family,

    /// Minimum screener R² for a parameter to be modeled as a function of age.
    pub effect_size_threshold: f64,
    /// Per-edf penalty `k` in `GAIC = deviance + k * edf`.
    pub gaic_penalty: f64,

    /// Outer-loop tolerance on the change of penalized deviance per full pass.
    pub outer_tol: f64,
    /// Inner-loop tolerance for a single parameter block.
    pub inner_tol: f64,
    pub flat_max_cycles: usize,
    pub population_max_cycles: usize,
    pub max_inner_iter: usize,
    /// Optional wall-clock budget for the population fit (seconds).
    pub time_budget_secs: Option<f64>,
    /// Treat a block update that reaches `max_inner_iter` as a
    /// `ConvergenceFailure` instead of a counted warning.
    pub strict_inner_cap: bool,

    /// Admissible range of the kurtosis parameter `tau`. Candidate steps
    /// leaving it are rejected; flat fits ending at either end are flagged.
    pub tau_min: f64,
    pub tau_max: f64,

    /// Smallest sample a subject may have to be fitted on its own.
    pub min_sample_size: usize,
    /// Smallest number of distinct ages for any age-dependent fit.
    pub min_distinct_ages: usize,
    pub weighting: WeightScheme,

    /// Number of equal B-spline segments across the training age range.
    pub spline_segments: usize,
    pub spline_degree: usize,
    pub penalty_order: usize,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub lambda_steps: usize,

    pub quantile_tol: f64,
    pub quantile_max_iter: usize,

    pub centile_levels: Vec<f64>,
    /// Number of evenly spaced ages in the pipeline's centile grid.
    pub centile_grid_points: usize,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            family: Family::Bcpe,
            effect_size_threshold: 0.04,
            gaic_penalty: 3.84,
            outer_tol: 1e-3,
            inner_tol: 1e-3,
            flat_max_cycles: 200,
            population_max_cycles: 20,
            max_inner_iter: 100,
            time_budget_secs: None,
            strict_inner_cap: false,
            tau_min: 0.1,
            tau_max: 50.0,
            min_sample_size: 10,
            min_distinct_ages: 5,
            weighting: WeightScheme::InverseSampleSize,
            spline_segments: 10,
            spline_degree: 3,
            penalty_order: 2,
            lambda_min: 1e-4,
            lambda_max: 1e6,
            lambda_steps: 41,
            quantile_tol: 1e-10,
            quantile_max_iter: 200,
            centile_levels: DEFAULT_CENTILE_LEVELS.to_vec(),
            centile_grid_points: 101,
        }
    }
}

impl FitConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: FitConfig =
            toml::from_str(text).map_err(|e| FitError::InvalidConfig(format!("TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FitError::Io(format!("failed to read config '{}': {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Reject settings the fitters cannot work with.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| -> Result<()> {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(FitError::InvalidConfig(format!("{name} must be finite and > 0, got {v}")))
            }
        };

        if !(self.effect_size_threshold.is_finite()
            && (0.0..=1.0).contains(&self.effect_size_threshold))
        {
            return Err(FitError::InvalidConfig(format!(
                "effect_size_threshold must lie in [0, 1], got {}",
                self.effect_size_threshold
            )));
        }
        if !(self.gaic_penalty.is_finite() && self.gaic_penalty >= 0.0) {
            return Err(FitError::InvalidConfig(format!(
                "gaic_penalty must be finite and >= 0, got {}",
                self.gaic_penalty
            )));
        }
        positive("outer_tol", self.outer_tol)?;
        positive("inner_tol", self.inner_tol)?;
        positive("quantile_tol", self.quantile_tol)?;
        positive("lambda_min", self.lambda_min)?;
        positive("lambda_max", self.lambda_max)?;
        if let Some(budget) = self.time_budget_secs {
            positive("time_budget_secs", budget)?;
        }
        positive("tau_min", self.tau_min)?;
        positive("tau_max", self.tau_max)?;
        if !(self.tau_min < 2.0 && 2.0 < self.tau_max) {
            return Err(FitError::InvalidConfig(format!(
                "tau range [{}, {}] must contain the normal kernel tau = 2",
                self.tau_min, self.tau_max
            )));
        }
        if self.lambda_max <= self.lambda_min {
            return Err(FitError::InvalidConfig("lambda_max must exceed lambda_min".to_string()));
        }
        if self.lambda_steps < 2 {
            return Err(FitError::InvalidConfig("lambda_steps must be >= 2".to_string()));
        }
        if self.flat_max_cycles == 0 || self.population_max_cycles == 0 || self.max_inner_iter == 0 {
            return Err(FitError::InvalidConfig("iteration caps must be >= 1".to_string()));
        }
        if self.quantile_max_iter == 0 {
            return Err(FitError::InvalidConfig("quantile_max_iter must be >= 1".to_string()));
        }
        if self.min_sample_size < 2 {
            return Err(FitError::InvalidConfig("min_sample_size must be >= 2".to_string()));
        }
        if self.min_distinct_ages < 2 {
            return Err(FitError::InvalidConfig("min_distinct_ages must be >= 2".to_string()));
        }
        if self.spline_degree == 0 || self.spline_segments == 0 {
            return Err(FitError::InvalidConfig(
                "spline_degree and spline_segments must be >= 1".to_string(),
            ));
        }
        if self.penalty_order == 0 || self.penalty_order >= self.spline_segments + self.spline_degree {
            return Err(FitError::InvalidConfig(format!(
                "penalty_order must be in 1..{}",
                self.spline_segments + self.spline_degree
            )));
        }
        if self.centile_levels.is_empty() {
            return Err(FitError::InvalidConfig("centile_levels is empty".to_string()));
        }
        if let Some(bad) = self
            .centile_levels
            .iter()
            .find(|p| !(p.is_finite() && **p > 0.0 && **p < 1.0))
        {
            return Err(FitError::InvalidConfig(format!(
                "centile level {bad} is outside (0, 1)"
            )));
        }
        if self.centile_grid_points < 2 {
            return Err(FitError::InvalidConfig("centile_grid_points must be >= 2".to_string()));
        }
        Ok(())
    }

    pub fn root_options(&self) -> RootOptions {
        RootOptions {
            tol: self.quantile_tol,
            max_iter: self.quantile_max_iter,
        }
    }

    /// Smoothing parameters tried for every smooth term: `lambda_steps`
    /// values evenly spaced in `log10 λ`, ends pinned to the configured range.
    pub fn lambda_grid(&self) -> Result<Vec<f64>> {
        if !(self.lambda_min.is_finite() && self.lambda_min > 0.0 && self.lambda_max > self.lambda_min)
            || !self.lambda_max.is_finite()
        {
            return Err(FitError::InvalidConfig(format!(
                "invalid lambda range [{}, {}]",
                self.lambda_min, self.lambda_max
            )));
        }
        if self.lambda_steps < 2 {
            return Err(FitError::InvalidConfig("lambda_steps must be >= 2".to_string()));
        }

        let (lo, hi) = (self.lambda_min.log10(), self.lambda_max.log10());
        let last = self.lambda_steps - 1;
        let decade_step = (hi - lo) / last as f64;
        Ok((0..=last)
            .map(|i| match i {
                0 => self.lambda_min,
                i if i == last => self.lambda_max,
                i => 10f64.powf(lo + decade_step * i as f64),
            })
            .collect())
    }

}
