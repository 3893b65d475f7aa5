//! Distribution families.
//!
//! Three members of the Box-Cox family tree are supported:
//!
//! | family | active parameters        | support  |
//! |--------|--------------------------|----------|
//! | NO     | mu, sigma                | real     |
//! | BCCG   | mu, sigma, nu (tau = 2)  | positive |
//! | BCPE   | mu, sigma, nu, tau       | positive |
//!
//! Inactive parameters are pinned (`nu = 1`, `tau = 2`) whenever a family
//! evaluates a density, so callers can always pass a full `DistributionParams`.

pub mod bcpe;
pub mod link;
pub mod normal;

pub use link::Link;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::domain::{DistributionParams, Param};
use crate::error::{FitError, Result};
use crate::math::{RootOptions, bracket_increasing, solve_increasing};

/// Value given to `nu` when a family does not estimate it.
pub const FIXED_NU: f64 = 1.0;
/// Value given to `tau` when a family does not estimate it.
pub const FIXED_TAU: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    No,
    Bccg,
    Bcpe,
}

impl Family {
    pub fn display_name(self) -> &'static str {
        match self {
            Family::No => "NO",
            Family::Bccg => "BCCG",
            Family::Bcpe => "BCPE",
        }
    }

    /// Parameters estimated by this family, in fitting order.
    pub fn active_params(self) -> &'static [Param] {
        match self {
            Family::No => &[Param::Mu, Param::Sigma],
            Family::Bccg => &[Param::Mu, Param::Sigma, Param::Nu],
            Family::Bcpe => &Param::ALL,
        }
    }

    pub fn is_active(self, param: Param) -> bool {
        self.active_params().contains(&param)
    }

    /// Link used to model `param` on an unconstrained scale.
    pub fn link(self, param: Param) -> Link {
        match (self, param) {
            (Family::No, Param::Mu) => Link::Identity,
            (_, Param::Nu) => Link::Identity,
            _ => Link::Log,
        }
    }

    /// `true` when the support is `(0, ∞)`.
    pub fn positive_support(self) -> bool {
        !matches!(self, Family::No)
    }

    /// Replace inactive parameters by their pinned values.
    pub fn normalize(self, params: DistributionParams) -> DistributionParams {
        let mut out = params;
        if !self.is_active(Param::Nu) {
            out.nu = FIXED_NU;
        }
        if !self.is_active(Param::Tau) {
            out.tau = FIXED_TAU;
        }
        out
    }

    /// Check parameter constraints for this family.
    pub fn validate(self, params: &DistributionParams) -> Result<()> {
        let p = self.normalize(*params);
        if !(p.mu.is_finite() && (p.mu > 0.0 || !self.positive_support())) {
            return Err(FitError::InvalidParameter(format!(
                "{}: mu must be finite{}, got {}",
                self.display_name(),
                if self.positive_support() { " and > 0" } else { "" },
                p.mu
            )));
        }
        if !(p.sigma.is_finite() && p.sigma > 0.0) {
            return Err(FitError::InvalidParameter(format!(
                "{}: sigma must be finite and > 0, got {}",
                self.display_name(),
                p.sigma
            )));
        }
        if !p.nu.is_finite() {
            return Err(FitError::InvalidParameter(format!(
                "{}: nu must be finite, got {}",
                self.display_name(),
                p.nu
            )));
        }
        if !(p.tau.is_finite() && p.tau > 0.0) {
            return Err(FitError::InvalidParameter(format!(
                "{}: tau must be finite and > 0, got {}",
                self.display_name(),
                p.tau
            )));
        }
        Ok(())
    }

    fn validate_value(self, y: f64) -> Result<()> {
        if !y.is_finite() || (self.positive_support() && y <= 0.0) {
            return Err(FitError::InvalidParameter(format!(
                "{}: value {y} is outside the support",
                self.display_name()
            )));
        }
        Ok(())
    }

    /// Log-density without validation; `-inf` outside the support.
    pub(crate) fn log_pdf_unchecked(self, y: f64, params: &DistributionParams) -> f64 {
        let p = self.normalize(*params);
        match self {
            Family::No => normal::log_pdf(y, p.mu, p.sigma),
            Family::Bccg | Family::Bcpe => bcpe::log_pdf(y, p.mu, p.sigma, p.nu, p.tau),
        }
    }

    fn cdf_unchecked(self, y: f64, params: &DistributionParams) -> f64 {
        let p = self.normalize(*params);
        match self {
            Family::No => normal::cdf(y, p.mu, p.sigma),
            Family::Bccg | Family::Bcpe => bcpe::cdf(y, p.mu, p.sigma, p.nu, p.tau),
        }
    }

    pub fn log_pdf(self, y: f64, params: &DistributionParams) -> Result<f64> {
        self.validate(params)?;
        self.validate_value(y)?;
        Ok(self.log_pdf_unchecked(y, params))
    }

    pub fn pdf(self, y: f64, params: &DistributionParams) -> Result<f64> {
        Ok(self.log_pdf(y, params)?.exp())
    }

    pub fn cdf(self, y: f64, params: &DistributionParams) -> Result<f64> {
        self.validate(params)?;
        self.validate_value(y)?;
        Ok(self.cdf_unchecked(y, params))
    }

    /// Solve `cdf(x) = p` by bracketed Newton/bisection.
    ///
    /// Positive-support families are solved on `t = ln x`, which keeps the
    /// bracket symmetric in relative terms and the derivative well scaled.
    pub fn quantile(self, p: f64, params: &DistributionParams, opts: &RootOptions) -> Result<f64> {
        self.validate(params)?;
        if !(p.is_finite() && p > 0.0 && p < 1.0) {
            return Err(FitError::InvalidParameter(format!(
                "probability must lie in (0, 1), got {p}"
            )));
        }

        let params = self.normalize(*params);
        if self.positive_support() {
            let f = |t: f64| {
                let y = t.exp();
                let value = self.cdf_unchecked(y, &params) - p;
                let slope = self.log_pdf_unchecked(y, &params).exp() * y;
                (value, slope)
            };
            let (lo, hi) = bracket_increasing(&f, params.mu.ln(), params.sigma.max(0.05))?;
            let t = solve_increasing(&f, lo, hi, opts)?;
            Ok(t.exp())
        } else {
            let f = |x: f64| {
                let value = self.cdf_unchecked(x, &params) - p;
                let slope = self.log_pdf_unchecked(x, &params).exp();
                (value, slope)
            };
            let (lo, hi) = bracket_increasing(&f, params.mu, params.sigma)?;
            solve_increasing(&f, lo, hi, opts)
        }
    }

    /// Draw one value.
    ///
    /// NO uses a direct normal draw; the Box-Cox families invert the cdf at a
    /// uniform variate.
    pub fn sample<R: Rng>(
        self,
        rng: &mut R,
        params: &DistributionParams,
        opts: &RootOptions,
    ) -> Result<f64> {
        self.validate(params)?;
        match self {
            Family::No => {
                let normal = Normal::new(params.mu, params.sigma)
                    .map_err(|e| FitError::InvalidParameter(format!("normal draw: {e}")))?;
                Ok(normal.sample(rng))
            }
            Family::Bccg | Family::Bcpe => {
                let u: f64 = rng.gen_range(f64::EPSILON..1.0);
                self.quantile(u, params, opts)
            }
        }
    }

    /// Moment-based starting values.
    ///
    /// `mu` is the (weighted) mean, `sigma` the coefficient of variation for
    /// the Box-Cox families or the standard deviation for NO; `nu = 1`,
    /// `tau = 2`.
    pub fn initial_params(self, values: &[f64], weights: &[f64]) -> Result<DistributionParams> {
        if values.len() < 2 {
            return Err(FitError::InsufficientData(format!(
                "need at least 2 values for starting estimates, got {}",
                values.len()
            )));
        }
        for &y in values {
            self.validate_value(y)?;
        }

        let sum_w: f64 = weights.iter().sum();
        if !(sum_w.is_finite() && sum_w > 0.0) {
            return Err(FitError::InvalidInput("weights must have a positive sum".to_string()));
        }
        let mean = values.iter().zip(weights).map(|(y, w)| w * y).sum::<f64>() / sum_w;
        let var = values
            .iter()
            .zip(weights)
            .map(|(y, w)| w * (y - mean) * (y - mean))
            .sum::<f64>()
            / sum_w;
        let sd = var.sqrt();
        if !(sd.is_finite() && sd > 0.0) {
            return Err(FitError::InsufficientData(
                "values show no variation; scale cannot be estimated".to_string(),
            ));
        }

        let sigma = if self.positive_support() { sd / mean } else { sd };
        Ok(DistributionParams::new(mean, sigma, FIXED_NU, FIXED_TAU))
    }
}
