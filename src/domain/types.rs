//! Shared domain types.
//!
//! These types are kept small and serializable so they can be:
//!
//! - used in-memory during fitting
//! - handed back to collaborators as results
//! - persisted alongside a fitted model

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// A single measurement for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub subject_id: String,
    pub age: f64,
    pub value: f64,
}

/// All observations of one subject.
///
/// Invariant: every observation shares the subject id and the age. The
/// constructor enforces it, so downstream code can read `age()` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    subject_id: String,
    age: f64,
    values: Vec<f64>,
}

impl Sample {
    /// Build a sample from a subject id, its (single) age and its measurements.
    pub fn new(subject_id: impl Into<String>, age: f64, values: Vec<f64>) -> Result<Self> {
        let subject_id = subject_id.into();
        if !age.is_finite() {
            return Err(FitError::InvalidInput(format!(
                "subject '{subject_id}': age must be finite, got {age}"
            )));
        }
        if values.is_empty() {
            return Err(FitError::InvalidInput(format!(
                "subject '{subject_id}': sample has no values"
            )));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(FitError::InvalidInput(format!(
                "subject '{subject_id}': non-finite value {bad}"
            )));
        }
        Ok(Self {
            subject_id,
            age,
            values,
        })
    }

    /// Group loose observations of a single subject into a sample.
    pub fn from_observations(observations: &[Observation]) -> Result<Self> {
        let Some(first) = observations.first() else {
            return Err(FitError::InvalidInput("no observations to group".to_string()));
        };
        for o in &observations[1..] {
            if o.subject_id != first.subject_id {
                return Err(FitError::InvalidInput(format!(
                    "mixed subjects in one sample: '{}' and '{}'",
                    first.subject_id, o.subject_id
                )));
            }
            if o.age != first.age {
                return Err(FitError::InvalidInput(format!(
                    "subject '{}': ages differ within sample ({} vs {})",
                    first.subject_id, first.age, o.age
                )));
            }
        }
        let values = observations.iter().map(|o| o.value).collect();
        Self::new(first.subject_id.clone(), first.age, values)
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn age(&self) -> f64 {
        self.age
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Expand back into per-measurement observations.
    pub fn observations(&self) -> impl Iterator<Item = Observation> + '_ {
        self.values.iter().map(|&value| Observation {
            subject_id: self.subject_id.clone(),
            age: self.age,
            value,
        })
    }
}

/// The four distribution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Param {
    Mu,
    Sigma,
    Nu,
    Tau,
}

impl Param {
    pub const ALL: [Param; 4] = [Param::Mu, Param::Sigma, Param::Nu, Param::Tau];

    /// Position in `[mu, sigma, nu, tau]` arrays.
    pub fn index(self) -> usize {
        match self {
            Param::Mu => 0,
            Param::Sigma => 1,
            Param::Nu => 2,
            Param::Tau => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Param::Mu => "mu",
            Param::Sigma => "sigma",
            Param::Nu => "nu",
            Param::Tau => "tau",
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Median (`mu`), scale (`sigma`), skew (`nu`) and kurtosis (`tau`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionParams {
    pub mu: f64,
    pub sigma: f64,
    pub nu: f64,
    pub tau: f64,
}

impl DistributionParams {
    pub fn new(mu: f64, sigma: f64, nu: f64, tau: f64) -> Self {
        Self { mu, sigma, nu, tau }
    }

    pub fn get(&self, param: Param) -> f64 {
        match param {
            Param::Mu => self.mu,
            Param::Sigma => self.sigma,
            Param::Nu => self.nu,
            Param::Tau => self.tau,
        }
    }

    pub fn set(&mut self, param: Param, value: f64) {
        match param {
            Param::Mu => self.mu = value,
            Param::Sigma => self.sigma = value,
            Param::Nu => self.nu = value,
            Param::Tau => self.tau = value,
        }
    }

    /// Copy with one parameter replaced.
    pub fn with(mut self, param: Param, value: f64) -> Self {
        self.set(param, value);
        self
    }
}

/// How a parameter depends on age in the population model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Intercept only.
    Constant,
    /// Penalized B-spline in age.
    Smooth,
}

/// Per-parameter link choice for the population fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub mu: LinkKind,
    pub sigma: LinkKind,
    pub nu: LinkKind,
    pub tau: LinkKind,
}

impl LinkSpec {
    pub fn all_constant() -> Self {
        Self {
            mu: LinkKind::Constant,
            sigma: LinkKind::Constant,
            nu: LinkKind::Constant,
            tau: LinkKind::Constant,
        }
    }

    pub fn get(&self, param: Param) -> LinkKind {
        match param {
            Param::Mu => self.mu,
            Param::Sigma => self.sigma,
            Param::Nu => self.nu,
            Param::Tau => self.tau,
        }
    }

    pub fn with(mut self, param: Param, kind: LinkKind) -> Self {
        match param {
            Param::Mu => self.mu = kind,
            Param::Sigma => self.sigma = kind,
            Param::Nu => self.nu = kind,
            Param::Tau => self.tau = kind,
        }
        self
    }

    pub fn any_smooth(&self) -> bool {
        Param::ALL.iter().any(|&p| self.get(p) == LinkKind::Smooth)
    }
}

impl Default for LinkSpec {
    fn default() -> Self {
        Self::all_constant()
    }
}

/// Prior weights given to each observation in the pooled likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightScheme {
    /// `1/n_i` for every observation of subject `i`, so each subject carries
    /// the same total weight regardless of its sample size.
    InverseSampleSize,
    /// Every observation weighs 1.
    Unit,
}

impl WeightScheme {
    /// Weight for one observation of a sample with `n` values.
    pub fn weight(self, n: usize) -> f64 {
        match self {
            WeightScheme::InverseSampleSize => 1.0 / n.max(1) as f64,
            WeightScheme::Unit => 1.0,
        }
    }
}
