//! Reporting utilities: z-scores, centile coverage and extreme observations.

pub mod format;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::domain::Sample;
use crate::error::{FitError, Result};
use crate::fit::FittedModel;

/// Cdf values are clamped this far inside `(0, 1)` before the probit.
const CDF_CLAMP: f64 = 1e-15;

/// Position of one observation in the fitted distribution at its age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationScore {
    pub subject_id: String,
    pub age: f64,
    pub value: f64,
    /// `F(value | age)`.
    pub cdf: f64,
    /// Normalized quantile residual `Φ⁻¹(F(value | age))`.
    pub z: f64,
}

/// Share of observations falling below one centile curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageRow {
    pub level: f64,
    pub observed: f64,
    pub n: usize,
}

/// Most extreme observations on each side.
#[derive(Debug, Clone)]
pub struct Extremes {
    pub high: Vec<ObservationScore>,
    pub low: Vec<ObservationScore>,
}

/// Score every observation of every sample under `model`.
pub fn z_scores(model: &FittedModel, samples: &[Sample]) -> Result<Vec<ObservationScore>> {
    let standard = Normal::new(0.0, 1.0)
        .map_err(|e| FitError::InvalidParameter(format!("standard normal: {e}")))?;
    let family = model.family();

    let per_sample: Vec<Vec<ObservationScore>> = samples
        .par_iter()
        .map(|sample| {
            let params = model.params_at(sample.age());
            sample
                .values()
                .iter()
                .map(|&value| {
                    let cdf = family.cdf(value, &params)?;
                    let z = standard.inverse_cdf(cdf.clamp(CDF_CLAMP, 1.0 - CDF_CLAMP));
                    Ok(ObservationScore {
                        subject_id: sample.subject_id().to_string(),
                        age: sample.age(),
                        value,
                        cdf,
                        z,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(per_sample.into_iter().flatten().collect())
}

/// Observed share of scores below each level.
///
/// An observation lies below the level-`p` curve exactly when its cdf is
/// below `p`, so no quantiles are needed.
pub fn coverage(scores: &[ObservationScore], levels: &[f64]) -> Vec<CoverageRow> {
    let n = scores.len();
    levels
        .iter()
        .map(|&level| {
            let below = scores.iter().filter(|s| s.cdf < level).count();
            CoverageRow {
                level,
                observed: if n == 0 { 0.0 } else { below as f64 / n as f64 },
                n,
            }
        })
        .collect()
}

/// Top `top_n` scores on each side of the median.
pub fn rank_extremes(scores: &[ObservationScore], top_n: usize) -> Extremes {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.z.total_cmp(&a.z));
    let high = sorted.iter().take(top_n).cloned().collect();
    let low = sorted.iter().rev().take(top_n).cloned().collect();
    Extremes { high, low }
}
