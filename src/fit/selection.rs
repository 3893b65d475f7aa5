//! Smoothing-parameter selection.
//!
//! For each smooth-term update we solve the penalized least-squares problem
//! on every `λ` of the grid and keep the one with the lowest criterion:
//!
//! - GAIC: `RSS_w + k * edf` (local criterion on the working model, used by
//!   the population fitter; `k` is configurable, default 3.84)
//! - GCV: `n * RSS / (n - edf)^2` (used by the effect-size screener)
//!
//! Selection is deterministic: minimum criterion, ties broken by grid index.

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::error::{FitError, Result};
use crate::math::{PenalizedFit, WeightedGram, solve_penalized};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingCriterion {
    Gaic { penalty: f64 },
    Gcv,
}

impl SmoothingCriterion {
    fn score(self, fit: &PenalizedFit, n: usize) -> f64 {
        match self {
            SmoothingCriterion::Gaic { penalty } => gaic(fit.rss, fit.edf, penalty),
            SmoothingCriterion::Gcv => gcv(fit.rss, n, fit.edf),
        }
    }
}

/// Generalized information criterion `deviance + k * edf`.
pub fn gaic(deviance: f64, edf: f64, penalty: f64) -> f64 {
    deviance + penalty * edf
}

/// Generalized cross-validation score; `+inf` when `edf >= n`.
pub fn gcv(rss: f64, n: usize, edf: f64) -> f64 {
    let n_f = n as f64;
    let resid_df = n_f - edf;
    if resid_df <= 0.0 {
        return f64::INFINITY;
    }
    n_f * rss / (resid_df * resid_df)
}

/// Winning grid candidate.
#[derive(Debug, Clone)]
pub struct SmoothingChoice {
    pub lambda: f64,
    pub fit: PenalizedFit,
    pub score: f64,
}

/// Evaluate every `λ` of `grid` (in parallel) and return the best one.
pub fn select_smoothing(
    gram: &WeightedGram,
    penalty: &DMatrix<f64>,
    grid: &[f64],
    criterion: SmoothingCriterion,
) -> Result<SmoothingChoice> {
    if grid.is_empty() {
        return Err(FitError::InvalidConfig("lambda grid is empty".to_string()));
    }

    let candidates: Vec<(usize, SmoothingChoice)> = grid
        .par_iter()
        .enumerate()
        .filter_map(|(idx, &lambda)| {
            let fit = solve_penalized(gram, penalty, lambda)?;
            let score = criterion.score(&fit, gram.n);
            score.is_finite().then_some((idx, SmoothingChoice { lambda, fit, score }))
        })
        .collect();

    let mut best: Option<&(usize, SmoothingChoice)> = None;
    for c in &candidates {
        best = match best {
            Some(b) if b.1.score < c.1.score || (b.1.score == c.1.score && b.0 < c.0) => Some(b),
            _ => Some(c),
        };
    }

    best.map(|(_, choice)| choice.clone()).ok_or_else(|| {
        FitError::NumericalNonConvergence(
            "no smoothing parameter produced a solvable penalized system".to_string(),
        )
    })
}
