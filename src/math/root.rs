//! Bracketed root-finding for monotone increasing functions.
//!
//! Used to invert distribution functions: we look for `x` with `f(x) = 0`
//! where `f(x) = cdf(x) - p`.
//!
//! The solver is a safeguarded Newton iteration:
//! - a bracket `[lo, hi]` with `f(lo) < 0 < f(hi)` is maintained at all times
//! - a Newton step is taken when it lands strictly inside the bracket and the
//!   derivative is usable, otherwise we bisect
//! - convergence is declared when the step is below `tol * (1 + |x|)`

use crate::error::{FitError, Result};

/// Tolerance and iteration cap for the root-finder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootOptions {
    pub tol: f64,
    pub max_iter: usize,
}

impl Default for RootOptions {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iter: 200,
        }
    }
}

/// Maximum number of bracket doublings before giving up.
const MAX_EXPANSIONS: usize = 64;

/// Find `[lo, hi]` around `x0` with `f(lo) < 0 <= f(hi)`.
///
/// `f` must be non-decreasing. The search starts at `x0 ± step` and doubles
/// the step on the side that has not yet changed sign.
pub fn bracket_increasing<F>(f: &F, x0: f64, step: f64) -> Result<(f64, f64)>
where
    F: Fn(f64) -> (f64, f64),
{
    if !(x0.is_finite() && step.is_finite() && step > 0.0) {
        return Err(FitError::NumericalNonConvergence(format!(
            "invalid bracket start x0={x0}, step={step}"
        )));
    }

    let mut lo = x0 - step;
    let mut hi = x0 + step;
    let mut width = step;

    for _ in 0..MAX_EXPANSIONS {
        let f_lo = f(lo).0;
        let f_hi = f(hi).0;
        if f_lo < 0.0 && f_hi >= 0.0 {
            return Ok((lo, hi));
        }
        width *= 2.0;
        if f_lo >= 0.0 {
            lo -= width;
        }
        if f_hi < 0.0 {
            hi += width;
        }
    }

    Err(FitError::NumericalNonConvergence(format!(
        "no sign change found around x0={x0} after {MAX_EXPANSIONS} expansions"
    )))
}

/// Solve `f(x) = 0` for a non-decreasing `f` given a valid bracket.
///
/// `f` returns `(value, derivative)`.
pub fn solve_increasing<F>(f: &F, lo: f64, hi: f64, opts: &RootOptions) -> Result<f64>
where
    F: Fn(f64) -> (f64, f64),
{
    let (mut lo, mut hi) = (lo, hi);
    let mut x = 0.5 * (lo + hi);

    for _ in 0..opts.max_iter {
        let (fx, dfx) = f(x);
        if !fx.is_finite() {
            return Err(FitError::NumericalNonConvergence(format!(
                "non-finite function value at x={x}"
            )));
        }
        if fx == 0.0 {
            return Ok(x);
        }
        if fx < 0.0 {
            lo = x;
        } else {
            hi = x;
        }

        let newton = if dfx.is_finite() && dfx > 0.0 {
            Some(x - fx / dfx)
        } else {
            None
        };
        let next = match newton {
            Some(candidate) if candidate > lo && candidate < hi => candidate,
            _ => 0.5 * (lo + hi),
        };

        let step = (next - x).abs();
        x = next;
        if step <= opts.tol * (1.0 + x.abs()) || (hi - lo) <= opts.tol * (1.0 + x.abs()) {
            return Ok(x);
        }
    }

    Err(FitError::NumericalNonConvergence(format!(
        "root-finder exceeded {} iterations (bracket [{lo}, {hi}])",
        opts.max_iter
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_cubic_root() {
        let f = |x: f64| (x * x * x - 2.0, 3.0 * x * x);
        let (lo, hi) = bracket_increasing(&f, 0.0, 0.5).unwrap();
        let root = solve_increasing(&f, lo, hi, &RootOptions::default()).unwrap();
        assert!((root - 2f64.cbrt()).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_bisection_without_derivative() {
        let f = |x: f64| (x - 0.3, f64::NAN);
        let root = solve_increasing(&f, -1.0, 1.0, &RootOptions::default()).unwrap();
        assert!((root - 0.3).abs() < 1e-9);
    }

    #[test]
    fn reports_non_convergence_when_capped() {
        let f = |x: f64| (x - 0.123456789, f64::NAN);
        let opts = RootOptions {
            tol: 1e-14,
            max_iter: 3,
        };
        let err = solve_increasing(&f, -1.0, 1.0, &opts).unwrap_err();
        assert!(matches!(err, FitError::NumericalNonConvergence(_)));
    }

    #[test]
    fn bracket_expands_far_from_start() {
        let f = |x: f64| (x - 1000.0, 1.0);
        let (lo, hi) = bracket_increasing(&f, 0.0, 1.0).unwrap();
        assert!(lo < 1000.0 && hi >= 1000.0);
    }
}
