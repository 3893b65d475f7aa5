//! B-spline bases and difference penalties for P-splines.
//!
//! A P-spline term is `f(x) = Σ_j β_j B_j(x)` with B-splines on equally spaced
//! knots and a roughness penalty `λ Σ (Δ^d β)^2 = λ βᵀ DᵀD β`.
//!
//! Numerical notes:
//! - Knots extend `degree` segments beyond each end of the data range, so
//!   every point of `[lower, upper]` sees a full set of `degree + 1` non-zero
//!   basis functions and the basis sums to one (a constant is representable).
//! - With an order-2 penalty, straight lines are left unpenalized; large `λ`
//!   shrinks the term towards a linear fit rather than towards zero.
//! - Outside `[lower, upper]` the term is continued linearly from the
//!   boundary (see [`PSplineBasis::extrapolate`]).

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Equally spaced B-spline basis over a fixed covariate range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PSplineBasis {
    lower: f64,
    upper: f64,
    segments: usize,
    degree: usize,
}

impl PSplineBasis {
    pub fn new(lower: f64, upper: f64, segments: usize, degree: usize) -> Result<Self> {
        if !(lower.is_finite() && upper.is_finite() && upper > lower) {
            return Err(FitError::InvalidInput(format!(
                "spline range must be finite with upper > lower, got [{lower}, {upper}]"
            )));
        }
        if segments == 0 || degree == 0 {
            return Err(FitError::InvalidConfig(
                "spline segments and degree must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            lower,
            upper,
            segments,
            degree,
        })
    }

    pub fn range(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    /// Number of basis functions (columns of the design matrix).
    pub fn len(&self) -> usize {
        self.segments + self.degree
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spacing(&self) -> f64 {
        (self.upper - self.lower) / self.segments as f64
    }

    fn knot(&self, j: usize) -> f64 {
        self.lower + (j as f64 - self.degree as f64) * self.spacing()
    }

    /// Evaluate all basis functions at `x` into `out` (length `self.len()`).
    ///
    /// `x` is clamped into `[lower, upper]`; use [`PSplineBasis::extrapolate`]
    /// for values outside the range.
    ///
    /// # Panics
    /// Panics if `out.len() != self.len()`.
    pub fn fill_row(&self, x: f64, out: &mut [f64]) {
        assert_eq!(out.len(), self.len(), "basis row has wrong length");
        out.iter_mut().for_each(|v| *v = 0.0);

        let x = x.clamp(self.lower, self.upper);
        let p = self.degree;

        // Knot span `i` with knot(i) <= x < knot(i+1); the last segment is closed.
        let seg = (((x - self.lower) / self.spacing()).floor() as usize).min(self.segments - 1);
        let span = seg + p;

        // Cox–de Boor recursion for the p+1 non-zero functions on this span.
        let mut n = vec![0.0; p + 1];
        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];
        n[0] = 1.0;
        for j in 1..=p {
            left[j] = x - self.knot(span + 1 - j);
            right[j] = self.knot(span + j) - x;
            let mut saved = 0.0;
            for r in 0..j {
                let temp = n[r] / (right[r + 1] + left[j - r]);
                n[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            n[j] = saved;
        }

        for (r, value) in n.into_iter().enumerate() {
            out[span - p + r] = value;
        }
    }

    /// Design matrix with one row per `x`.
    pub fn design(&self, xs: &[f64]) -> DMatrix<f64> {
        let k = self.len();
        let mut x = DMatrix::<f64>::zeros(xs.len(), k);
        let mut row = vec![0.0; k];
        for (i, &xi) in xs.iter().enumerate() {
            self.fill_row(xi, &mut row);
            for (j, &v) in row.iter().enumerate() {
                x[(i, j)] = v;
            }
        }
        x
    }

    /// Evaluate `Σ β_j B_j(x)`, continuing linearly outside the range.
    pub fn evaluate(&self, coef: &[f64], x: f64) -> f64 {
        let inside = |t: f64| {
            let mut row = vec![0.0; self.len()];
            self.fill_row(t, &mut row);
            row.iter().zip(coef).map(|(b, c)| b * c).sum::<f64>()
        };
        self.extrapolate(x, inside)
    }

    /// Linear continuation of `f` beyond the basis range.
    ///
    /// The slope is the one-sided difference over a small fraction of a segment
    /// at the nearest boundary.
    pub fn extrapolate<F: Fn(f64) -> f64>(&self, x: f64, f: F) -> f64 {
        let h = 1e-4 * self.spacing();
        if x < self.lower {
            let f0 = f(self.lower);
            let slope = (f(self.lower + h) - f0) / h;
            f0 + slope * (x - self.lower)
        } else if x > self.upper {
            let f1 = f(self.upper);
            let slope = (f1 - f(self.upper - h)) / h;
            f1 + slope * (x - self.upper)
        } else {
            f(x)
        }
    }
}

/// Penalty matrix `DᵀD` for `order`-th differences of `num_basis` coefficients.
pub fn difference_penalty(num_basis: usize, order: usize) -> Result<DMatrix<f64>> {
    if order == 0 || order >= num_basis {
        return Err(FitError::InvalidConfig(format!(
            "penalty order {order} must be in 1..{num_basis}"
        )));
    }

    let mut d = DMatrix::<f64>::identity(num_basis, num_basis);
    for _ in 0..order {
        let rows = d.nrows();
        let mut next = DMatrix::<f64>::zeros(rows - 1, num_basis);
        for i in 0..rows - 1 {
            for j in 0..num_basis {
                next[(i, j)] = d[(i + 1, j)] - d[(i, j)];
            }
        }
        d = next;
    }

    Ok(d.transpose() * d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basis_is_partition_of_unity() {
        let basis = PSplineBasis::new(20.0, 80.0, 10, 3).unwrap();
        let mut row = vec![0.0; basis.len()];
        for &x in &[20.0, 20.5, 33.3, 50.0, 79.99, 80.0] {
            basis.fill_row(x, &mut row);
            let total: f64 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-12, "sum at {x} = {total}");
            assert!(row.iter().all(|v| *v >= -1e-15));
        }
    }

    #[test]
    fn linear_coefficients_reproduce_a_line() {
        // Greville abscissae of equally spaced cubic B-splines are knot averages,
        // so coefficients linear in the index give a straight line.
        let basis = PSplineBasis::new(0.0, 10.0, 5, 3).unwrap();
        let coef: Vec<f64> = (0..basis.len()).map(|j| 2.0 + 0.5 * j as f64).collect();
        let f = |x: f64| basis.evaluate(&coef, x);
        let slope = (f(8.0) - f(2.0)) / 6.0;
        assert!(((f(5.0) - f(2.0)) / 3.0 - slope).abs() < 1e-10);
        // Extrapolation continues the same line.
        assert!(((f(12.0) - f(10.0)) / 2.0 - slope).abs() < 1e-6);
        assert!(((f(0.0) - f(-3.0)) / 3.0 - slope).abs() < 1e-6);
    }

    #[test]
    fn second_difference_penalty_annihilates_lines() {
        let s = difference_penalty(8, 2).unwrap();
        let line: Vec<f64> = (0..8).map(|j| 1.0 + 3.0 * j as f64).collect();
        let v = nalgebra::DVector::from_vec(line);
        let quad = (v.transpose() * &s * &v)[(0, 0)];
        assert!(quad.abs() < 1e-9);
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(PSplineBasis::new(5.0, 5.0, 10, 3).is_err());
        assert!(difference_penalty(3, 3).is_err());
    }
}
