//! Penalized weighted least squares.
//!
//! Every smooth-term update reduces to
//!
//! ```text
//! minimize Σ w_i (z_i - x_iᵀ β)^2 + λ βᵀ P β
//! ```
//!
//! for a handful of `λ` values. We therefore accumulate the sufficient
//! statistics `XᵀWX`, `XᵀWz` and `zᵀWz` once and solve each `λ` from them.
//!
//! Implementation choices:
//! - Cholesky of `XᵀWX + λP` (symmetric positive definite whenever the data
//!   cover at least two distinct covariate values).
//! - If Cholesky fails we fall back to an SVD solve with progressively looser
//!   tolerances, the same way an ill-conditioned tall least-squares problem
//!   is handled.

use nalgebra::{DMatrix, DVector};

/// Sufficient statistics of a weighted least-squares problem.
#[derive(Debug, Clone)]
pub struct WeightedGram {
    pub xtwx: DMatrix<f64>,
    pub xtwz: DVector<f64>,
    pub ztwz: f64,
    pub sum_w: f64,
    pub n: usize,
}

impl WeightedGram {
    /// Accumulate `XᵀWX`, `XᵀWz`, `zᵀWz` from a design matrix.
    ///
    /// # Panics
    /// Panics if `w` or `z` do not have `x.nrows()` entries.
    pub fn from_design(x: &DMatrix<f64>, w: &[f64], z: &[f64]) -> Self {
        assert_eq!(w.len(), x.nrows());
        assert_eq!(z.len(), x.nrows());
        let k = x.ncols();
        let mut xtwx = DMatrix::<f64>::zeros(k, k);
        let mut xtwz = DVector::<f64>::zeros(k);
        let mut ztwz = 0.0;
        let mut sum_w = 0.0;

        for i in 0..x.nrows() {
            let wi = w[i];
            let zi = z[i];
            ztwz += wi * zi * zi;
            sum_w += wi;
            for a in 0..k {
                let xa = x[(i, a)];
                if xa == 0.0 {
                    continue;
                }
                xtwz[a] += wi * xa * zi;
                for b in a..k {
                    xtwx[(a, b)] += wi * xa * x[(i, b)];
                }
            }
        }
        for a in 0..k {
            for b in 0..a {
                xtwx[(a, b)] = xtwx[(b, a)];
            }
        }

        Self {
            xtwx,
            xtwz,
            ztwz,
            sum_w,
            n: x.nrows(),
        }
    }
}

/// Solution of one penalized least-squares problem.
#[derive(Debug, Clone)]
pub struct PenalizedFit {
    pub beta: DVector<f64>,
    /// `tr((XᵀWX + λP)⁻¹ XᵀWX)`.
    pub edf: f64,
    /// Weighted residual sum of squares `Σ w (z - Xβ)^2`.
    pub rss: f64,
}

/// Solve the penalized problem for a given `λ`.
///
/// Returns `None` if the system cannot be solved robustly.
pub fn solve_penalized(gram: &WeightedGram, penalty: &DMatrix<f64>, lambda: f64) -> Option<PenalizedFit> {
    let a = &gram.xtwx + penalty * lambda;

    let (beta, hat) = match a.clone().cholesky() {
        Some(chol) => (chol.solve(&gram.xtwz), chol.solve(&gram.xtwx)),
        None => {
            let beta = solve_symmetric(&a, &gram.xtwz)?;
            let mut hat = DMatrix::<f64>::zeros(a.nrows(), a.ncols());
            for j in 0..a.ncols() {
                let col = solve_symmetric(&a, &gram.xtwx.column(j).into_owned())?;
                hat.set_column(j, &col);
            }
            (beta, hat)
        }
    };

    if !beta.iter().all(|v| v.is_finite()) {
        return None;
    }

    let edf = hat.trace();
    // Σ w (z - Xβ)^2 = zᵀWz - 2βᵀXᵀWz + βᵀXᵀWXβ
    let fitted_quad = (beta.transpose() * &gram.xtwx * &beta)[(0, 0)];
    let rss = (gram.ztwz - 2.0 * beta.dot(&gram.xtwz) + fitted_quad).max(0.0);

    if edf.is_finite() && rss.is_finite() {
        Some(PenalizedFit { beta, edf, rss })
    } else {
        None
    }
}

/// Solve `A x = b` with an SVD, loosening the tolerance until a finite
/// solution comes out.
pub fn solve_symmetric(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = a.clone().svd(true, true);
    for &tol in &[1e-12, 1e-10, 1e-8, 1e-6] {
        if let Ok(x) = svd.solve(b, tol) {
            if x.iter().all(|v| v.is_finite()) {
                return Some(x);
            }
        }
    }
    None
}
