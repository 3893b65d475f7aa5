//! Box-Cox power-exponential (BCPE) distribution.
//!
//! For `y > 0` the Box-Cox transform
//!
//! - `z = ((y/mu)^nu - 1) / (nu * sigma)` for `nu != 0`
//! - `z = ln(y/mu) / sigma` for `nu = 0`
//!
//! is modeled as a power-exponential variable with kurtosis parameter `tau`
//! (unit variance parameterisation). `tau = 2` gives the normal kernel (BCCG).
//!
//! Because `y > 0` bounds `z` on one side (`z > -1/(sigma*nu)` for `nu > 0`,
//! `z < 1/(sigma*|nu|)` for `nu < 0`), both the density and the cdf are
//! renormalised by the kernel mass `F_T(1/(sigma*|nu|))`.
//!
//! Numerical notes:
//! - `(y/mu)^nu - 1` is computed as `expm1(nu * ln(y/mu))`, which is accurate
//!   for small `nu` and converges to the `nu = 0` form continuously.
//! - Tails of the kernel cdf come from the regularized upper incomplete gamma
//!   function, so probabilities near 0 keep their relative precision.
//! - With `nu = 1`, `tau = 2` the median sits above `mu` by less than 1e-6
//!   (relative) for `sigma <= 0.2`; the gap grows to about 1% at `sigma = 0.5`.
//!
//! These functions assume validated parameters; see `Family` for the checked API.
//! The kernel functions return NaN rather than panic when `tau` is unusable.

use std::f64::consts::LN_2;

use statrs::function::gamma::{checked_gamma_ur, ln_gamma};

/// `|nu|` below this is treated as the log-scale limit `nu = 0`.
pub const NU_ZERO: f64 = 1e-10;

/// Box-Cox transform of `y` around `mu`.
pub fn box_cox_z(y: f64, mu: f64, sigma: f64, nu: f64) -> f64 {
    let log_ratio = (y / mu).ln();
    if nu.abs() < NU_ZERO {
        log_ratio / sigma
    } else {
        (nu * log_ratio).exp_m1() / (nu * sigma)
    }
}

/// `ln c(tau)` with `c^2 = 2^(-2/tau) Γ(1/tau) / Γ(3/tau)`.
fn log_c(tau: f64) -> f64 {
    0.5 * (-(2.0 / tau) * LN_2 + ln_gamma(1.0 / tau) - ln_gamma(3.0 / tau))
}

fn valid_tau(tau: f64) -> bool {
    tau.is_finite() && tau > 0.0 && (1.0 / tau).is_finite() && 1.0 / tau > 0.0
}

/// Log-density of the standardized power-exponential kernel; NaN for an
/// unusable `tau`.
pub fn pe_log_pdf(z: f64, tau: f64) -> f64 {
    if !valid_tau(tau) {
        return f64::NAN;
    }
    let lc = log_c(tau);
    let scaled = (z / lc.exp()).abs();
    tau.ln() - lc - 0.5 * scaled.powf(tau) - (1.0 + 1.0 / tau) * LN_2 - ln_gamma(1.0 / tau)
}

/// Cdf of the standardized power-exponential kernel; NaN for an unusable `tau`.
pub fn pe_cdf(z: f64, tau: f64) -> f64 {
    if !valid_tau(tau) || z.is_nan() {
        return f64::NAN;
    }
    if z == 0.0 {
        return 0.5;
    }
    if z == f64::INFINITY {
        return 1.0;
    }
    if z == f64::NEG_INFINITY {
        return 0.0;
    }
    let s = 0.5 * (z / log_c(tau).exp()).abs().powf(tau);
    let tail = 0.5 * upper_gamma(1.0 / tau, s);
    if z < 0.0 { tail } else { 1.0 - tail }
}

/// Regularized upper incomplete gamma `Q(a, s)` with the end points handled.
fn upper_gamma(a: f64, s: f64) -> f64 {
    if s <= 0.0 {
        1.0
    } else if !s.is_finite() {
        0.0
    } else {
        checked_gamma_ur(a, s).unwrap_or(f64::NAN)
    }
}

/// `ln F_T(1/(sigma*|nu|))`, the log of the kernel mass reachable by `y > 0`.
fn log_truncation_mass(sigma: f64, nu: f64, tau: f64) -> f64 {
    if nu.abs() < NU_ZERO {
        0.0
    } else {
        pe_cdf(1.0 / (sigma * nu.abs()), tau).ln()
    }
}

/// Log-density of BCPE at `y`; `-inf` outside the support.
pub fn log_pdf(y: f64, mu: f64, sigma: f64, nu: f64, tau: f64) -> f64 {
    if !(y.is_finite() && y > 0.0) {
        return f64::NEG_INFINITY;
    }
    let z = box_cox_z(y, mu, sigma, nu);
    // ln |dz/dy| = (nu - 1) ln y - nu ln mu - ln sigma
    let log_jacobian = nu * (y / mu).ln() - y.ln() - sigma.ln();
    pe_log_pdf(z, tau) + log_jacobian - log_truncation_mass(sigma, nu, tau)
}

/// Cdf of BCPE at `y`.
pub fn cdf(y: f64, mu: f64, sigma: f64, nu: f64, tau: f64) -> f64 {
    if y <= 0.0 {
        return 0.0;
    }
    if y == f64::INFINITY {
        return 1.0;
    }
    let z = box_cox_z(y, mu, sigma, nu);
    if nu.abs() < NU_ZERO {
        return pe_cdf(z, tau);
    }

    let bound = 1.0 / (sigma * nu.abs());
    let mass = pe_cdf(bound, tau);
    let below_support = if nu > 0.0 { pe_cdf(-bound, tau) } else { 0.0 };
    ((pe_cdf(z, tau) - below_support) / mass).clamp(0.0, 1.0)
}
