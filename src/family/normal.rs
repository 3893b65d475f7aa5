//! Normal (NO) distribution with mean `mu` and standard deviation `sigma`.

use std::f64::consts::{PI, SQRT_2};

use statrs::function::erf::erfc;

pub fn log_pdf(y: f64, mu: f64, sigma: f64) -> f64 {
    let r = (y - mu) / sigma;
    -0.5 * r * r - sigma.ln() - 0.5 * (2.0 * PI).ln()
}

pub fn cdf(y: f64, mu: f64, sigma: f64) -> f64 {
    0.5 * erfc(-(y - mu) / (sigma * SQRT_2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_normal_reference_values() {
        assert!((cdf(0.0, 0.0, 1.0) - 0.5).abs() < 1e-15);
        assert!((cdf(-2.0, 0.0, 1.0) - 0.022_750_131_948_179).abs() < 1e-10);
        assert!((log_pdf(0.0, 0.0, 1.0) + 0.918_938_533_204_672_7).abs() < 1e-12);
    }
}
