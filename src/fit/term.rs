//! Additive terms for a single distribution parameter.
//!
//! A term describes `η(age) = g(θ(age))` on the link scale. It is either a
//! constant (one coefficient) or a P-spline in age (one coefficient per
//! basis function). Parameters a family does not estimate carry a pinned
//! constant term with zero degrees of freedom.

use serde::{Deserialize, Serialize};

use crate::domain::LinkKind;
use crate::math::PSplineBasis;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTerm {
    kind: LinkKind,
    basis: Option<PSplineBasis>,
    coef: Vec<f64>,
    lambda: f64,
    edf: f64,
}

impl ParamTerm {
    /// Estimated constant starting at `eta`.
    pub fn constant(eta: f64) -> Self {
        Self {
            kind: LinkKind::Constant,
            basis: None,
            coef: vec![eta],
            lambda: 0.0,
            edf: 1.0,
        }
    }

    /// Constant that is never estimated.
    pub fn pinned(eta: f64) -> Self {
        Self {
            edf: 0.0,
            ..Self::constant(eta)
        }
    }

    /// Smooth term starting flat at `eta` (the B-spline basis sums to one).
    pub fn smooth(basis: PSplineBasis, eta: f64) -> Self {
        let k = basis.len();
        Self {
            kind: LinkKind::Smooth,
            basis: Some(basis),
            coef: vec![eta; k],
            lambda: 0.0,
            edf: k as f64,
        }
    }

    /// Copy with new coefficients and smoothing diagnostics.
    ///
    /// # Panics
    /// Panics if `coef` does not match the number of coefficients.
    pub fn with_coefficients(&self, coef: Vec<f64>, lambda: f64, edf: f64) -> Self {
        assert_eq!(coef.len(), self.coef.len(), "coefficient count mismatch");
        Self {
            kind: self.kind,
            basis: self.basis.clone(),
            coef,
            lambda,
            edf,
        }
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn basis(&self) -> Option<&PSplineBasis> {
        self.basis.as_ref()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coef
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn edf(&self) -> f64 {
        self.edf
    }

    /// Link-scale value at `age`.
    pub fn eta(&self, age: f64) -> f64 {
        match &self.basis {
            None => self.coef[0],
            Some(basis) => basis.evaluate(&self.coef, age),
        }
    }
}
