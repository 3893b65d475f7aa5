//! Link functions mapping a parameter to its unconstrained predictor scale.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    Identity,
    Log,
}

impl Link {
    /// `η = g(θ)`.
    pub fn link(self, theta: f64) -> f64 {
        match self {
            Link::Identity => theta,
            Link::Log => theta.ln(),
        }
    }

    /// `θ = g⁻¹(η)`.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Link::Identity => eta,
            Link::Log => eta.exp(),
        }
    }
}
