//! `centile-curves` library crate.
//!
//! Age-conditioned reference centiles for a positive continuous measurement:
//!
//! - per-subject flat fits of a BCPE-family distribution (`fit::flat`)
//! - screening of the age effect on each parameter (`screen`)
//! - a pooled penalized backfitting fit with P-spline terms in age
//!   (`fit::population`, `fit::backfit`)
//! - centile curves by cdf inversion (`centile`)
//!
//! The crate installs no logger; it reports through the `log` facade.

pub mod centile;
pub mod data;
pub mod domain;
pub mod error;
pub mod family;
pub mod fit;
pub mod io;
pub mod math;
pub mod pipeline;
pub mod report;
pub mod screen;

pub use error::{FitError, Result};
