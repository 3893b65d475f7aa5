//! Model fitting.
//!
//! Responsibilities:
//!
//! - fit one age-independent distribution per subject (`flat`)
//! - fit the pooled population model with age-dependent parameters
//!   (`population`, driven by the backfitting engine in `backfit`)
//! - choose smoothing parameters by GAIC / GCV over a log-spaced grid

pub mod backfit;
pub mod flat;
pub mod model;
pub mod population;
pub mod selection;
pub mod term;

pub use backfit::{BackfitProblem, BackfitSettings, BackfitState, run, update_block};
pub use flat::*;
pub use model::*;
pub use population::*;
pub use selection::*;
pub use term::*;
