//! Input/output helpers.
//!
//! - fitted model JSON read/write (`model`)

pub mod model;

pub use model::*;
