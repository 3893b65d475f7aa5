//! Mathematical utilities: spline bases, penalized least squares, root-finding.

pub mod basis;
pub mod ols;
pub mod root;

pub use basis::*;
pub use ols::*;
pub use root::*;
