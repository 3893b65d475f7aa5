//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - input data (`Observation`, `Sample`)
//! - distribution parameters and their names (`DistributionParams`, `Param`)
//! - population-fit choices (`LinkKind`, `LinkSpec`, `WeightScheme`)
//! - run configuration (`FitConfig`)

pub mod config;
pub mod types;

pub use config::*;
pub use types::*;
