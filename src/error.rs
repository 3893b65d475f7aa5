use thiserror::Error;

/// Errors produced by the fitting pipeline.
///
/// Every variant maps to a process-style exit code (see [`FitError::exit_code`])
/// so front-ends can keep the convention: `2` for bad input or configuration,
/// `3` for insufficient data, `4` for numerical failures.
#[derive(Debug, Clone, Error)]
pub enum FitError {
    /// Non-positive `mu`/`sigma`/`tau`, a value outside the support, or a
    /// probability outside `(0, 1)`.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The quantile root-finder did not converge within its iteration cap.
    #[error("numerical non-convergence: {0}")]
    NumericalNonConvergence(String),

    /// A fitter exceeded its cycle cap (or time budget) without meeting the
    /// deviance-change tolerance.
    #[error("convergence failure after {cycles} cycles: {reason}")]
    ConvergenceFailure { cycles: usize, reason: String },

    /// Too few observations, or too few distinct ages, for the requested fit.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Malformed samples, ages or centile levels.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FitError {
    pub fn exit_code(&self) -> u8 {
        match self {
            FitError::InvalidParameter(_)
            | FitError::InvalidInput(_)
            | FitError::InvalidConfig(_)
            | FitError::Io(_)
            | FitError::Serialization(_) => 2,
            FitError::InsufficientData(_) => 3,
            FitError::NumericalNonConvergence(_) | FitError::ConvergenceFailure { .. } => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, FitError>;
