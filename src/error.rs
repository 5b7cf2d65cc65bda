//! Error types for aa-shrinkage
//!
//! Every stage fails fast: the first error aborts the pipeline and no partial
//! results are returned.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// aa-shrinkage error types
#[derive(Error, Debug)]
pub enum Error {
    /// Simulation or configuration input out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A (experiment, condition, metric) group is too small to estimate a variance
    #[error(
        "Insufficient data: experiment {experiment} ({condition}, {metric}) has {observations} observation(s), need at least 2\nUse fewer experiments or a larger population"
    )]
    InsufficientData {
        /// Experiment bucket identifier
        experiment: u32,
        /// Arm of the experiment
        condition: String,
        /// Metric name
        metric: String,
        /// Number of observations found in the group
        observations: usize,
    },

    /// Estimate and standard-error matrices are not aligned
    #[error(
        "Shape mismatch: estimates are {}x{}, standard errors are {}x{}",
        estimates.0, estimates.1, standard_errors.0, standard_errors.1
    )]
    ShapeMismatch {
        /// (rows, columns) of the point-estimate matrix
        estimates: (usize, usize),
        /// (rows, columns) of the standard-error matrix
        standard_errors: (usize, usize),
    },

    /// Opaque failure surfaced from the shrinkage procedure
    #[error("Shrinkage procedure failed during {stage}: {message}")]
    ExternalProcedureFailure {
        /// Procedure call that failed
        stage: &'static str,
        /// Rendered error chain from the procedure
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Configuration or report (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::InvalidParameter`]
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// Wrap a procedure error, keeping its full context chain
    pub(crate) fn procedure(stage: &'static str, err: &anyhow::Error) -> Self {
        Self::ExternalProcedureFailure {
            stage,
            message: format!("{err:#}"),
        }
    }
}
