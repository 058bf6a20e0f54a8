use faer_cholesky::llt::CholeskyError;
use thiserror::Error;

/// A result type for the GP regression engine
pub type Result<T> = std::result::Result<T, ProcessError>;

#[derive(Error, Debug, Clone, PartialEq)]
/// Error in the GP
pub enum ProcessError {
    /// the input arrays are of different length, or a matrix is not square
    #[error("mismatched inputs: {0}")]
    MismatchedInputs(String),
    /// the number of input columns does not match the model dimension
    #[error("dimension mismatch: expected {expected} columns, found {found}")]
    DimensionMismatch {
        /// dimension the model was built with
        expected: usize,
        /// dimension of the offending input
        found: usize,
    },
    /// a construction or kernel parameter is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// fewer training rows than a single minibatch
    #[error("{n_samples} samples cannot fill a minibatch of {batch_size}")]
    InsufficientSamples {
        /// rows in the training set
        n_samples: usize,
        /// configured minibatch size
        batch_size: usize,
    },
    /// cholesky decomposition failure
    #[error("cholesky decomposition failure: covariance is not positive definite")]
    CholeskyFailure,
    /// a determinant, inverse, loss, gradient or prediction is NaN or infinite
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    /// prediction requested before any call to fit
    #[error("the process must be fitted before use")]
    NotFitted,
    /// scratch space requirement for a faer routine overflowed
    #[error("workspace size overflow")]
    WorkspaceOverflow,
}

impl From<CholeskyError> for ProcessError {
    fn from(_e: CholeskyError) -> ProcessError {
        ProcessError::CholeskyFailure
    }
}
