//! Error taxonomy for the fitting engine.
//!
//! Invalid input shape is reported synchronously and has no effect on the
//! target. Numerical domain failures never propagate as errors here — they
//! are clamped/guarded at the point of evaluation and surfaced later as a
//! sanity-check diagnostic on the region. Optimizer non-convergence and
//! cancellation are carried inside `FitResult`, never raised as an error.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PeakFitError {
    #[error("invalid input shape: {0}")]
    InvalidShape(String),

    #[error("numerical domain failure: {0}")]
    Numerical(String),

    #[error("serialization mismatch: expected type `{expected}`, found `{found}`")]
    Serialization { expected: String, found: String },
}

pub type Result<T> = std::result::Result<T, PeakFitError>;

impl PeakFitError {
    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }

    pub fn numerical(msg: impl Into<String>) -> Self {
        Self::Numerical(msg.into())
    }

    pub fn serialization(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::Serialization {
            expected: expected.into(),
            found: found.into(),
        }
    }
}
