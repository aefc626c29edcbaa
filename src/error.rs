//! Error types for zonal aggregation.

use polars::prelude::PolarsError;
use thiserror::Error;

/// Error type returned by the pluggable backends (weight grid builder,
/// aggregator, remote engine, raster reader).
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for zonal operations.
#[derive(Error, Debug)]
pub enum ZonalError {
    #[error("{0}")]
    MissingArgument(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("raster shape ({rows}, {cols}) does not match weight grid shape ({weight_rows}, {weight_cols})")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        weight_rows: usize,
        weight_cols: usize,
    },

    #[error(transparent)]
    Polars(#[from] PolarsError),

    /// Failure raised by a backend, passed through untouched.
    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for ZonalError {
    fn from(e: BackendError) -> Self {
        ZonalError::Backend(e)
    }
}

/// Result type alias for zonal operations.
pub type Result<T> = std::result::Result<T, ZonalError>;
