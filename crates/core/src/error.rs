//! Error type for flow construction and evaluation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("shape mismatch for {context}: expected {expected:?}, got {got:?}")]
    Shape {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{0} has no tractable inverse")]
    NotInvertible(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("condition mismatch: {0}")]
    ConditionMismatch(String),
}

/// Check that `x` is `(batch, dim)` and return `batch`.
pub(crate) fn check_points(context: &'static str, x: &candle_core::Tensor, dim: usize) -> Result<usize> {
    match x.dims() {
        &[batch, d] if d == dim => Ok(batch),
        other => Err(Error::Shape {
            context,
            expected: vec![0, dim],
            got: other.to_vec(),
        }),
    }
}
