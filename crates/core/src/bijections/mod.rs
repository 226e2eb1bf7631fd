//! Invertible maps with tractable Jacobian log-determinants.
//!
//! Every bijection works on batches: points are `(batch, dim)`, an optional
//! condition is `(batch, cond_dim)` (or a single `(cond_dim,)` row that is
//! broadcast), and log-determinants come back as `(batch,)`.
//!
//! | Bijection | Module | Inverse |
//! |-----------|--------|---------|
//! | [`Affine`], [`TriangularAffine`] | [`affine`] | closed form / forward substitution |
//! | [`Exp`], [`Tanh`], [`Permute`], [`Flip`] | [`elementwise`] | closed form |
//! | [`Chain`], [`Invert`] | [`chain`] | composed |
//! | [`Coupling`] | [`coupling`] | one pass |
//! | [`MaskedAutoregressive`] | [`masked_autoregressive`] | `dim` passes |
//! | [`BlockAutoregressiveNetwork`] | [`bnaf`] | none |

pub mod affine;
pub mod bnaf;
pub mod chain;
pub mod coupling;
pub mod elementwise;
pub mod masked_autoregressive;

use candle_core::Tensor;

use crate::error::Result;

pub use affine::{Affine, TriangularAffine};
pub use bnaf::{BlockAutoregressiveLinear, BlockAutoregressiveNetwork};
pub use chain::{Chain, Invert};
pub use coupling::Coupling;
pub use elementwise::{Exp, Flip, Permute, Tanh};
pub use masked_autoregressive::MaskedAutoregressive;

pub trait Bijection: Send + Sync {
    /// Dimension of the points this bijection acts on.
    fn dim(&self) -> usize;

    /// Dimension of the conditioning variable, `None` if unconditional.
    fn cond_dim(&self) -> Option<usize> {
        None
    }

    /// Short type name used in error messages.
    fn name(&self) -> &'static str;

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)>;

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)>;

    fn transform(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        Ok(self.transform_and_log_det(x, condition)?.0)
    }

    fn inverse(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        Ok(self.inverse_and_log_det(y, condition)?.0)
    }
}

impl<B: Bijection + ?Sized> Bijection for Box<B> {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn cond_dim(&self) -> Option<usize> {
        (**self).cond_dim()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        (**self).transform_and_log_det(x, condition)
    }

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        (**self).inverse_and_log_det(y, condition)
    }

    fn transform(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        (**self).transform(x, condition)
    }

    fn inverse(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        (**self).inverse(y, condition)
    }
}
