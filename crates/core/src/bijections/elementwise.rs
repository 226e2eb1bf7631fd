//! Parameter-free bijections: `Exp`, `Tanh`, and the volume-preserving
//! `Permute` / `Flip`.

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::RngCore;

use super::Bijection;
use crate::error::{check_points, Error, Result};
use crate::ops::{tanh_log_grad, zeros_batch};

// ── Exp ─────────────────────────────────────────────────────────────────────

/// `y = exp(x)`, mapping the reals onto the positive reals.
#[derive(Debug, Clone, Copy)]
pub struct Exp {
    dim: usize,
}

impl Exp {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Bijection for Exp {
    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &'static str {
        "Exp"
    }

    fn transform_and_log_det(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        check_points("Exp input", x, self.dim)?;
        Ok((x.exp()?, x.sum(1)?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        check_points("Exp input", y, self.dim)?;
        let x = y.log()?;
        let log_det = x.sum(1)?.neg()?;
        Ok((x, log_det))
    }
}

// ── Tanh ────────────────────────────────────────────────────────────────────

/// `y = tanh(x)`, mapping the reals onto `(-1, 1)`.
#[derive(Debug, Clone, Copy)]
pub struct Tanh {
    dim: usize,
}

impl Tanh {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Bijection for Tanh {
    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &'static str {
        "Tanh"
    }

    fn transform_and_log_det(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        check_points("Tanh input", x, self.dim)?;
        Ok((x.tanh()?, tanh_log_grad(x)?.sum(1)?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        check_points("Tanh input", y, self.dim)?;
        // atanh(y) = (ln(1 + y) - ln(1 - y)) / 2
        let x = ((y.affine(1.0, 1.0)?.log()? - y.affine(-1.0, 1.0)?.log()?)? * 0.5)?;
        let log_det = tanh_log_grad(&x)?.sum(1)?.neg()?;
        Ok((x, log_det))
    }
}

// ── Permute ─────────────────────────────────────────────────────────────────

/// Reorders dimensions: `y[:, i] = x[:, permutation[i]]`.
pub struct Permute {
    permutation: Vec<usize>,
    forward: Tensor,
    inverse: Tensor,
}

impl Permute {
    pub fn new(permutation: Vec<usize>, device: &Device) -> Result<Self> {
        let n = permutation.len();
        let mut inverse = vec![usize::MAX; n];
        for (i, &p) in permutation.iter().enumerate() {
            if p >= n || inverse[p] != usize::MAX {
                return Err(Error::InvalidParameter(format!(
                    "{permutation:?} is not a permutation of 0..{n}"
                )));
            }
            inverse[p] = i;
        }
        let to_tensor = |idx: &[usize]| {
            let idx: Vec<u32> = idx.iter().map(|&i| i as u32).collect();
            Tensor::from_vec(idx, n, device)
        };
        Ok(Self {
            forward: to_tensor(&permutation)?,
            inverse: to_tensor(&inverse)?,
            permutation,
        })
    }

    /// Uniformly random permutation of `0..dim`.
    pub fn random(dim: usize, rng: &mut dyn RngCore, device: &Device) -> Result<Self> {
        let mut perm: Vec<usize> = (0..dim).collect();
        perm.shuffle(rng);
        Self::new(perm, device)
    }

    pub fn permutation(&self) -> &[usize] {
        &self.permutation
    }
}

impl Bijection for Permute {
    fn dim(&self) -> usize {
        self.permutation.len()
    }

    fn name(&self) -> &'static str {
        "Permute"
    }

    fn transform_and_log_det(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("Permute input", x, self.dim())?;
        // index_select needs a contiguous input.
        Ok((x.contiguous()?.index_select(&self.forward, 1)?, zeros_batch(batch, x.device())?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("Permute input", y, self.dim())?;
        Ok((y.contiguous()?.index_select(&self.inverse, 1)?, zeros_batch(batch, y.device())?))
    }
}

// ── Flip ────────────────────────────────────────────────────────────────────

/// Reverses the order of the dimensions; its own inverse.
pub struct Flip(Permute);

impl Flip {
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        Ok(Self(Permute::new((0..dim).rev().collect(), device)?))
    }
}

impl Bijection for Flip {
    fn dim(&self) -> usize {
        self.0.dim()
    }

    fn name(&self) -> &'static str {
        "Flip"
    }

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.0.transform_and_log_det(x, condition)
    }

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.0.transform_and_log_det(y, condition)
    }
}
