//! Block neural autoregressive network (BNAF).
//!
//! A stack of block-triangular linear layers with tanh activations in
//! between. Positive diagonal blocks (exponentiated, then weight-normalised)
//! keep every output monotone in its own input, and the strictly lower
//! blocks carry the autoregressive dependence on earlier inputs.
//!
//! The log-determinant is the sum over dimensions of `log dy_i/dx_i`, which
//! is built by composing per-block log-Jacobians with [`logmatmulexp`] from
//! the last layer back to the first. There is no closed-form inverse.

use candle_core::{Device, Tensor};
use candle_nn::{Init, VarBuilder};

use super::Bijection;
use crate::error::{check_points, Error, Result};
use crate::masks::{block_diag_mask, block_tril_mask, eye, mask_tensor};
use crate::ops::{logmatmulexp, tanh_log_grad};

// ── BlockAutoregressiveLinear ───────────────────────────────────────────────

/// Weight-normalised block-triangular linear layer with `n_blocks` blocks of
/// shape `(rows, cols)`: maps `n_blocks * cols` inputs to `n_blocks * rows`
/// outputs.
pub struct BlockAutoregressiveLinear {
    n_blocks: usize,
    block_shape: (usize, usize),
    weight: Tensor,
    bias: Tensor,
    log_scale: Tensor,
    diag_mask: Tensor,
    tril_mask: Tensor,
    diag_idx: Tensor,
}

impl BlockAutoregressiveLinear {
    pub fn new(n_blocks: usize, block_shape: (usize, usize), vb: VarBuilder) -> Result<Self> {
        let (r, c) = block_shape;
        let (out_dim, in_dim) = (n_blocks * r, n_blocks * c);
        let device = vb.device().clone();

        let glorot = (6.0 / (in_dim + out_dim) as f64).sqrt();
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            Init::Uniform {
                lo: -glorot,
                up: glorot,
            },
        )?;
        let bias_bound = 1.0 / (out_dim as f64).sqrt();
        let bias = vb.get_with_hints(
            out_dim,
            "bias",
            Init::Uniform {
                lo: -bias_bound,
                up: bias_bound,
            },
        )?;
        let log_scale = vb.get_with_hints((out_dim, 1), "log_scale", Init::Uniform { lo: -1.0, up: 0.0 })?;

        // Flat indices of the diagonal-block entries, block-major.
        let mut idx = Vec::with_capacity(n_blocks * r * c);
        for row in 0..out_dim {
            let block = row / r;
            for k in 0..c {
                idx.push((row * in_dim + block * c + k) as u32);
            }
        }

        Ok(Self {
            n_blocks,
            block_shape,
            weight,
            bias,
            log_scale,
            diag_mask: mask_tensor(block_diag_mask(block_shape, n_blocks), out_dim, in_dim, &device)?,
            tril_mask: mask_tensor(block_tril_mask(block_shape, n_blocks), out_dim, in_dim, &device)?,
            diag_idx: Tensor::from_vec(idx, n_blocks * r * c, &device)?,
        })
    }

    /// `exp(W)` on diagonal blocks, `W` below them, each row scaled to norm
    /// `exp(log_scale)`.
    pub fn normalised_weight(&self) -> Result<Tensor> {
        let w = ((self.weight.exp()? * &self.diag_mask)? + (&self.weight * &self.tril_mask)?)?;
        let norms = w.sqr()?.sum_keepdim(1)?.sqrt()?;
        Ok(w.broadcast_div(&norms)?.broadcast_mul(&self.log_scale.exp()?)?)
    }

    /// Returns the output `(batch, n_blocks * rows)` and the log of the
    /// diagonal blocks `(n_blocks, rows, cols)`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let w = self.normalised_weight()?;
        let y = x.matmul(&w.t()?)?.broadcast_add(&self.bias)?;
        let (r, c) = self.block_shape;
        let log_jac = w
            .flatten_all()?
            .index_select(&self.diag_idx, 0)?
            .reshape((self.n_blocks, r, c))?
            .log()?;
        Ok((y, log_jac))
    }
}

// ── BlockAutoregressiveNetwork ──────────────────────────────────────────────

pub struct BlockAutoregressiveNetwork {
    dim: usize,
    block_dim: usize,
    layers: Vec<BlockAutoregressiveLinear>,
    eye_mask: Tensor,
}

impl BlockAutoregressiveNetwork {
    /// `depth` hidden block layers of `block_dim` units per dimension.
    pub fn new(dim: usize, depth: usize, block_dim: usize, vb: VarBuilder) -> Result<Self> {
        if depth == 0 || block_dim == 0 {
            return Err(Error::InvalidConfig(
                "BNAF needs depth >= 1 and block_dim >= 1".into(),
            ));
        }
        let mut shapes = vec![(block_dim, 1)];
        shapes.extend(std::iter::repeat((block_dim, block_dim)).take(depth - 1));
        shapes.push((1, block_dim));

        let layers = shapes
            .into_iter()
            .enumerate()
            .map(|(i, shape)| BlockAutoregressiveLinear::new(dim, shape, vb.pp(format!("layer_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let eye_mask = eye_u8(block_dim, vb.device())?;
        Ok(Self {
            dim,
            block_dim,
            layers,
            eye_mask,
        })
    }

    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    /// Block log-Jacobian of tanh: `log tanh'(h)` on each block diagonal,
    /// `-inf` elsewhere. Shape `(batch, dim, block_dim, block_dim)`.
    fn tanh_log_jac(&self, h: &Tensor, batch: usize) -> Result<Tensor> {
        let shape = (batch, self.dim, self.block_dim, self.block_dim);
        let vals = tanh_log_grad(h)?
            .reshape((batch, self.dim, self.block_dim, 1))?
            .broadcast_as(shape)?
            .contiguous()?;
        let neg_inf = Tensor::full(f32::NEG_INFINITY, shape, h.device())?;
        let mask = self.eye_mask.broadcast_as(shape)?.contiguous()?;
        Ok(mask.where_cond(&vals, &neg_inf)?)
    }
}

fn eye_u8(n: usize, device: &Device) -> Result<Tensor> {
    let m: Vec<u8> = eye(n).into_iter().map(|v| v as u8).collect();
    Ok(Tensor::from_vec(m, (n, n), device)?)
}

impl Bijection for BlockAutoregressiveNetwork {
    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &'static str {
        "BlockAutoregressiveNetwork"
    }

    fn transform_and_log_det(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("BlockAutoregressiveNetwork input", x, self.dim)?;
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        let mut log_jacs = Vec::with_capacity(2 * self.layers.len() - 1);
        for (i, layer) in self.layers.iter().enumerate() {
            let (out, lj) = layer.forward(&h)?;
            let (n, r, c) = lj.dims3()?;
            log_jacs.push(lj.unsqueeze(0)?.broadcast_as((batch, n, r, c))?.contiguous()?);
            h = out;
            if i < last {
                log_jacs.push(self.tanh_log_jac(&h, batch)?);
                h = h.tanh()?;
            }
        }

        let mut acc = match log_jacs.pop() {
            Some(t) => t,
            None => return Err(Error::InvalidConfig("BNAF has no layers".into())),
        };
        for lj in log_jacs.iter().rev() {
            acc = logmatmulexp(&acc, lj)?;
        }
        // (batch, dim, 1, 1) → (batch,)
        let log_det = acc.reshape((batch, self.dim))?.sum(1)?;
        Ok((h, log_det))
    }

    fn inverse_and_log_det(&self, _y: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        Err(Error::NotInvertible("BlockAutoregressiveNetwork"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{assert_log_det_matches, max_abs_diff};
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn network(depth: usize) -> BlockAutoregressiveNetwork {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        BlockAutoregressiveNetwork::new(3, depth, 4, vb).unwrap()
    }

    fn x() -> Tensor {
        Tensor::new(&[[0.5f32, -1.0, 2.0], [1.5, 0.2, -0.3]], &Device::Cpu).unwrap()
    }

    #[test]
    fn layer_shapes() {
        let net = network(2);
        assert_eq!(net.depth(), 2);
        let (y, ld) = net.transform_and_log_det(&x(), None).unwrap();
        assert_eq!(y.dims(), &[2, 3]);
        assert_eq!(ld.dims(), &[2]);
    }

    #[test]
    fn log_det_matches_finite_differences() {
        assert_log_det_matches(&network(1), &x(), None, 2e-2);
        assert_log_det_matches(&network(3), &x(), None, 2e-2);
    }

    #[test]
    fn output_is_autoregressive() {
        let net = network(2);
        let dev = Device::Cpu;
        let a = Tensor::new(&[[0.5f32, -1.0, 2.0]], &dev).unwrap();
        let b = Tensor::new(&[[0.5f32, -1.0, -7.0]], &dev).unwrap();
        let ya = net.transform(&a, None).unwrap();
        let yb = net.transform(&b, None).unwrap();
        assert!(max_abs_diff(&ya.narrow(1, 0, 2).unwrap(), &yb.narrow(1, 0, 2).unwrap()) < 1e-6);
    }

    #[test]
    fn inverse_is_not_available() {
        let err = network(1).inverse(&x(), None).unwrap_err();
        assert!(matches!(err, Error::NotInvertible(_)));
    }

    #[test]
    fn diagonal_blocks_are_positive() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = BlockAutoregressiveLinear::new(2, (3, 2), vb).unwrap();
        let w: Vec<Vec<f32>> = layer.normalised_weight().unwrap().to_vec2().unwrap();
        for (row, values) in w.iter().enumerate() {
            let block = row / 3;
            for (col, v) in values.iter().enumerate() {
                match (col / 2).cmp(&block) {
                    std::cmp::Ordering::Equal => assert!(*v > 0.0),
                    std::cmp::Ordering::Greater => assert_eq!(*v, 0.0),
                    std::cmp::Ordering::Less => {}
                }
            }
        }
    }
}
