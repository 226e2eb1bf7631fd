//! Conditioner networks.
//!
//! | Network | Used by | Notes |
//! |---------|---------|-------|
//! | [`Mlp`] | coupling layers | plain dense layers |
//! | [`MaskedLinear`] | [`AutoregressiveMlp`] | weight ⊙ constant mask |
//! | [`AutoregressiveMlp`] | masked autoregressive layers | MADE rank masks |
//!
//! The output layer of every conditioner starts at zero, so a freshly built
//! flow layer emits all-zero transformer parameters (the identity map for
//! both transformers in [`crate::transformers`]).

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use nflow_common::Activation;

use crate::masks::{mask_tensor, rank_based_mask, tile_until_length};

const ZERO_INIT: Init = Init::Const(0.0);

/// Uniform fan-in init, matching `candle_nn::linear`.
fn fan_in_init(in_dim: usize) -> Init {
    let bound = 1.0 / (in_dim.max(1) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

#[inline]
pub fn activate(x: &Tensor, activation: Activation) -> Result<Tensor> {
    match activation {
        Activation::Relu => x.relu(),
        Activation::Tanh => x.tanh(),
        Activation::Silu => x.silu(),
    }
}

// ── Mlp ─────────────────────────────────────────────────────────────────────

/// Dense network: `depth` hidden layers of `width`, zero-initialised head.
pub struct Mlp {
    hidden: Vec<Linear>,
    head: Linear,
    activation: Activation,
}

impl Mlp {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        width: usize,
        depth: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut hidden = Vec::with_capacity(depth);
        let mut d = in_dim;
        for i in 0..depth {
            hidden.push(candle_nn::linear(d, width, vb.pp(format!("hidden_{i}")))?);
            d = width;
        }
        let head_vb = vb.pp("head");
        let w = head_vb.get_with_hints((out_dim, d), "weight", ZERO_INIT)?;
        let b = head_vb.get_with_hints(out_dim, "bias", ZERO_INIT)?;
        Ok(Self {
            hidden,
            head: Linear::new(w, Some(b)),
            activation,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        for layer in &self.hidden {
            h = activate(&layer.forward(&h)?, self.activation)?;
        }
        self.head.forward(&h)
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

// ── MaskedLinear ────────────────────────────────────────────────────────────

/// Linear layer whose effective weight is `weight ⊙ mask`.
///
/// The mask is a constant; masked-out latent weights still exist in the
/// `VarMap` but never receive gradient.
pub struct MaskedLinear {
    weight: Tensor,
    bias: Tensor,
    mask: Tensor,
}

impl MaskedLinear {
    /// `mask` is row-major `(out_dim, in_dim)`.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        mask: Vec<f32>,
        init: Init,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
        let bias_init = match init {
            Init::Const(_) => ZERO_INIT,
            _ => fan_in_init(in_dim),
        };
        let bias = vb.get_with_hints(out_dim, "bias", bias_init)?;
        let mask = mask_tensor(mask, out_dim, in_dim, vb.device())?;
        Ok(Self { weight, bias, mask })
    }

    /// Effective (masked) weight.
    pub fn masked_weight(&self) -> Result<Tensor> {
        &self.weight * &self.mask
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.masked_weight()?;
        x.matmul(&w.t()?)?.broadcast_add(&self.bias)
    }
}

impl Module for MaskedLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

// ── AutoregressiveMlp ───────────────────────────────────────────────────────

/// MADE network producing `num_params` outputs per input dimension.
///
/// Input ranks are `0..dim` followed by `-1` for every conditioning input, so
/// the condition is visible to all outputs. Output `(i, k)` (flattened as
/// `i * num_params + k`) depends only on inputs with rank `< i`.
pub struct AutoregressiveMlp {
    layers: Vec<MaskedLinear>,
    activation: Activation,
    dim: usize,
    num_params: usize,
}

impl AutoregressiveMlp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        cond_dim: Option<usize>,
        num_params: usize,
        width: usize,
        depth: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut in_ranks: Vec<i64> = (0..dim as i64).collect();
        in_ranks.extend(std::iter::repeat(-1).take(cond_dim.unwrap_or(0)));
        let hidden_ranks = tile_until_length(&(0..dim as i64).collect::<Vec<_>>(), width);
        let out_ranks: Vec<i64> = (0..dim as i64)
            .flat_map(|r| std::iter::repeat(r).take(num_params))
            .collect();

        let mut layers = Vec::with_capacity(depth + 1);
        let mut prev = in_ranks;
        for i in 0..depth {
            let mask = rank_based_mask(&prev, &hidden_ranks, false);
            layers.push(MaskedLinear::new(
                prev.len(),
                width,
                mask,
                fan_in_init(prev.len()),
                vb.pp(format!("hidden_{i}")),
            )?);
            prev = hidden_ranks.clone();
        }
        let mask = rank_based_mask(&prev, &out_ranks, true);
        layers.push(MaskedLinear::new(
            prev.len(),
            out_ranks.len(),
            mask,
            ZERO_INIT,
            vb.pp("head"),
        )?);

        Ok(Self {
            layers,
            activation,
            dim,
            num_params,
        })
    }

    /// `(batch, dim [+ cond_dim])` → `(batch, dim, num_params)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = x.clone();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last {
                h = activate(&h, self.activation)?;
            }
        }
        let batch = h.dim(0)?;
        h.reshape((batch, self.dim, self.num_params))
    }
}
