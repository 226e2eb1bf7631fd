//! Masked autoregressive layer: transformer parameters for `x[i]` come from
//! a MADE network that only sees `x[..i]` and the condition.
//!
//! The forward direction takes one network pass. The inverse has to recover
//! the inputs one dimension at a time, so it takes `dim` passes.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use nflow_common::Activation;

use super::Bijection;
use crate::error::{check_points, Result};
use crate::nn::AutoregressiveMlp;
use crate::ops::{broadcast_condition, cat_condition};
use crate::transformers::Transformer;

pub struct MaskedAutoregressive {
    dim: usize,
    cond_dim: Option<usize>,
    transformer: Box<dyn Transformer>,
    autoregressive_mlp: AutoregressiveMlp,
}

impl MaskedAutoregressive {
    pub fn new(
        dim: usize,
        cond_dim: Option<usize>,
        transformer: Box<dyn Transformer>,
        nn_width: usize,
        nn_depth: usize,
        nn_activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let autoregressive_mlp = AutoregressiveMlp::new(
            dim,
            cond_dim,
            transformer.num_params(),
            nn_width,
            nn_depth,
            nn_activation,
            vb.pp("made"),
        )?;
        Ok(Self {
            dim,
            cond_dim,
            transformer,
            autoregressive_mlp,
        })
    }

    fn params(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        let nn_input = cat_condition(x, condition)?.contiguous()?;
        Ok(self.autoregressive_mlp.forward(&nn_input)?)
    }
}

impl Bijection for MaskedAutoregressive {
    fn dim(&self) -> usize {
        self.dim
    }

    fn cond_dim(&self) -> Option<usize> {
        self.cond_dim
    }

    fn name(&self) -> &'static str {
        "MaskedAutoregressive"
    }

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("MaskedAutoregressive input", x, self.dim)?;
        let condition = broadcast_condition(condition, self.cond_dim, batch)?;
        let params = self.params(x, condition.as_ref())?;
        let (y, log_det) = self.transformer.transform_and_log_det(x, &params)?;
        Ok((y, log_det.sum(1)?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("MaskedAutoregressive input", y, self.dim)?;
        let condition = broadcast_condition(condition, self.cond_dim, batch)?;
        // After pass i, x[..=i] is exact; the last pass therefore sees the
        // exact prefix for every dimension.
        let mut x = y.zeros_like()?;
        let mut log_det = None;
        for _ in 0..self.dim {
            let params = self.params(&x, condition.as_ref())?;
            let (next, ld) = self.transformer.inverse_and_log_det(y, &params)?;
            x = next;
            log_det = Some(ld);
        }
        let log_det = match log_det {
            Some(ld) => ld.sum(1)?,
            None => crate::ops::zeros_batch(batch, y.device())?,
        };
        Ok((x, log_det))
    }
}
