//! Coupling layer: the first `untransformed_dim` inputs (plus any condition)
//! parameterise an element-wise transformer applied to the rest.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use nflow_common::Activation;

use super::Bijection;
use crate::error::{check_points, Error, Result};
use crate::nn::Mlp;
use crate::ops::{broadcast_condition, cat_condition};
use crate::transformers::Transformer;

pub struct Coupling {
    dim: usize,
    cond_dim: Option<usize>,
    untransformed_dim: usize,
    transformer: Box<dyn Transformer>,
    conditioner: Mlp,
}

impl Coupling {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        cond_dim: Option<usize>,
        untransformed_dim: usize,
        transformer: Box<dyn Transformer>,
        nn_width: usize,
        nn_depth: usize,
        nn_activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        if untransformed_dim == 0 || untransformed_dim >= dim {
            return Err(Error::InvalidConfig(format!(
                "coupling needs 0 < untransformed_dim < dim, got {untransformed_dim} of {dim}"
            )));
        }
        let transformed = dim - untransformed_dim;
        let conditioner = Mlp::new(
            untransformed_dim + cond_dim.unwrap_or(0),
            transformed * transformer.num_params(),
            nn_width,
            nn_depth,
            nn_activation,
            vb.pp("conditioner"),
        )?;
        Ok(Self {
            dim,
            cond_dim,
            untransformed_dim,
            transformer,
            conditioner,
        })
    }

    pub fn untransformed_dim(&self) -> usize {
        self.untransformed_dim
    }

    /// Split `x`, run the conditioner and return `(x_cond, x_trans, params)`.
    fn split(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor, Tensor)> {
        let batch = check_points("Coupling input", x, self.dim)?;
        let condition = broadcast_condition(condition, self.cond_dim, batch)?;
        let transformed = self.dim - self.untransformed_dim;
        let x_cond = x.narrow(1, 0, self.untransformed_dim)?;
        let x_trans = x.narrow(1, self.untransformed_dim, transformed)?;
        let nn_input = cat_condition(&x_cond, condition.as_ref())?.contiguous()?;
        let params = self
            .conditioner
            .forward(&nn_input)?
            .reshape((batch, transformed, self.transformer.num_params()))?;
        Ok((x_cond, x_trans, params))
    }
}

impl Bijection for Coupling {
    fn dim(&self) -> usize {
        self.dim
    }

    fn cond_dim(&self) -> Option<usize> {
        self.cond_dim
    }

    fn name(&self) -> &'static str {
        "Coupling"
    }

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (x_cond, x_trans, params) = self.split(x, condition)?;
        let (y_trans, log_det) = self.transformer.transform_and_log_det(&x_trans, &params)?;
        let y = Tensor::cat(&[&x_cond, &y_trans], 1)?.contiguous()?;
        Ok((y, log_det.sum(1)?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (y_cond, y_trans, params) = self.split(y, condition)?;
        let (x_trans, log_det) = self.transformer.inverse_and_log_det(&y_trans, &params)?;
        let x = Tensor::cat(&[&y_cond, &x_trans], 1)?.contiguous()?;
        Ok((x, log_det.sum(1)?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{assert_log_det_matches, assert_round_trip, max_abs_diff};
    use super::*;
    use crate::transformers::{AffineTransformer, RationalQuadraticSpline};
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn randomise(varmap: &VarMap) {
        for var in varmap.all_vars() {
            let t = var.as_tensor();
            var.set(&Tensor::randn(0f32, 0.5, t.dims(), t.device()).unwrap()).unwrap();
        }
    }

    fn layer(transformer: Box<dyn Transformer>, cond_dim: Option<usize>) -> (VarMap, Coupling) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let c = Coupling::new(3, cond_dim, 1, transformer, 8, 1, Activation::Relu, vb).unwrap();
        (varmap, c)
    }

    #[test]
    fn fresh_layer_is_identity() {
        let (_varmap, c) = layer(Box::new(AffineTransformer), None);
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0]], &Device::Cpu).unwrap();
        let (y, ld) = c.transform_and_log_det(&x, None).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-7);
        assert_eq!(ld.to_vec1::<f32>().unwrap(), vec![0.0]);
    }

    #[test]
    fn affine_coupling_round_trip() {
        let (varmap, c) = layer(Box::new(AffineTransformer), None);
        randomise(&varmap);
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0], [1.5, 0.2, -0.3]], &Device::Cpu).unwrap();
        assert_round_trip(&c, &x, None, 1e-4);
        assert_log_det_matches(&c, &x, None, 2e-2);
        // The untransformed part passes through.
        let y = c.transform(&x, None).unwrap();
        assert!(max_abs_diff(&x.narrow(1, 0, 1).unwrap(), &y.narrow(1, 0, 1).unwrap()) < 1e-7);
    }

    #[test]
    fn conditional_spline_coupling_round_trip() {
        let (varmap, c) = layer(Box::new(RationalQuadraticSpline::new(5, 3.0)), Some(2));
        randomise(&varmap);
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0], [1.5, 0.2, -0.3]], &dev).unwrap();
        let cond = Tensor::new(&[[1.0f32, 0.0], [-1.0, 2.0]], &dev).unwrap();
        assert_round_trip(&c, &x, Some(&cond), 1e-3);
        assert_log_det_matches(&c, &x, Some(&cond), 2e-2);
        assert!(c.transform(&x, None).is_err());
    }

    #[test]
    fn rejects_bad_split() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Coupling::new(2, None, 2, Box::new(AffineTransformer), 4, 1, Activation::Relu, vb).is_err());
    }
}
