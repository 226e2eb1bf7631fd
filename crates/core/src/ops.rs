//! Tensor primitives shared by bijections and distributions.
//!
//! Everything here is composed from differentiable candle ops so gradients
//! reach the flow parameters without custom backward passes.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::error::{Error, Result as FlowResult};

/// `softplus(0) == 1` shift: `ln(e - 1)`.
pub const SOFTPLUS_INV_ONE: f64 = 0.541_324_854_612_918_1;

/// Numerically stable `ln(1 + exp(x))`.
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.relu()? + tail
}

/// Numerically stable `log(exp(x) @ exp(y))` over the last two dims.
///
/// The row/column maxima are detached before shifting, so they act as
/// constants in the backward pass.
pub fn logmatmulexp(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let x_shift = x.max_keepdim(D::Minus1)?.detach();
    let y_shift = y.max_keepdim(D::Minus2)?.detach();
    let ex = x.broadcast_sub(&x_shift)?.exp()?.contiguous()?;
    let ey = y.broadcast_sub(&y_shift)?.exp()?.contiguous()?;
    ex.matmul(&ey)?
        .log()?
        .broadcast_add(&x_shift)?
        .broadcast_add(&y_shift)
}

/// `log|d tanh(x)/dx| = -2 (x + softplus(-2x) - ln 2)`, element-wise.
pub fn tanh_log_grad(x: &Tensor) -> Result<Tensor> {
    let sp = softplus(&x.affine(-2.0, 0.0)?)?;
    (x + sp)?.affine(-2.0, 2.0 * std::f64::consts::LN_2)
}

/// Replace NaN entries with `-inf`.
pub fn nan_to_neg_inf(t: &Tensor) -> Result<Tensor> {
    let is_nan = t.ne(t)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, t.dims(), t.device())?.to_dtype(t.dtype())?;
    is_nan.where_cond(&neg_inf, t)
}

/// `(batch,)` zeros.
pub fn zeros_batch(batch: usize, device: &Device) -> Result<Tensor> {
    Tensor::zeros(batch, DType::F32, device)
}

/// Normalise a condition to `(batch, cond_dim)`.
///
/// Accepts `(cond_dim,)`, `(1, cond_dim)` (both broadcast over the batch)
/// or `(batch, cond_dim)`.
pub fn broadcast_condition(
    condition: Option<&Tensor>,
    cond_dim: Option<usize>,
    batch: usize,
) -> FlowResult<Option<Tensor>> {
    let (condition, cond_dim) = match (condition, cond_dim) {
        (_, None) => return Ok(None),
        (None, Some(d)) => {
            return Err(Error::ConditionMismatch(format!(
                "a condition of dimension {d} is required"
            )))
        }
        (Some(c), Some(d)) => (c, d),
    };
    let c = match condition.dims() {
        &[d] if d == cond_dim => condition.unsqueeze(0)?,
        &[_, d] if d == cond_dim => condition.clone(),
        other => {
            return Err(Error::Shape {
                context: "condition",
                expected: vec![batch, cond_dim],
                got: other.to_vec(),
            })
        }
    };
    match c.dim(0)? {
        b if b == batch => Ok(Some(c)),
        1 => Ok(Some(c.broadcast_as((batch, cond_dim))?.contiguous()?)),
        b => Err(Error::ConditionMismatch(format!(
            "condition batch {b} does not match batch {batch}"
        ))),
    }
}

/// Concatenate `x` with an optional condition along the feature axis.
pub fn cat_condition(x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
    match condition {
        Some(c) => Tensor::cat(&[x, c], 1),
        None => Ok(x.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softplus_matches_naive() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-30.0f32, -1.0, 0.0, 2.0, 30.0], &dev).unwrap();
        let got: Vec<f32> = softplus(&x).unwrap().to_vec1().unwrap();
        for (g, v) in got.iter().zip([-30.0f32, -1.0, 0.0, 2.0, 30.0]) {
            let naive = if v > 20.0 { v } else { (1.0 + v.exp()).ln() };
            assert!((g - naive).abs() < 1e-5, "{g} vs {naive}");
        }
        let one = softplus(&Tensor::new(&[SOFTPLUS_INV_ONE as f32], &dev).unwrap())
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((one[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn logmatmulexp_matches_direct() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0.1f32, -0.3], [0.7, 0.2]], &dev).unwrap();
        let y = Tensor::new(&[[0.5f32, 0.0], [-1.0, 0.4]], &dev).unwrap();
        let direct = x.exp().unwrap().matmul(&y.exp().unwrap()).unwrap().log().unwrap();
        let stable = logmatmulexp(&x, &y).unwrap();
        let diff = (direct - stable).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-5);
    }

    #[test]
    fn logmatmulexp_handles_neg_inf_entries() {
        let dev = Device::Cpu;
        let ninf = f32::NEG_INFINITY;
        let x = Tensor::new(&[[0.0f32, ninf], [ninf, 1.0]], &dev).unwrap();
        let y = Tensor::new(&[[2.0f32], [3.0]], &dev).unwrap();
        let out: Vec<Vec<f32>> = logmatmulexp(&x, &y).unwrap().to_vec2().unwrap();
        assert!((out[0][0] - 2.0).abs() < 1e-5);
        assert!((out[1][0] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn nan_becomes_neg_inf() {
        let dev = Device::Cpu;
        let t = Tensor::new(&[1.0f32, f32::NAN, -2.0], &dev).unwrap();
        let out: Vec<f32> = nan_to_neg_inf(&t).unwrap().to_vec1().unwrap();
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], f32::NEG_INFINITY);
        assert_eq!(out[2], -2.0);
    }

    #[test]
    fn condition_broadcasting() {
        let dev = Device::Cpu;
        let c = Tensor::new(&[1.0f32, 2.0], &dev).unwrap();
        let out = broadcast_condition(Some(&c), Some(2), 3).unwrap().unwrap();
        assert_eq!(out.dims(), &[3, 2]);
        assert!(broadcast_condition(None, Some(2), 3).is_err());
        assert!(broadcast_condition(Some(&c), None, 3).unwrap().is_none());
        let wrong = Tensor::zeros((2, 2), DType::F32, &dev).unwrap();
        assert!(broadcast_condition(Some(&wrong), Some(2), 3).is_err());
    }
}
