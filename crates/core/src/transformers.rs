//! Element-wise monotone transformers.
//!
//! A transformer maps `(batch, d)` inputs using per-element parameters of
//! shape `(batch, d, num_params)` produced by a conditioner, and returns the
//! element-wise log-derivative `(batch, d)`. Summing over the last axis gives
//! the log-determinant of the (diagonal) Jacobian.
//!
//! Both transformers are the identity when every parameter is zero, which is
//! what a zero-initialised conditioner emits.

use candle_core::{DType, Result, Tensor, D};

use crate::ops::{softplus, SOFTPLUS_INV_ONE};

pub trait Transformer: Send + Sync {
    /// Parameters consumed per element.
    fn num_params(&self) -> usize;

    fn transform_and_log_det(&self, x: &Tensor, params: &Tensor) -> Result<(Tensor, Tensor)>;

    fn inverse_and_log_det(&self, y: &Tensor, params: &Tensor) -> Result<(Tensor, Tensor)>;
}

#[inline]
fn param(params: &Tensor, i: usize) -> Result<Tensor> {
    params.narrow(D::Minus1, i, 1)?.squeeze(D::Minus1)
}

// ── Affine ──────────────────────────────────────────────────────────────────

/// `y = x * exp(log_scale) + loc`; params `[loc, log_scale]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffineTransformer;

impl Transformer for AffineTransformer {
    fn num_params(&self) -> usize {
        2
    }

    fn transform_and_log_det(&self, x: &Tensor, params: &Tensor) -> Result<(Tensor, Tensor)> {
        let loc = param(params, 0)?;
        let log_scale = param(params, 1)?;
        let y = ((x * log_scale.exp()?)? + loc)?;
        Ok((y, log_scale))
    }

    fn inverse_and_log_det(&self, y: &Tensor, params: &Tensor) -> Result<(Tensor, Tensor)> {
        let loc = param(params, 0)?;
        let log_scale = param(params, 1)?;
        let x = ((y - loc)? * log_scale.neg()?.exp()?)?;
        Ok((x, log_scale.neg()?))
    }
}

// ── Rational quadratic spline ───────────────────────────────────────────────

const MIN_BIN_WIDTH: f64 = 1e-3;
const MIN_BIN_HEIGHT: f64 = 1e-3;
const MIN_DERIVATIVE: f64 = 1e-3;

/// Monotone rational-quadratic spline on `[-interval, interval]` with
/// `knots` bins, identity (unit slope) outside the interval.
///
/// Params per element: `knots` unnormalised widths, `knots` unnormalised
/// heights and `knots - 1` interior derivatives (`3 * knots - 1` total).
#[derive(Debug, Clone, Copy)]
pub struct RationalQuadraticSpline {
    knots: usize,
    interval: f64,
}

/// Knot tables for one parameter tensor, all `(batch, d, knots + 1)`.
struct Knots {
    xs: Tensor,
    ys: Tensor,
    derivs: Tensor,
}

/// Values at the lower and upper edge of the selected bin, `(batch, d, 1)`.
struct Bin {
    x_lo: Tensor,
    x_hi: Tensor,
    y_lo: Tensor,
    y_hi: Tensor,
    d_lo: Tensor,
    d_hi: Tensor,
}

impl RationalQuadraticSpline {
    pub fn new(knots: usize, interval: f64) -> Self {
        Self { knots, interval }
    }

    pub fn knots(&self) -> usize {
        self.knots
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Softmax-normalised positions with a floor on the bin size, mapped to
    /// `[-B, B]` with a leading zero knot.
    fn knot_positions(&self, raw: &Tensor, min_size: f64) -> Result<Tensor> {
        let k = self.knots as f64;
        let sizes = candle_nn::ops::softmax(raw, D::Minus1)?.affine(1.0 - min_size * k, min_size)?;
        let cum = sizes.cumsum(D::Minus1)?;
        let zero = cum.narrow(D::Minus1, 0, 1)?.zeros_like()?;
        Tensor::cat(&[&zero, &cum], D::Minus1)?.affine(2.0 * self.interval, -self.interval)
    }

    fn knot_tables(&self, params: &Tensor) -> Result<Knots> {
        let k = self.knots;
        let xs = self.knot_positions(&params.narrow(D::Minus1, 0, k)?, MIN_BIN_WIDTH)?;
        let ys = self.knot_positions(&params.narrow(D::Minus1, k, k)?, MIN_BIN_HEIGHT)?;
        // Interior slopes in (MIN_DERIVATIVE, inf), exactly 1 at zero input.
        let inner = softplus(&params.narrow(D::Minus1, 2 * k, k - 1)?.affine(1.0, SOFTPLUS_INV_ONE)?)?
            .affine(1.0 - MIN_DERIVATIVE, MIN_DERIVATIVE)?;
        let one = xs.narrow(D::Minus1, 0, 1)?.ones_like()?;
        let derivs = Tensor::cat(&[&one, &inner, &one], D::Minus1)?;
        Ok(Knots { xs, ys, derivs })
    }

    /// Select the bin of every element of `v` (already clamped into the
    /// interval) against the knot positions `edges`.
    fn select_bin(&self, v: &Tensor, knots: &Knots, edges: &Tensor) -> Result<Bin> {
        let k = self.knots;
        let interior = edges.narrow(D::Minus1, 1, k - 1)?;
        let idx = v
            .unsqueeze(D::Minus1)?
            .broadcast_ge(&interior)?
            .to_dtype(DType::U32)?
            .sum_keepdim(D::Minus1)?;
        let lo = |t: &Tensor| t.narrow(D::Minus1, 0, k)?.contiguous()?.gather(&idx, D::Minus1);
        let hi = |t: &Tensor| t.narrow(D::Minus1, 1, k)?.contiguous()?.gather(&idx, D::Minus1);
        Ok(Bin {
            x_lo: lo(&knots.xs)?,
            x_hi: hi(&knots.xs)?,
            y_lo: lo(&knots.ys)?,
            y_hi: hi(&knots.ys)?,
            d_lo: lo(&knots.derivs)?,
            d_hi: hi(&knots.derivs)?,
        })
    }

    /// `log dy/dx` at relative position `xi` inside `bin`.
    fn log_derivative(bin: &Bin, xi: &Tensor) -> Result<Tensor> {
        let w = (&bin.x_hi - &bin.x_lo)?;
        let h = (&bin.y_hi - &bin.y_lo)?;
        let s = (&h / &w)?;
        let xi_1m = xi.affine(-1.0, 1.0)?;
        let cross = (xi * &xi_1m)?;
        let slope_sum = ((&bin.d_hi + &bin.d_lo)? - s.affine(2.0, 0.0)?)?;
        let den = (&s + (&slope_sum * &cross)?)?;
        let num = (s.sqr()?
            * ((&bin.d_hi * xi.sqr()?)? + (&cross * s.affine(2.0, 0.0)?)? + (&bin.d_lo * xi_1m.sqr()?)?)?)?;
        num.log()? - den.sqr()?.log()?
    }

    fn bound(&self) -> f32 {
        self.interval as f32
    }
}

impl Transformer for RationalQuadraticSpline {
    fn num_params(&self) -> usize {
        3 * self.knots - 1
    }

    fn transform_and_log_det(&self, x: &Tensor, params: &Tensor) -> Result<(Tensor, Tensor)> {
        let b = self.bound();
        let inside = x.abs()?.le(b)?;
        let xc = x.clamp(-b, b)?;
        let knots = self.knot_tables(params)?;
        let bin = self.select_bin(&xc, &knots, &knots.xs)?;

        let xc3 = xc.unsqueeze(D::Minus1)?;
        let w = (&bin.x_hi - &bin.x_lo)?;
        let h = (&bin.y_hi - &bin.y_lo)?;
        let s = (&h / &w)?;
        let xi = ((&xc3 - &bin.x_lo)? / &w)?;
        let cross = (&xi * xi.affine(-1.0, 1.0)?)?;
        let num = (&h * ((&s * xi.sqr()?)? + (&bin.d_lo * &cross)?)?)?;
        let slope_sum = ((&bin.d_hi + &bin.d_lo)? - s.affine(2.0, 0.0)?)?;
        let den = (&s + (&slope_sum * &cross)?)?;
        let y = (&bin.y_lo + (num / den)?)?.squeeze(D::Minus1)?;
        let log_det = Self::log_derivative(&bin, &xi)?.squeeze(D::Minus1)?;

        let y = inside.where_cond(&y, x)?;
        let log_det = inside.where_cond(&log_det, &log_det.zeros_like()?)?;
        Ok((y, log_det))
    }

    fn inverse_and_log_det(&self, y: &Tensor, params: &Tensor) -> Result<(Tensor, Tensor)> {
        let b = self.bound();
        let inside = y.abs()?.le(b)?;
        let yc = y.clamp(-b, b)?;
        let knots = self.knot_tables(params)?;
        let bin = self.select_bin(&yc, &knots, &knots.ys)?;

        let yc3 = yc.unsqueeze(D::Minus1)?;
        let w = (&bin.x_hi - &bin.x_lo)?;
        let h = (&bin.y_hi - &bin.y_lo)?;
        let s = (&h / &w)?;
        let dy = (&yc3 - &bin.y_lo)?;
        let slope_sum = ((&bin.d_hi + &bin.d_lo)? - s.affine(2.0, 0.0)?)?;
        let a = ((&h * (&s - &bin.d_lo)?)? + (&dy * &slope_sum)?)?;
        let bq = ((&h * &bin.d_lo)? - (&dy * &slope_sum)?)?;
        let c = (s.neg()? * &dy)?;
        let disc = (bq.sqr()? - (a * &c)?.affine(4.0, 0.0)?)?.relu()?;
        let xi = (c.affine(2.0, 0.0)? / (bq.neg()? - disc.sqrt()?)?)?;
        let x = ((&xi * &w)? + &bin.x_lo)?.squeeze(D::Minus1)?;
        let log_det = Self::log_derivative(&bin, &xi)?.neg()?.squeeze(D::Minus1)?;

        let x = inside.where_cond(&x, y)?;
        let log_det = inside.where_cond(&log_det, &log_det.zeros_like()?)?;
        Ok((x, log_det))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn points(dev: &Device) -> Tensor {
        Tensor::new(&[[-2.5f32, -0.7, 0.0], [0.3, 1.1, 2.9]], dev).unwrap()
    }

    #[test]
    fn affine_zero_params_is_identity() {
        let dev = Device::Cpu;
        let x = points(&dev);
        let params = Tensor::zeros((2, 3, 2), DType::F32, &dev).unwrap();
        let (y, ld) = AffineTransformer.transform_and_log_det(&x, &params).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-7);
        assert_eq!(ld.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn affine_round_trip() {
        let dev = Device::Cpu;
        let x = points(&dev);
        let params = Tensor::randn(0f32, 1.0, (2, 3, 2), &dev).unwrap();
        let (y, ld_f) = AffineTransformer.transform_and_log_det(&x, &params).unwrap();
        let (back, ld_i) = AffineTransformer.inverse_and_log_det(&y, &params).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-5);
        assert!(max_abs_diff(&ld_f, &ld_i.neg().unwrap()) < 1e-6);
    }

    #[test]
    fn spline_zero_params_is_identity() {
        let dev = Device::Cpu;
        let spline = RationalQuadraticSpline::new(5, 3.0);
        let x = points(&dev);
        let params = Tensor::zeros((2, 3, spline.num_params()), DType::F32, &dev).unwrap();
        let (y, ld) = spline.transform_and_log_det(&x, &params).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-5);
        assert!(ld.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() < 1e-4);
    }

    #[test]
    fn spline_identity_outside_interval() {
        let dev = Device::Cpu;
        let spline = RationalQuadraticSpline::new(4, 1.0);
        let x = Tensor::new(&[[-5.0f32, 1.5], [3.0, -1.01]], &dev).unwrap();
        let params = Tensor::randn(0f32, 1.0, (2, 2, spline.num_params()), &dev).unwrap();
        let (y, ld) = spline.transform_and_log_det(&x, &params).unwrap();
        assert!(max_abs_diff(&x, &y) < 1e-7);
        assert_eq!(ld.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
        let (back, _) = spline.inverse_and_log_det(&y, &params).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-7);
    }

    #[test]
    fn spline_round_trip_and_log_det() {
        let dev = Device::Cpu;
        let spline = RationalQuadraticSpline::new(6, 3.0);
        let x = points(&dev);
        let params = Tensor::randn(0f32, 1.0, (2, 3, spline.num_params()), &dev).unwrap();
        let (y, ld_f) = spline.transform_and_log_det(&x, &params).unwrap();
        let (back, ld_i) = spline.inverse_and_log_det(&y, &params).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-4);
        assert!(max_abs_diff(&ld_f, &ld_i.neg().unwrap()) < 1e-4);

        // Central finite difference of the element-wise map.
        let eps = 1e-3f64;
        let (y_hi, _) = spline.transform_and_log_det(&x.affine(1.0, eps).unwrap(), &params).unwrap();
        let (y_lo, _) = spline.transform_and_log_det(&x.affine(1.0, -eps).unwrap(), &params).unwrap();
        let fd = ((y_hi - y_lo).unwrap().affine(1.0 / (2.0 * eps), 0.0).unwrap())
            .log()
            .unwrap();
        assert!(max_abs_diff(&fd, &ld_f) < 1e-2);
    }

    #[test]
    fn spline_is_monotone() {
        let dev = Device::Cpu;
        let spline = RationalQuadraticSpline::new(8, 2.0);
        let grid: Vec<f32> = (0..50).map(|i| -2.5 + 0.1 * i as f32).collect();
        let x = Tensor::from_vec(grid, (50, 1), &dev).unwrap();
        let p = Tensor::randn(0f32, 2.0, (1, 1, spline.num_params()), &dev).unwrap();
        let params = p.broadcast_as((50, 1, spline.num_params())).unwrap().contiguous().unwrap();
        let (y, _) = spline.transform_and_log_det(&x, &params).unwrap();
        let ys: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(ys.windows(2).all(|w| w[1] > w[0]));
    }
}
