//! Affine bijections: element-wise `y = x * scale + loc` and the lower
//! triangular `y = L x + loc`.
//!
//! Both come in two flavours: constant (built from host values, never
//! trained) and trainable (parameters registered through a `VarBuilder` and
//! initialised to the identity).

use candle_core::{Device, Tensor};
use candle_nn::{Init, VarBuilder};

use super::Bijection;
use crate::error::{check_points, Error, Result};
use crate::masks::{eye, mask_tensor, tril_mask};

fn batch_log_det(log_scale: &Tensor, batch: usize) -> candle_core::Result<Tensor> {
    log_scale.sum_all()?.broadcast_as(batch)?.contiguous()
}

// ── Affine ──────────────────────────────────────────────────────────────────

/// Element-wise affine map; the scale is stored as its logarithm so it stays
/// positive under gradient updates.
pub struct Affine {
    dim: usize,
    loc: Tensor,
    log_scale: Tensor,
}

impl Affine {
    /// Constant affine map. Every `scale` entry must be strictly positive.
    pub fn new(loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        if loc.len() != scale.len() {
            return Err(Error::InvalidParameter(format!(
                "loc has {} entries but scale has {}",
                loc.len(),
                scale.len()
            )));
        }
        if let Some(s) = scale.iter().find(|s| !(**s > 0.0)) {
            return Err(Error::InvalidParameter(format!("scale must be positive, got {s}")));
        }
        let dim = loc.len();
        let log_scale: Vec<f32> = scale.iter().map(|s| s.ln()).collect();
        Ok(Self {
            dim,
            loc: Tensor::from_slice(loc, (1, dim), device)?,
            log_scale: Tensor::from_vec(log_scale, (1, dim), device)?,
        })
    }

    /// Trainable affine map starting at the identity.
    pub fn trainable(dim: usize, vb: VarBuilder) -> Result<Self> {
        let loc = vb.get_with_hints((1, dim), "loc", Init::Const(0.0))?;
        let log_scale = vb.get_with_hints((1, dim), "log_scale", Init::Const(0.0))?;
        Ok(Self { dim, loc, log_scale })
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn scale(&self) -> Result<Tensor> {
        Ok(self.log_scale.exp()?)
    }
}

impl Bijection for Affine {
    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &'static str {
        "Affine"
    }

    fn transform_and_log_det(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("Affine input", x, self.dim)?;
        let y = x.broadcast_mul(&self.log_scale.exp()?)?.broadcast_add(&self.loc)?;
        Ok((y, batch_log_det(&self.log_scale, batch)?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("Affine input", y, self.dim)?;
        let x = y
            .broadcast_sub(&self.loc)?
            .broadcast_mul(&self.log_scale.neg()?.exp()?)?;
        Ok((x, batch_log_det(&self.log_scale, batch)?.neg()?))
    }
}

// ── TriangularAffine ────────────────────────────────────────────────────────

/// `y = L x + loc` with `L` lower triangular and a positive diagonal.
///
/// `L` is assembled from an unconstrained strictly-lower part and a
/// log-diagonal; entries above the diagonal are masked out.
pub struct TriangularAffine {
    dim: usize,
    loc: Tensor,
    lower: Tensor,
    log_diag: Tensor,
    strict_tril: Tensor,
    eye: Tensor,
}

impl TriangularAffine {
    /// Constant map from a row-major `dim x dim` lower-triangular matrix.
    pub fn new(loc: &[f32], matrix: &[f32], device: &Device) -> Result<Self> {
        let dim = loc.len();
        if matrix.len() != dim * dim {
            return Err(Error::Shape {
                context: "TriangularAffine matrix",
                expected: vec![dim, dim],
                got: vec![matrix.len()],
            });
        }
        let mut log_diag = Vec::with_capacity(dim);
        for i in 0..dim {
            let d = matrix[i * dim + i];
            if !(d > 0.0) {
                return Err(Error::InvalidParameter(format!(
                    "diagonal entry {i} must be positive, got {d}"
                )));
            }
            log_diag.push(d.ln());
            if let Some(j) = (i + 1..dim).find(|&j| matrix[i * dim + j] != 0.0) {
                return Err(Error::InvalidParameter(format!(
                    "matrix is not lower triangular: entry ({i}, {j}) is non-zero"
                )));
            }
        }
        Ok(Self {
            dim,
            loc: Tensor::from_slice(loc, (1, dim), device)?,
            lower: Tensor::from_slice(matrix, (dim, dim), device)?,
            log_diag: Tensor::from_vec(log_diag, dim, device)?,
            strict_tril: mask_tensor(tril_mask(dim, true), dim, dim, device)?,
            eye: mask_tensor(eye(dim), dim, dim, device)?,
        })
    }

    /// Constant map `L z + loc` where `L` is the Cholesky factor of a
    /// row-major covariance matrix.
    pub fn from_covariance(loc: &[f32], covariance: &[f32], device: &Device) -> Result<Self> {
        let dim = loc.len();
        let cov: Vec<f64> = covariance.iter().map(|&v| v as f64).collect();
        let chol = cholesky(&cov, dim)?;
        let chol: Vec<f32> = chol.into_iter().map(|v| v as f32).collect();
        Self::new(loc, &chol, device)
    }

    /// Trainable map starting at the identity.
    pub fn trainable(dim: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        Ok(Self {
            dim,
            loc: vb.get_with_hints((1, dim), "loc", Init::Const(0.0))?,
            lower: vb.get_with_hints((dim, dim), "lower", Init::Const(0.0))?,
            log_diag: vb.get_with_hints(dim, "log_diag", Init::Const(0.0))?,
            strict_tril: mask_tensor(tril_mask(dim, true), dim, dim, &device)?,
            eye: mask_tensor(eye(dim), dim, dim, &device)?,
        })
    }

    /// The effective lower-triangular matrix.
    pub fn matrix(&self) -> Result<Tensor> {
        let diag = self.eye.broadcast_mul(&self.log_diag.exp()?.unsqueeze(0)?)?;
        Ok(((&self.lower * &self.strict_tril)? + diag)?)
    }
}

impl Bijection for TriangularAffine {
    fn dim(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &'static str {
        "TriangularAffine"
    }

    fn transform_and_log_det(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("TriangularAffine input", x, self.dim)?;
        let l = self.matrix()?;
        let y = x.matmul(&l.t()?)?.broadcast_add(&self.loc)?;
        Ok((y, batch_log_det(&self.log_diag, batch)?))
    }

    fn inverse_and_log_det(&self, y: &Tensor, _condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = check_points("TriangularAffine input", y, self.dim)?;
        let l = self.matrix()?;
        let z = y.broadcast_sub(&self.loc)?;
        // Forward substitution, one column at a time.
        let mut cols: Vec<Tensor> = Vec::with_capacity(self.dim);
        for i in 0..self.dim {
            let mut rhs = z.narrow(1, i, 1)?;
            if i > 0 {
                let prev = Tensor::cat(&cols, 1)?.contiguous()?;
                let row = l.narrow(0, i, 1)?.narrow(1, 0, i)?.contiguous()?;
                rhs = (rhs - prev.matmul(&row.t()?)?)?;
            }
            let diag = l.narrow(0, i, 1)?.narrow(1, i, 1)?;
            cols.push(rhs.broadcast_div(&diag)?);
        }
        let x = Tensor::cat(&cols, 1)?.contiguous()?;
        Ok((x, batch_log_det(&self.log_diag, batch)?.neg()?))
    }
}

/// Row-major Cholesky factor of a symmetric positive-definite matrix.
pub fn cholesky(a: &[f64], n: usize) -> Result<Vec<f64>> {
    if a.len() != n * n {
        return Err(Error::Shape {
            context: "covariance",
            expected: vec![n, n],
            got: vec![a.len()],
        });
    }
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let s: f64 = (0..j).map(|k| l[i * n + k] * l[j * n + k]).sum();
            if i == j {
                let d = a[i * n + i] - s;
                if !(d > 0.0) {
                    return Err(Error::InvalidParameter(
                        "covariance is not positive definite".into(),
                    ));
                }
                l[i * n + j] = d.sqrt();
            } else {
                if (a[i * n + j] - a[j * n + i]).abs() > 1e-6 * (1.0 + a[i * n + j].abs()) {
                    return Err(Error::InvalidParameter("covariance is not symmetric".into()));
                }
                l[i * n + j] = (a[i * n + j] - s) / l[j * n + j];
            }
        }
    }
    Ok(l)
}
