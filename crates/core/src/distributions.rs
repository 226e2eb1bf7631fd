//! Probability distributions over `(batch, dim)` points.
//!
//! Implementors provide the unchecked hooks, which assume `x` is already
//! `(batch, dim)` and the condition (if any) is `(batch, cond_dim)`. The
//! provided `log_prob` / `sample` / `sample_and_log_prob` methods validate
//! shapes, broadcast the condition and map NaN log-densities to `-inf`.
//!
//! Every sampling call takes the random source explicitly as
//! `&mut dyn RngCore`; noise is drawn on the host and uploaded to the
//! distribution's device, so a seeded `StdRng` reproduces a run exactly.
//!
//! Apart from the standard bases, every distribution here is a
//! [`Transformed`] distribution: a parameter-free base pushed through an
//! affine (or triangular affine) bijection.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use rand::distributions::Open01;
use rand::{Rng, RngCore};
use rand_distr::{Distribution as RandDistribution, Exp1, StandardNormal as StandardNormalNoise};
use statrs::function::gamma::ln_gamma;

use crate::bijections::{Affine, Bijection, Chain, Exp, TriangularAffine};
use crate::error::{check_points, Error, Result};
use crate::ops::{broadcast_condition, nan_to_neg_inf};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

// ── Trait ───────────────────────────────────────────────────────────────────

pub trait Distribution: Send + Sync {
    fn dim(&self) -> usize;

    fn cond_dim(&self) -> Option<usize> {
        None
    }

    /// Device that samples are placed on.
    fn device(&self) -> &Device;

    /// `(batch,)` log-densities of `(batch, dim)` points.
    fn log_prob_unchecked(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor>;

    /// `n` samples as `(n, dim)`; `condition` is `(n, cond_dim)` if present.
    fn sample_unchecked(&self, rng: &mut dyn RngCore, n: usize, condition: Option<&Tensor>) -> Result<Tensor>;

    fn sample_and_log_prob_unchecked(
        &self,
        rng: &mut dyn RngCore,
        n: usize,
        condition: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let x = self.sample_unchecked(rng, n, condition)?;
        let log_prob = self.log_prob_unchecked(&x, condition)?;
        Ok((x, log_prob))
    }

    /// Log-density of `x`, either `(dim,)` or `(batch, dim)`. Returns
    /// `(batch,)` (a single-point input gives `(1,)`).
    fn log_prob(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        let x = if x.rank() == 1 { x.unsqueeze(0)? } else { x.clone() };
        let batch = check_points("log_prob input", &x, self.dim())?;
        let condition = self.checked_condition(condition, batch)?;
        let log_prob = self.log_prob_unchecked(&x, condition.as_ref())?;
        Ok(nan_to_neg_inf(&log_prob)?)
    }

    /// Draw `n` samples. A condition of shape `(cond_dim,)` or
    /// `(1, cond_dim)` is shared by all samples; `(n, cond_dim)` gives one
    /// condition per sample.
    fn sample(&self, rng: &mut dyn RngCore, n: usize, condition: Option<&Tensor>) -> Result<Tensor> {
        let condition = self.checked_condition(condition, n)?;
        self.sample_unchecked(rng, n, condition.as_ref())
    }

    /// Samples together with their log-densities, without inverting any
    /// bijection.
    fn sample_and_log_prob(
        &self,
        rng: &mut dyn RngCore,
        n: usize,
        condition: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let condition = self.checked_condition(condition, n)?;
        let (x, log_prob) = self.sample_and_log_prob_unchecked(rng, n, condition.as_ref())?;
        Ok((x, nan_to_neg_inf(&log_prob)?))
    }

    #[doc(hidden)]
    fn checked_condition(&self, condition: Option<&Tensor>, batch: usize) -> Result<Option<Tensor>> {
        if self.cond_dim().is_none() && condition.is_some() {
            return Err(Error::ConditionMismatch(
                "a condition was given to an unconditional distribution".into(),
            ));
        }
        broadcast_condition(condition, self.cond_dim(), batch)
    }
}

// ── Standard bases ──────────────────────────────────────────────────────────

enum StandardKind {
    Normal,
    Uniform,
    Gumbel,
    Cauchy,
    StudentT {
        noise: Vec<rand_distr::StudentT<f32>>,
        log_norm: Tensor,
        inv_df: Tensor,
        half_df_p1: Tensor,
    },
    Laplace,
    Exponential,
}

/// Independent, parameter-free one-dimensional bases.
struct StandardBase {
    dim: usize,
    kind: StandardKind,
    device: Device,
}

impl StandardBase {
    fn new(dim: usize, kind: StandardKind, device: &Device) -> Self {
        Self {
            dim,
            kind,
            device: device.clone(),
        }
    }

    fn student_t(df: &[f32], device: &Device) -> Result<Self> {
        if let Some(d) = df.iter().find(|d| !(**d > 0.0)) {
            return Err(Error::InvalidParameter(format!(
                "degrees of freedom must be positive, got {d}"
            )));
        }
        let dim = df.len();
        let noise = df
            .iter()
            .map(|&d| {
                rand_distr::StudentT::new(d).map_err(|e| Error::InvalidParameter(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let log_norm: Vec<f32> = df
            .iter()
            .map(|&d| {
                let d = d as f64;
                (ln_gamma((d + 1.0) / 2.0) - ln_gamma(d / 2.0) - 0.5 * (d * std::f64::consts::PI).ln()) as f32
            })
            .collect();
        let inv_df: Vec<f32> = df.iter().map(|d| 1.0 / d).collect();
        let half_df_p1: Vec<f32> = df.iter().map(|d| (d + 1.0) / 2.0).collect();
        let kind = StandardKind::StudentT {
            noise,
            log_norm: Tensor::from_vec(log_norm, (1, dim), device)?,
            inv_df: Tensor::from_vec(inv_df, (1, dim), device)?,
            half_df_p1: Tensor::from_vec(half_df_p1, (1, dim), device)?,
        };
        Ok(Self::new(dim, kind, device))
    }

    /// Element-wise log-density, `(batch, dim)`.
    fn log_density(&self, x: &Tensor) -> Result<Tensor> {
        let out = match &self.kind {
            StandardKind::Normal => x.sqr()?.affine(-0.5, -0.5 * LN_2PI)?,
            StandardKind::Uniform => {
                let inside = (x.ge(0f32)? * x.le(1f32)?)?;
                let neg_inf = Tensor::full(f32::NEG_INFINITY, x.dims(), x.device())?;
                inside.where_cond(&x.zeros_like()?, &neg_inf)?
            }
            StandardKind::Gumbel => (x + x.neg()?.exp()?)?.neg()?,
            StandardKind::Cauchy => x
                .sqr()?
                .affine(1.0, 1.0)?
                .log()?
                .affine(-1.0, -std::f64::consts::PI.ln())?,
            StandardKind::StudentT {
                log_norm,
                inv_df,
                half_df_p1,
                ..
            } => {
                let tail = x
                    .sqr()?
                    .broadcast_mul(inv_df)?
                    .affine(1.0, 1.0)?
                    .log()?
                    .broadcast_mul(half_df_p1)?;
                log_norm.broadcast_sub(&tail)?
            }
            StandardKind::Laplace => x.abs()?.affine(-1.0, -std::f64::consts::LN_2)?,
            StandardKind::Exponential => {
                let neg_inf = Tensor::full(f32::NEG_INFINITY, x.dims(), x.device())?;
                x.ge(0f32)?.where_cond(&x.neg()?, &neg_inf)?
            }
        };
        Ok(out)
    }

    fn draw(&self, rng: &mut dyn RngCore, column: usize) -> f32 {
        match &self.kind {
            StandardKind::Normal => StandardNormalNoise.sample(rng),
            StandardKind::Uniform => rng.gen::<f32>(),
            StandardKind::Gumbel => {
                let u: f32 = rng.sample(Open01);
                -(-u.ln()).ln()
            }
            StandardKind::Cauchy => {
                let u: f32 = rng.sample(Open01);
                (std::f32::consts::PI * (u - 0.5)).tan()
            }
            StandardKind::StudentT { noise, .. } => noise[column].sample(rng),
            StandardKind::Laplace => {
                let u: f32 = rng.sample::<f32, _>(Open01) - 0.5;
                -u.signum() * (1.0 - 2.0 * u.abs()).ln()
            }
            StandardKind::Exponential => Exp1.sample(rng),
        }
    }
}

impl Distribution for StandardBase {
    fn dim(&self) -> usize {
        self.dim
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn log_prob_unchecked(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<Tensor> {
        Ok(self.log_density(x)?.sum(1)?)
    }

    fn sample_unchecked(&self, rng: &mut dyn RngCore, n: usize, _condition: Option<&Tensor>) -> Result<Tensor> {
        let mut data = Vec::with_capacity(n * self.dim);
        for _ in 0..n {
            for col in 0..self.dim {
                data.push(self.draw(rng, col));
            }
        }
        Ok(Tensor::from_vec(data, (n, self.dim), &self.device)?)
    }
}

/// Standard normal with independent dimensions and no parameters.
pub struct StandardNormal(StandardBase);

impl StandardNormal {
    pub fn new(dim: usize, device: &Device) -> Self {
        Self(StandardBase::new(dim, StandardKind::Normal, device))
    }
}

impl Distribution for StandardNormal {
    fn dim(&self) -> usize {
        self.0.dim()
    }

    fn device(&self) -> &Device {
        self.0.device()
    }

    fn log_prob_unchecked(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        self.0.log_prob_unchecked(x, condition)
    }

    fn sample_unchecked(&self, rng: &mut dyn RngCore, n: usize, condition: Option<&Tensor>) -> Result<Tensor> {
        self.0.sample_unchecked(rng, n, condition)
    }
}

// ── Transformed ─────────────────────────────────────────────────────────────

/// Base distribution pushed through a chain of bijections.
///
/// `log_prob` runs the chain's inverse; sampling runs it forward.
pub struct Transformed {
    base: Box<dyn Distribution>,
    bijection: Chain,
}

impl Transformed {
    pub fn new<D, B>(base: D, bijection: B) -> Result<Self>
    where
        D: Distribution + 'static,
        B: Bijection + 'static,
    {
        let mut chain = Chain::default();
        chain.push(bijection)?;
        Self::from_chain(Box::new(base), chain)
    }

    /// Use the layers of `chain` directly, without nesting.
    pub fn from_chain(base: Box<dyn Distribution>, chain: Chain) -> Result<Self> {
        if !chain.is_empty() && chain.dim() != base.dim() {
            return Err(Error::InvalidConfig(format!(
                "bijection has dim {} but the base distribution has dim {}",
                chain.dim(),
                base.dim()
            )));
        }
        if let (Some(a), Some(b)) = (base.cond_dim(), chain.cond_dim()) {
            if a != b {
                return Err(Error::ConditionMismatch(format!(
                    "base distribution has cond_dim {a} but the bijection has cond_dim {b}"
                )));
            }
        }
        Ok(Self {
            base,
            bijection: chain,
        })
    }

    /// Append a bijection after the existing ones.
    pub fn stack<B: Bijection + 'static>(mut self, bijection: B) -> Result<Self> {
        if bijection.dim() != self.base.dim() {
            return Err(Error::InvalidConfig(format!(
                "{} has dim {} but the base distribution has dim {}",
                bijection.name(),
                bijection.dim(),
                self.base.dim()
            )));
        }
        if let (Some(a), Some(b)) = (self.base.cond_dim(), bijection.cond_dim()) {
            if a != b {
                return Err(Error::ConditionMismatch(format!(
                    "base distribution has cond_dim {a} but the bijection has cond_dim {b}"
                )));
            }
        }
        self.bijection.push(bijection)?;
        Ok(self)
    }

    pub fn base(&self) -> &dyn Distribution {
        self.base.as_ref()
    }

    pub fn bijection(&self) -> &Chain {
        &self.bijection
    }
}

impl Distribution for Transformed {
    fn dim(&self) -> usize {
        self.base.dim()
    }

    fn cond_dim(&self) -> Option<usize> {
        self.bijection.cond_dim().or_else(|| self.base.cond_dim())
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn log_prob_unchecked(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
        let (z, log_det) = self.bijection.inverse_and_log_det(x, condition)?;
        let base_condition = condition.filter(|_| self.base.cond_dim().is_some());
        let base_log_prob = self.base.log_prob_unchecked(&z, base_condition)?;
        Ok((base_log_prob + log_det)?)
    }

    fn sample_unchecked(&self, rng: &mut dyn RngCore, n: usize, condition: Option<&Tensor>) -> Result<Tensor> {
        let base_condition = condition.filter(|_| self.base.cond_dim().is_some());
        let z = self.base.sample_unchecked(rng, n, base_condition)?;
        self.bijection.transform(&z, condition)
    }

    fn sample_and_log_prob_unchecked(
        &self,
        rng: &mut dyn RngCore,
        n: usize,
        condition: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let base_condition = condition.filter(|_| self.base.cond_dim().is_some());
        let (z, base_log_prob) = self.base.sample_and_log_prob_unchecked(rng, n, base_condition)?;
        let (x, log_det) = self.bijection.transform_and_log_det(&z, condition)?;
        Ok((x, (base_log_prob - log_det)?))
    }
}

// ── Affine-transformed families ─────────────────────────────────────────────

macro_rules! transformed_distribution {
    ($name:ident) => {
        impl $name {
            pub fn into_transformed(self) -> Transformed {
                self.0
            }

            pub fn as_transformed(&self) -> &Transformed {
                &self.0
            }
        }

        impl Distribution for $name {
            fn dim(&self) -> usize {
                self.0.dim()
            }

            fn cond_dim(&self) -> Option<usize> {
                self.0.cond_dim()
            }

            fn device(&self) -> &Device {
                self.0.device()
            }

            fn log_prob_unchecked(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<Tensor> {
                self.0.log_prob_unchecked(x, condition)
            }

            fn sample_unchecked(
                &self,
                rng: &mut dyn RngCore,
                n: usize,
                condition: Option<&Tensor>,
            ) -> Result<Tensor> {
                self.0.sample_unchecked(rng, n, condition)
            }

            fn sample_and_log_prob_unchecked(
                &self,
                rng: &mut dyn RngCore,
                n: usize,
                condition: Option<&Tensor>,
            ) -> Result<(Tensor, Tensor)> {
                self.0.sample_and_log_prob_unchecked(rng, n, condition)
            }
        }
    };
}

fn affine_family(kind: StandardKind, loc: &[f32], scale: &[f32], device: &Device) -> Result<Transformed> {
    let affine = Affine::new(loc, scale, device)?;
    Transformed::new(StandardBase::new(loc.len(), kind, device), affine)
}

/// Independent normal with per-dimension mean and standard deviation.
pub struct Normal(Transformed);
transformed_distribution!(Normal);

impl Normal {
    pub fn new(loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        Ok(Self(affine_family(StandardKind::Normal, loc, scale, device)?))
    }

    /// Trainable normal starting at the standard normal.
    pub fn trainable(dim: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let affine = Affine::trainable(dim, vb)?;
        Ok(Self(Transformed::new(StandardNormal::new(dim, &device), affine)?))
    }
}

/// `exp` of an independent normal with the given `loc` and `scale`.
pub struct LogNormal(Transformed);
transformed_distribution!(LogNormal);

impl LogNormal {
    pub fn new(loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        let dim = loc.len();
        let mut chain = Chain::default();
        chain.push(Affine::new(loc, scale, device)?)?;
        chain.push(Exp::new(dim))?;
        Ok(Self(Transformed::from_chain(
            Box::new(StandardNormal::new(dim, device)),
            chain,
        )?))
    }
}

/// Uniform on `[minval, maxval)` per dimension.
pub struct Uniform(Transformed);
transformed_distribution!(Uniform);

impl Uniform {
    pub fn new(minval: &[f32], maxval: &[f32], device: &Device) -> Result<Self> {
        if minval.len() != maxval.len() {
            return Err(Error::InvalidParameter(format!(
                "minval has {} entries but maxval has {}",
                minval.len(),
                maxval.len()
            )));
        }
        if let Some((lo, hi)) = minval.iter().zip(maxval).find(|(lo, hi)| !(hi > lo)) {
            return Err(Error::InvalidParameter(format!(
                "minval must be less than maxval, got {lo} and {hi}"
            )));
        }
        let width: Vec<f32> = minval.iter().zip(maxval).map(|(lo, hi)| hi - lo).collect();
        Ok(Self(affine_family(StandardKind::Uniform, minval, &width, device)?))
    }
}

pub struct Gumbel(Transformed);
transformed_distribution!(Gumbel);

impl Gumbel {
    pub fn new(loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        Ok(Self(affine_family(StandardKind::Gumbel, loc, scale, device)?))
    }
}

pub struct Cauchy(Transformed);
transformed_distribution!(Cauchy);

impl Cauchy {
    pub fn new(loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        Ok(Self(affine_family(StandardKind::Cauchy, loc, scale, device)?))
    }
}

/// Student's t with per-dimension degrees of freedom.
pub struct StudentT(Transformed);
transformed_distribution!(StudentT);

impl StudentT {
    pub fn new(df: &[f32], loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        let base = StandardBase::student_t(df, device)?;
        let affine = Affine::new(loc, scale, device)?;
        Ok(Self(Transformed::new(base, affine)?))
    }
}

pub struct Laplace(Transformed);
transformed_distribution!(Laplace);

impl Laplace {
    pub fn new(loc: &[f32], scale: &[f32], device: &Device) -> Result<Self> {
        Ok(Self(affine_family(StandardKind::Laplace, loc, scale, device)?))
    }
}

/// Exponential with per-dimension `rate` (inverse scale).
pub struct Exponential(Transformed);
transformed_distribution!(Exponential);

impl Exponential {
    pub fn new(rate: &[f32], device: &Device) -> Result<Self> {
        if let Some(r) = rate.iter().find(|r| !(**r > 0.0)) {
            return Err(Error::InvalidParameter(format!("rate must be positive, got {r}")));
        }
        let zeros = vec![0.0; rate.len()];
        let scale: Vec<f32> = rate.iter().map(|r| 1.0 / r).collect();
        Ok(Self(affine_family(StandardKind::Exponential, &zeros, &scale, device)?))
    }
}

/// Multivariate normal `N(loc, covariance)`, parameterised by the Cholesky
/// factor of the covariance.
pub struct MultivariateNormal(Transformed);
transformed_distribution!(MultivariateNormal);

impl MultivariateNormal {
    /// `covariance` is row-major `dim x dim`, symmetric positive definite.
    pub fn new(loc: &[f32], covariance: &[f32], device: &Device) -> Result<Self> {
        let bijection = TriangularAffine::from_covariance(loc, covariance, device)?;
        Ok(Self(Transformed::new(StandardNormal::new(loc.len(), device), bijection)?))
    }

    /// Trainable full-covariance normal starting at the standard normal.
    pub fn trainable(dim: usize, vb: VarBuilder) -> Result<Self> {
        let device = vb.device().clone();
        let bijection = TriangularAffine::trainable(dim, vb)?;
        Ok(Self(Transformed::new(StandardNormal::new(dim, &device), bijection)?))
    }
}

// ── SpecializeCondition ─────────────────────────────────────────────────────

/// Fixes the condition of a conditional distribution, giving an
/// unconditional one. The stored condition is detached from the graph.
pub struct SpecializeCondition {
    dist: Box<dyn Distribution>,
    condition: Tensor,
}

impl SpecializeCondition {
    pub fn new<D: Distribution + 'static>(dist: D, condition: &Tensor) -> Result<Self> {
        let cond_dim = match dist.cond_dim() {
            Some(d) => d,
            None => {
                return Err(Error::ConditionMismatch(
                    "cannot specialise an unconditional distribution".into(),
                ))
            }
        };
        if condition.dims() != &[cond_dim] {
            return Err(Error::Shape {
                context: "specialised condition",
                expected: vec![cond_dim],
                got: condition.dims().to_vec(),
            });
        }
        Ok(Self {
            dist: Box::new(dist),
            condition: condition.to_dtype(DType::F32)?.detach(),
        })
    }

    pub fn condition(&self) -> &Tensor {
        &self.condition
    }

    fn condition_for(&self, batch: usize) -> Result<Option<Tensor>> {
        broadcast_condition(Some(&self.condition), self.dist.cond_dim(), batch)
    }
}

impl Distribution for SpecializeCondition {
    fn dim(&self) -> usize {
        self.dist.dim()
    }

    fn device(&self) -> &Device {
        self.dist.device()
    }

    fn log_prob_unchecked(&self, x: &Tensor, _condition: Option<&Tensor>) -> Result<Tensor> {
        let condition = self.condition_for(x.dim(0)?)?;
        self.dist.log_prob_unchecked(x, condition.as_ref())
    }

    fn sample_unchecked(&self, rng: &mut dyn RngCore, n: usize, _condition: Option<&Tensor>) -> Result<Tensor> {
        let condition = self.condition_for(n)?;
        self.dist.sample_unchecked(rng, n, condition.as_ref())
    }

    fn sample_and_log_prob_unchecked(
        &self,
        rng: &mut dyn RngCore,
        n: usize,
        _condition: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let condition = self.condition_for(n)?;
        self.dist.sample_and_log_prob_unchecked(rng, n, condition.as_ref())
    }
}
