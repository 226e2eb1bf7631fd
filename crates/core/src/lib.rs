//! # nflow-core — Bijections and Distributions
//!
//! Everything needed to build and evaluate a normalising flow on candle:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`masks`] | Rank-based MADE masks, block masks for BNAF |
//! | [`ops`] | `softplus`, `logmatmulexp`, condition broadcasting |
//! | [`nn`] | `Mlp`, `MaskedLinear`, `AutoregressiveMlp` |
//! | [`transformers`] | Element-wise `AffineTransformer`, `RationalQuadraticSpline` |
//! | [`bijections`] | `Bijection` trait, affine maps, permutations, coupling, MAF, BNAF, `Chain`, `Invert` |
//! | [`distributions`] | `Distribution` trait, standard families, `Transformed`, `SpecializeCondition` |
//! | [`flows`] | `coupling_flow`, `masked_autoregressive_flow`, `block_neural_autoregressive_flow` |
//!
//! ## Conventions
//!
//! 1. **Batched points.** Points are `(batch, dim)` tensors, log-densities
//!    and log-determinants are `(batch,)`. Conditions are `(cond_dim,)` or
//!    `(batch, cond_dim)`.
//! 2. **Explicit randomness.** Sampling takes `&mut dyn RngCore`; a seeded
//!    `StdRng` reproduces every draw.
//! 3. **Parameters live in a `VarMap`.** Trainable pieces take a
//!    `VarBuilder`, so the optimiser and checkpointing see one flat map.

pub mod bijections;
pub mod distributions;
pub mod error;
pub mod flows;
pub mod masks;
pub mod nn;
pub mod ops;
pub mod transformers;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use bijections::{
    Affine, Bijection, BlockAutoregressiveLinear, BlockAutoregressiveNetwork, Chain, Coupling,
    Exp, Flip, Invert, MaskedAutoregressive, Permute, Tanh, TriangularAffine,
};
pub use distributions::{
    Cauchy, Distribution, Exponential, Gumbel, Laplace, LogNormal, MultivariateNormal, Normal,
    SpecializeCondition, StandardNormal, StudentT, Transformed, Uniform,
};
pub use error::{Error, Result};
pub use flows::{
    block_neural_autoregressive_flow, build_flow, coupling_flow, make_transformer,
    masked_autoregressive_flow,
};
pub use transformers::{AffineTransformer, RationalQuadraticSpline, Transformer};
