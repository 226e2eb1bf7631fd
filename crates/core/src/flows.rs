//! Flow builders.
//!
//! Each builder stacks `flow_layers` layers of one architecture, with a
//! permutation after every layer (when `dim > 1`) so that each dimension
//! gets transformed conditioned on the others. With `invert = true` the
//! whole chain is wrapped in [`Invert`], which makes density evaluation run
//! the layers' forward direction: one pass for masked autoregressive and
//! BNAF layers, at the price of slower (or impossible) sampling.
//!
//! Layer `i` registers its variables under the `layer_{i}` prefix, so a flow
//! rebuilt from the same [`FlowConfig`] lines up with a saved `VarMap`.

use candle_core::Device;
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use nflow_common::{FlowArchitecture, FlowConfig, PermutationKind, TransformerKind};

use crate::bijections::{
    Bijection, BlockAutoregressiveNetwork, Chain, Coupling, Flip, Invert, MaskedAutoregressive,
    Permute,
};
use crate::distributions::{Distribution, Transformed};
use crate::error::{Error, Result};
use crate::transformers::{AffineTransformer, RationalQuadraticSpline, Transformer};

/// Build the transformer described by `kind`.
pub fn make_transformer(kind: &TransformerKind) -> Box<dyn Transformer> {
    match *kind {
        TransformerKind::Affine => Box::new(AffineTransformer),
        TransformerKind::RationalQuadraticSpline { knots, interval } => {
            Box::new(RationalQuadraticSpline::new(knots, interval))
        }
    }
}

fn permutation(
    kind: PermutationKind,
    dim: usize,
    rng: &mut dyn RngCore,
    device: &Device,
) -> Result<Box<dyn Bijection>> {
    Ok(match kind {
        PermutationKind::Random => Box::new(Permute::random(dim, rng, device)?),
        PermutationKind::Reverse => Box::new(Flip::new(dim, device)?),
    })
}

/// Interleave layers with permutations, optionally invert, and attach the
/// base distribution.
fn assemble<'a, F>(
    base: Box<dyn Distribution>,
    config: &FlowConfig,
    rng: &mut dyn RngCore,
    vb: &VarBuilder<'a>,
    mut make_layer: F,
) -> Result<Transformed>
where
    F: FnMut(VarBuilder<'a>) -> Result<Box<dyn Bijection>>,
{
    if base.dim() != config.dim {
        return Err(Error::InvalidConfig(format!(
            "base distribution has dim {} but the flow has dim {}",
            base.dim(),
            config.dim
        )));
    }
    let device = vb.device().clone();
    let mut chain = Chain::default();
    for i in 0..config.flow_layers {
        chain.push_boxed(make_layer(vb.pp(format!("layer_{i}")))?)?;
        if config.dim > 1 {
            chain.push_boxed(permutation(config.permutation, config.dim, rng, &device)?)?;
        }
    }
    tracing::debug!(
        architecture = ?config.architecture,
        layers = chain.len(),
        invert = config.invert,
        "assembled flow"
    );
    if config.invert {
        let mut inverted = Chain::default();
        inverted.push(Invert::new(chain))?;
        Transformed::from_chain(base, inverted)
    } else {
        Transformed::from_chain(base, chain)
    }
}

/// Coupling flow: each layer transforms the second half of the dimensions
/// conditioned on the first half (and the condition).
pub fn coupling_flow(
    base: Box<dyn Distribution>,
    config: &FlowConfig,
    rng: &mut dyn RngCore,
    vb: VarBuilder,
) -> Result<Transformed> {
    if config.dim < 2 {
        return Err(Error::InvalidConfig(format!(
            "coupling flows need dim >= 2, got {}",
            config.dim
        )));
    }
    assemble(base, config, rng, &vb, |layer_vb| {
        Ok(Box::new(Coupling::new(
            config.dim,
            config.cond_dim,
            config.dim / 2,
            make_transformer(&config.transformer),
            config.nn_width,
            config.nn_depth,
            config.nn_activation,
            layer_vb,
        )?))
    })
}

/// Masked autoregressive flow built from MADE conditioners.
pub fn masked_autoregressive_flow(
    base: Box<dyn Distribution>,
    config: &FlowConfig,
    rng: &mut dyn RngCore,
    vb: VarBuilder,
) -> Result<Transformed> {
    assemble(base, config, rng, &vb, |layer_vb| {
        Ok(Box::new(MaskedAutoregressive::new(
            config.dim,
            config.cond_dim,
            make_transformer(&config.transformer),
            config.nn_width,
            config.nn_depth,
            config.nn_activation,
            layer_vb,
        )?))
    })
}

/// Block neural autoregressive flow. Unconditional, and without an inverse:
/// with `invert = true` it can evaluate densities but not sample.
pub fn block_neural_autoregressive_flow(
    base: Box<dyn Distribution>,
    config: &FlowConfig,
    rng: &mut dyn RngCore,
    vb: VarBuilder,
) -> Result<Transformed> {
    if config.cond_dim.is_some() {
        return Err(Error::InvalidConfig(
            "block neural autoregressive flows are unconditional".into(),
        ));
    }
    assemble(base, config, rng, &vb, |layer_vb| {
        Ok(Box::new(BlockAutoregressiveNetwork::new(
            config.dim,
            config.nn_depth,
            config.nn_block_dim,
            layer_vb,
        )?))
    })
}

/// Validate `config` and build the flow it describes. Permutations are drawn
/// from `StdRng::seed_from_u64(config.seed)`, so the same config always
/// yields the same structure.
pub fn build_flow(config: &FlowConfig, base: Box<dyn Distribution>, vb: VarBuilder) -> Result<Transformed> {
    config
        .validate()
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    match config.architecture {
        FlowArchitecture::Coupling => coupling_flow(base, config, &mut rng, vb),
        FlowArchitecture::MaskedAutoregressive => masked_autoregressive_flow(base, config, &mut rng, vb),
        FlowArchitecture::BlockNeuralAutoregressive => {
            block_neural_autoregressive_flow(base, config, &mut rng, vb)
        }
    }
}
