//! Composition (`Chain`) and direction swapping (`Invert`).

use candle_core::Tensor;

use super::Bijection;
use crate::error::{check_points, Error, Result};
use crate::ops::zeros_batch;

// ── Chain ───────────────────────────────────────────────────────────────────

/// Applies bijections in order; the inverse runs them in reverse. Log-dets
/// are summed.
#[derive(Default)]
pub struct Chain {
    layers: Vec<Box<dyn Bijection>>,
}

impl Chain {
    /// Build from layers, checking that dimensions and conditions agree.
    pub fn new(layers: Vec<Box<dyn Bijection>>) -> Result<Self> {
        let mut chain = Self::default();
        for layer in layers {
            chain.push_boxed(layer)?;
        }
        Ok(chain)
    }

    pub fn push<B: Bijection + 'static>(&mut self, layer: B) -> Result<()> {
        self.push_boxed(Box::new(layer))
    }

    pub fn push_boxed(&mut self, layer: Box<dyn Bijection>) -> Result<()> {
        if let Some(first) = self.layers.first() {
            if layer.dim() != first.dim() {
                return Err(Error::InvalidConfig(format!(
                    "{} has dim {} but the chain has dim {}",
                    layer.name(),
                    layer.dim(),
                    first.dim()
                )));
            }
        }
        if let (Some(a), Some(b)) = (self.cond_dim(), layer.cond_dim()) {
            if a != b {
                return Err(Error::ConditionMismatch(format!(
                    "{} expects cond_dim {b} but the chain uses {a}",
                    layer.name()
                )));
            }
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Append every layer of `other`, keeping the chain flat.
    pub fn merge(mut self, other: Chain) -> Result<Self> {
        for layer in other.layers {
            self.push_boxed(layer)?;
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Bijection>] {
        &self.layers
    }

    /// An empty chain is the identity on any width.
    fn check_input(&self, x: &Tensor) -> Result<usize> {
        if self.layers.is_empty() {
            Ok(x.dims2()?.0)
        } else {
            check_points("Chain input", x, self.dim())
        }
    }
}

impl Bijection for Chain {
    fn dim(&self) -> usize {
        self.layers.first().map(|l| l.dim()).unwrap_or(0)
    }

    fn cond_dim(&self) -> Option<usize> {
        self.layers.iter().find_map(|l| l.cond_dim())
    }

    fn name(&self) -> &'static str {
        "Chain"
    }

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = self.check_input(x)?;
        let mut y = x.clone();
        let mut log_det = zeros_batch(batch, x.device())?;
        for layer in &self.layers {
            let (next, ld) = layer.transform_and_log_det(&y, condition)?;
            y = next;
            log_det = (log_det + ld)?;
        }
        Ok((y, log_det))
    }

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let batch = self.check_input(y)?;
        let mut x = y.clone();
        let mut log_det = zeros_batch(batch, y.device())?;
        for layer in self.layers.iter().rev() {
            let (next, ld) = layer.inverse_and_log_det(&x, condition)?;
            x = next;
            log_det = (log_det + ld)?;
        }
        Ok((x, log_det))
    }
}

// ── Invert ──────────────────────────────────────────────────────────────────

/// Swaps the forward and inverse directions of the wrapped bijection.
pub struct Invert<B> {
    inner: B,
}

impl<B: Bijection> Invert<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> B {
        self.inner
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }
}

impl<B: Bijection> Bijection for Invert<B> {
    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn cond_dim(&self) -> Option<usize> {
        self.inner.cond_dim()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn transform_and_log_det(&self, x: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.inner.inverse_and_log_det(x, condition)
    }

    fn inverse_and_log_det(&self, y: &Tensor, condition: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        self.inner.transform_and_log_det(y, condition)
    }
}
