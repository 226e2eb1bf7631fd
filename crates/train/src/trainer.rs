//! FlowTrainer: one optimisation step at a time.
//!
//! Decouples the loss (negative mean log-likelihood, or any scalar loss the
//! caller builds from the flow) from the optimisation step: backward,
//! global-norm gradient clipping, AdamW, schedule advance.

use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

use nflow_core::Distribution;

use crate::scheduler::LrScheduler;

// ── Config ──────────────────────────────────────────────────────────────────

/// Optimiser knobs for a [`FlowTrainer`].
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub weight_decay: f64,
    /// Global gradient-norm clip (0 = disabled).
    pub grad_clip_max_norm: f64,
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    /// Global gradient norm before clipping (only computed when clipping).
    pub grad_norm: Option<f64>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// Owns the optimiser and schedule for the variables of one flow. The flow
/// is borrowed; its variables are updated in place.
pub struct FlowTrainer<'a, D: Distribution + ?Sized> {
    flow: &'a D,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    config: TrainerConfig,
    pub global_step: usize,
}

impl<'a, D: Distribution + ?Sized> FlowTrainer<'a, D> {
    /// Train every variable in `varmap`.
    pub fn new(
        flow: &'a D,
        varmap: &VarMap,
        lr_scheduler: LrScheduler,
        config: TrainerConfig,
    ) -> anyhow::Result<Self> {
        let vars = varmap.all_vars();
        if vars.is_empty() {
            anyhow::bail!("the variable map is empty; nothing to train");
        }
        let n_params: usize = vars.iter().map(|v| v.as_tensor().elem_count()).sum();
        tracing::info!(tensors = vars.len(), params = n_params, "trainable parameters");

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: lr_scheduler.current_lr(),
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            flow,
            vars,
            optimizer,
            lr_scheduler,
            config,
            global_step: 0,
        })
    }

    pub fn flow(&self) -> &D {
        self.flow
    }

    /// Negative mean log-likelihood of a `(batch, dim)` tensor.
    pub fn nll(&self, batch: &Tensor, condition: Option<&Tensor>) -> anyhow::Result<Tensor> {
        Ok(self.flow.log_prob(batch, condition)?.mean_all()?.neg()?)
    }

    /// One maximum-likelihood step on `batch`.
    pub fn step(&mut self, batch: &Tensor, condition: Option<&Tensor>) -> anyhow::Result<StepMetrics> {
        let loss = self.nll(batch, condition)?;
        self.step_loss(&loss)
    }

    /// Backward + clip + AdamW on an arbitrary scalar loss.
    pub fn step_loss(&mut self, loss: &Tensor) -> anyhow::Result<StepMetrics> {
        let loss_val = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
        if !loss_val.is_finite() {
            tracing::warn!(step = self.global_step, loss = loss_val, "non-finite loss");
        }

        self.optimizer.set_learning_rate(self.lr_scheduler.current_lr());
        let mut grads = loss.backward()?;

        let grad_norm = if self.config.grad_clip_max_norm > 0.0 {
            Some(clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip_max_norm)?)
        } else {
            None
        };

        self.optimizer.step(&grads)?;

        let lr = self.lr_scheduler.current_lr();
        self.lr_scheduler.advance();
        self.global_step += 1;

        Ok(StepMetrics {
            step: self.global_step - 1,
            loss: loss_val,
            lr,
            grad_norm,
        })
    }

    /// Mean negative log-likelihood per row over `batches`, without updating
    /// anything. Batches of different sizes are weighted by their row count.
    pub fn evaluate<I>(&self, batches: I) -> anyhow::Result<f32>
    where
        I: IntoIterator<Item = (Tensor, Option<Tensor>)>,
    {
        let mut loss_sum = 0.0f64;
        let mut count = 0usize;
        for (x, condition) in batches {
            let rows = x.dim(0)?;
            let l = self.nll(&x.detach(), condition.as_ref())?;
            loss_sum += l.to_scalar::<f32>()? as f64 * rows as f64;
            count += rows;
        }
        if count == 0 {
            return Ok(f32::MAX);
        }
        Ok((loss_sum / count as f64) as f32)
    }

    /// Copy of every variable, in the optimiser's order.
    pub fn snapshot(&self) -> anyhow::Result<Vec<Tensor>> {
        Ok(self
            .vars
            .iter()
            .map(|v| v.as_tensor().copy())
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    /// Write a [`snapshot`](Self::snapshot) back into the variables.
    pub fn restore(&self, snapshot: &[Tensor]) -> anyhow::Result<()> {
        if snapshot.len() != self.vars.len() {
            anyhow::bail!(
                "snapshot has {} tensors but the trainer has {} variables",
                snapshot.len(),
                self.vars.len()
            );
        }
        for (var, t) in self.vars.iter().zip(snapshot) {
            var.set(t)?;
        }
        Ok(())
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_scheduler.current_lr()
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm || norm == 0.0 {
        return Ok(norm);
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use nflow_core::Normal;

    fn setup() -> (VarMap, Normal) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let normal = Normal::trainable(1, vb).unwrap();
        (varmap, normal)
    }

    fn data() -> Tensor {
        Tensor::new(&[[2.5f32], [3.0], [3.5], [2.0], [4.0]], &Device::Cpu).unwrap()
    }

    #[test]
    fn steps_lower_the_loss() {
        let (varmap, normal) = setup();
        let config = TrainerConfig {
            weight_decay: 0.0,
            grad_clip_max_norm: 0.0,
        };
        let mut trainer = FlowTrainer::new(&normal, &varmap, LrScheduler::constant(0.05, 101), config).unwrap();
        let first = trainer.step(&data(), None).unwrap();
        let mut last = first.clone();
        for _ in 0..100 {
            last = trainer.step(&data(), None).unwrap();
        }
        assert_eq!(last.step, 100);
        assert!(last.loss < first.loss, "{} !< {}", last.loss, first.loss);
        assert!(first.grad_norm.is_none());
    }

    #[test]
    fn clipping_bounds_the_update() {
        let dev = Device::Cpu;
        let var = Var::new(&[3.0f32, 4.0], &dev).unwrap();
        let loss = var.as_tensor().sum_all().unwrap().affine(10.0, 0.0).unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![var.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 200f64.sqrt()).abs() < 1e-4);
        let after = grad_norm(&grads, &vars).unwrap();
        assert!((after - 1.0).abs() < 1e-5);
    }

    #[test]
    fn snapshot_and_restore() {
        let (varmap, normal) = setup();
        let config = TrainerConfig {
            weight_decay: 0.0,
            grad_clip_max_norm: 1.0,
        };
        let mut trainer = FlowTrainer::new(&normal, &varmap, LrScheduler::constant(0.1, 10), config).unwrap();
        let before = trainer.evaluate([(data(), None)]).unwrap();
        let snap = trainer.snapshot().unwrap();
        for _ in 0..10 {
            let m = trainer.step(&data(), None).unwrap();
            assert!(m.grad_norm.is_some());
        }
        assert_ne!(trainer.evaluate([(data(), None)]).unwrap(), before);
        trainer.restore(&snap).unwrap();
        assert_eq!(trainer.evaluate([(data(), None)]).unwrap(), before);
    }

    #[test]
    fn empty_varmap_is_rejected() {
        let varmap = VarMap::new();
        let normal = Normal::new(&[0.0], &[1.0], &Device::Cpu).unwrap();
        let config = TrainerConfig {
            weight_decay: 0.0,
            grad_clip_max_norm: 0.0,
        };
        assert!(FlowTrainer::new(&normal, &varmap, LrScheduler::constant(0.1, 10), config).is_err());
    }
}
