//! Training loops.
//!
//! | Function | Objective |
//! |----------|-----------|
//! | [`fit_to_data`] | maximum likelihood on samples, with validation-based early stopping |
//! | [`fit_to_variational_target`] | reverse KL to an unnormalised log-density (ELBO) |
//!
//! Both update the variables of the given `VarMap` in place; the flow that
//! was built from it is the fitted model afterwards.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use nflow_common::{
    batch_ranges, chunk_ranges, count_fruitless, random_permutation_multiple, train_val_split, Matrix,
    TrainConfig, VariationalConfig,
};
use nflow_core::Distribution;

use crate::scheduler::LrScheduler;
use crate::trainer::{FlowTrainer, TrainerConfig};

/// Per-epoch mean losses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Losses {
    pub train: Vec<f32>,
    pub val: Vec<f32>,
}

impl Losses {
    /// Index of the epoch with the lowest validation loss.
    pub fn best_epoch(&self) -> Option<usize> {
        self.val
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }

    /// `epoch,train,val` lines with a header.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("epoch,train_loss,val_loss\n");
        for (i, (t, v)) in self.train.iter().zip(&self.val).enumerate() {
            out.push_str(&format!("{i},{t},{v}\n"));
        }
        out
    }
}

fn progress_bar(len: usize, show: bool, unit: &str) -> anyhow::Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!("[{{elapsed_precise}}] {{bar:40}} {{pos}}/{{len}} {unit} {{msg}}"))?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

fn rows_to_tensors(
    x: &Matrix,
    condition: Option<&Matrix>,
    device: &Device,
) -> anyhow::Result<(Tensor, Option<Tensor>)> {
    let c = condition.map(|c| c.to_tensor(device)).transpose()?;
    Ok((x.to_tensor(device)?, c))
}

// ── Maximum likelihood ──────────────────────────────────────────────────────

/// Fit `flow` to the rows of `x` by maximum likelihood.
///
/// Each epoch reshuffles the training rows and steps through full batches;
/// the validation loss is then evaluated on every held-out row. Parameters of
/// the best validation epoch are kept, and training stops once more than
/// `max_patience` epochs pass without improvement.
pub fn fit_to_data<D: Distribution + ?Sized>(
    flow: &D,
    varmap: &VarMap,
    x: &Matrix,
    condition: Option<&Matrix>,
    config: &TrainConfig,
    device: &Device,
) -> anyhow::Result<Losses> {
    if x.cols() != flow.dim() {
        anyhow::bail!("data has {} columns but the flow has dim {}", x.cols(), flow.dim());
    }
    if let Some(c) = condition {
        if c.rows() != x.rows() {
            anyhow::bail!("condition has {} rows but the data has {}", c.rows(), x.rows());
        }
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut inputs = vec![x];
    inputs.extend(condition);
    let (train, val) = train_val_split(&mut rng, &inputs, config.val_prop)?;
    let n_train = train[0].rows();
    let n_val = val[0].rows();
    if n_train == 0 || n_val == 0 {
        anyhow::bail!(
            "train/validation split of {} rows with val_prop {} leaves an empty set",
            x.rows(),
            config.val_prop
        );
    }

    let steps_per_epoch = batch_ranges(n_train, config.batch_size).len();
    let scheduler = LrScheduler::for_epochs(config, steps_per_epoch);
    let mut trainer = FlowTrainer::new(
        flow,
        varmap,
        scheduler,
        TrainerConfig {
            weight_decay: config.weight_decay,
            grad_clip_max_norm: config.grad_clip_max_norm,
        },
    )?;

    let val_batches = chunk_ranges(n_val, config.batch_size)
        .into_iter()
        .map(|r| {
            let c = val.get(1).map(|c| c.slice_rows(r.clone()));
            rows_to_tensors(&val[0].slice_rows(r), c.as_ref(), device)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    tracing::info!(
        train_rows = n_train,
        val_rows = n_val,
        steps_per_epoch,
        max_epochs = config.max_epochs,
        "fitting flow to data"
    );

    let mut losses = Losses::default();
    let mut best_params = trainer.snapshot()?;
    let pb = progress_bar(config.max_epochs, config.show_progress, "epochs")?;

    for epoch in 0..config.max_epochs {
        let refs: Vec<&Matrix> = train.iter().collect();
        let shuffled = random_permutation_multiple(&mut rng, &refs)?;
        let mut epoch_loss = 0.0f64;
        let mut n_batches = 0usize;
        for r in batch_ranges(n_train, config.batch_size) {
            let c = shuffled.get(1).map(|c| c.slice_rows(r.clone()));
            let (xb, cb) = rows_to_tensors(&shuffled[0].slice_rows(r), c.as_ref(), device)?;
            let m = trainer.step(&xb, cb.as_ref())?;
            epoch_loss += m.loss as f64;
            n_batches += 1;
        }
        let train_loss = (epoch_loss / n_batches.max(1) as f64) as f32;
        let val_loss = trainer.evaluate(val_batches.iter().cloned())?;
        losses.train.push(train_loss);
        losses.val.push(val_loss);

        tracing::debug!(epoch, train_loss, val_loss, lr = trainer.current_lr(), "epoch done");
        pb.set_message(format!("train {train_loss:.4} val {val_loss:.4}"));
        pb.inc(1);

        if losses.best_epoch() == Some(epoch) {
            best_params = trainer.snapshot()?;
        }
        if count_fruitless(&losses.val) > config.max_patience {
            tracing::info!(epoch, "max patience reached, stopping early");
            break;
        }
    }
    pb.finish_with_message("done");

    trainer.restore(&best_params)?;
    if let Some(best) = losses.best_epoch() {
        tracing::info!(best_epoch = best, val_loss = losses.val[best], "restored best parameters");
    }
    Ok(losses)
}

// ── Variational inference ───────────────────────────────────────────────────

/// Fit `dist` to an unnormalised log-density by minimising
/// `mean(log q(x) - target(x))` over reparameterised samples `x ~ q`.
///
/// `target` maps `(n, dim)` points to `(n,)` log-densities and must be
/// built from candle ops so gradients flow through the samples. Returns the
/// loss of every step.
pub fn fit_to_variational_target<D, F>(
    dist: &D,
    varmap: &VarMap,
    target: F,
    config: &VariationalConfig,
) -> anyhow::Result<Vec<f32>>
where
    D: Distribution + ?Sized,
    F: Fn(&Tensor) -> anyhow::Result<Tensor>,
{
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut trainer = FlowTrainer::new(
        dist,
        varmap,
        LrScheduler::for_variational(config),
        TrainerConfig {
            weight_decay: 0.0,
            grad_clip_max_norm: config.clip_norm,
        },
    )?;

    tracing::info!(
        steps = config.steps,
        samples_per_step = config.samples_per_step,
        "fitting to variational target"
    );
    let pb = progress_bar(config.steps, config.show_progress, "steps")?;
    let mut losses = Vec::with_capacity(config.steps);
    for _ in 0..config.steps {
        let (x, log_q) = dist.sample_and_log_prob(&mut rng, config.samples_per_step, None)?;
        let log_p = target(&x)?;
        if log_p.dims() != log_q.dims() {
            anyhow::bail!(
                "target returned shape {:?}, expected {:?}",
                log_p.dims(),
                log_q.dims()
            );
        }
        let loss = (log_q - log_p)?.mean_all()?;
        let m = trainer.step_loss(&loss)?;
        pb.set_message(format!("loss {:.4}", m.loss));
        pb.inc(1);
        losses.push(m.loss);
    }
    pb.finish_with_message("done");
    Ok(losses)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarBuilder;
    use nflow_core::{Bijection, Normal};
    use rand_distr::{Distribution as _, Normal as NormalNoise};

    fn gaussian_rows(n: usize, mean: f32, std: f32, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = NormalNoise::new(mean, std).unwrap();
        let data: Vec<f32> = (0..n * 2).map(|_| noise.sample(&mut rng)).collect();
        Matrix::new(data, n, 2).unwrap()
    }

    fn trainable_normal() -> (VarMap, Normal) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let normal = Normal::trainable(2, vb).unwrap();
        (varmap, normal)
    }

    fn config() -> TrainConfig {
        TrainConfig {
            max_epochs: 40,
            learning_rate: 0.05,
            batch_size: 64,
            show_progress: false,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn maximum_likelihood_recovers_the_mean() {
        let (varmap, normal) = trainable_normal();
        let x = gaussian_rows(500, 2.0, 0.5, 1);
        let losses = fit_to_data(&normal, &varmap, &x, None, &config(), &Device::Cpu).unwrap();
        assert!(losses.train.last().unwrap() < &losses.train[0]);
        assert_eq!(losses.train.len(), losses.val.len());
        let lp: Vec<f32> = normal
            .log_prob(&Tensor::new(&[[2.0f32, 2.0], [0.0, 0.0]], &Device::Cpu).unwrap(), None)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(lp[0] > lp[1]);
    }

    #[test]
    fn best_parameters_are_restored() {
        let (varmap, normal) = trainable_normal();
        let x = gaussian_rows(300, -1.0, 1.0, 2);
        let cfg = TrainConfig {
            max_epochs: 8,
            max_patience: 100,
            seed: 3,
            ..config()
        };
        let losses = fit_to_data(&normal, &varmap, &x, None, &cfg, &Device::Cpu).unwrap();
        assert_eq!(losses.val.len(), 8);

        // Recompute the validation loss on the same split with the restored
        // parameters: it must equal the best epoch's.
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let (_, val) = train_val_split(&mut rng, &[&x], cfg.val_prop).unwrap();
        let vx = val[0].to_tensor(&Device::Cpu).unwrap();
        let nll = normal
            .log_prob(&vx, None)
            .unwrap()
            .mean_all()
            .unwrap()
            .neg()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let best = losses.val[losses.best_epoch().unwrap()];
        assert!((nll - best).abs() < 1e-4, "{nll} vs {best}");
    }

    #[test]
    fn validation_loss_covers_every_row() {
        let (varmap, normal) = trainable_normal();
        let x = gaussian_rows(100, 1.5, 2.0, 6);
        // 50 validation rows in batches of 32 leave a short tail batch.
        let cfg = TrainConfig {
            max_epochs: 1,
            learning_rate: 0.0,
            batch_size: 32,
            val_prop: 0.5,
            seed: 7,
            ..config()
        };
        let losses = fit_to_data(&normal, &varmap, &x, None, &cfg, &Device::Cpu).unwrap();

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let (_, val) = train_val_split(&mut rng, &[&x], cfg.val_prop).unwrap();
        assert_eq!(val[0].rows(), 50);
        let vx = val[0].to_tensor(&Device::Cpu).unwrap();
        let nll = normal
            .log_prob(&vx, None)
            .unwrap()
            .mean_all()
            .unwrap()
            .neg()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((nll - losses.val[0]).abs() < 1e-4, "{nll} vs {}", losses.val[0]);
    }

    #[test]
    fn early_stopping_honours_patience() {
        let (varmap, normal) = trainable_normal();
        let x = gaussian_rows(200, 0.0, 1.0, 4);
        let cfg = TrainConfig {
            max_epochs: 200,
            max_patience: 0,
            learning_rate: 0.5,
            ..config()
        };
        let losses = fit_to_data(&normal, &varmap, &x, None, &cfg, &Device::Cpu).unwrap();
        assert!(losses.val.len() < 200);
        assert_eq!(count_fruitless(&losses.val), 1);
    }

    #[test]
    fn empty_validation_set_is_an_error() {
        let (varmap, normal) = trainable_normal();
        let x = gaussian_rows(10, 0.0, 1.0, 5);
        let cfg = TrainConfig {
            val_prop: 0.0,
            ..config()
        };
        assert!(fit_to_data(&normal, &varmap, &x, None, &cfg, &Device::Cpu).is_err());
    }

    #[test]
    fn variational_fit_moves_towards_the_target() {
        let (varmap, normal) = trainable_normal();
        let target = |x: &Tensor| -> anyhow::Result<Tensor> {
            // Unnormalised N(3, 1) in each dimension.
            Ok((x.affine(1.0, -3.0)?.sqr()?.sum(1)? * -0.5)?)
        };
        let cfg = VariationalConfig {
            steps: 150,
            samples_per_step: 64,
            learning_rate: 0.05,
            show_progress: false,
            ..VariationalConfig::default()
        };
        let losses = fit_to_variational_target(&normal, &varmap, target, &cfg).unwrap();
        assert_eq!(losses.len(), 150);
        let head: f32 = losses[..10].iter().sum::<f32>() / 10.0;
        let tail: f32 = losses[140..].iter().sum::<f32>() / 10.0;
        assert!(tail < head, "{tail} !< {head}");
        let loc: Vec<f32> = normal.as_transformed().bijection().layers()[0]
            .transform(&Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap(), None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(loc.iter().all(|v| *v > 1.5), "{loc:?}");
    }
}
