//! Learning-rate schedule over a fixed optimiser-step budget.
//!
//! The budget comes from the fit loop: `fit_to_data` runs at most
//! `max_epochs * steps_per_epoch` steps, and the decay shape is stretched
//! over that whole run. An optional linear warmup multiplies the decayed
//! rate during the first steps. A run that stops early simply never
//! reaches the floor.

use nflow_common::{LrDecay, TrainConfig, VariationalConfig};

#[derive(Clone, Debug)]
pub struct LrScheduler {
    peak: f64,
    floor: f64,
    warmup_steps: usize,
    total_steps: usize,
    decay: LrDecay,
    step: usize,
}

impl LrScheduler {
    /// Schedule for a maximum-likelihood fit of `config.max_epochs` epochs
    /// of `steps_per_epoch` optimiser steps each.
    pub fn for_epochs(config: &TrainConfig, steps_per_epoch: usize) -> Self {
        let total_steps = config.max_epochs * steps_per_epoch;
        Self {
            peak: config.learning_rate,
            floor: config.lr_min,
            warmup_steps: config.lr_warmup_steps.min(total_steps),
            total_steps,
            decay: config.lr_decay,
            step: 0,
        }
    }

    /// Variational fits run at the configured rate for every step.
    pub fn for_variational(config: &VariationalConfig) -> Self {
        Self::constant(config.learning_rate, config.steps)
    }

    /// `lr` for `total_steps` steps: no warmup, no decay.
    pub fn constant(lr: f64, total_steps: usize) -> Self {
        Self {
            peak: lr,
            floor: lr,
            warmup_steps: 0,
            total_steps,
            decay: LrDecay::None,
            step: 0,
        }
    }

    /// Rate at an arbitrary optimiser step. Steps past the budget keep the
    /// final rate.
    pub fn lr_at(&self, step: usize) -> f64 {
        self.warmup_factor(step) * self.decayed(step)
    }

    fn warmup_factor(&self, step: usize) -> f64 {
        if step >= self.warmup_steps {
            1.0
        } else {
            (step + 1) as f64 / self.warmup_steps as f64
        }
    }

    fn decayed(&self, step: usize) -> f64 {
        if self.total_steps == 0 {
            return self.peak;
        }
        let progress = step.min(self.total_steps) as f64 / self.total_steps as f64;
        let span = self.peak - self.floor;
        match self.decay {
            LrDecay::None => self.peak,
            LrDecay::Linear => self.peak - span * progress,
            LrDecay::Cosine => self.floor + 0.5 * span * (1.0 + (std::f64::consts::PI * progress).cos()),
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn train_config(decay: LrDecay) -> TrainConfig {
        TrainConfig {
            max_epochs: 10,
            learning_rate: 1e-2,
            lr_min: 1e-4,
            lr_decay: decay,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn budget_is_epochs_times_batches() {
        let sched = LrScheduler::for_epochs(&train_config(LrDecay::Cosine), 5);
        assert_eq!(sched.total_steps(), 50);
        assert!((sched.lr_at(0) - 1e-2).abs() < 1e-12);
        assert!((sched.lr_at(25) - (1e-2 + 1e-4) / 2.0).abs() < 1e-9);
        assert!((sched.lr_at(50) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn linear_decay_holds_the_floor_after_the_budget() {
        let sched = LrScheduler::for_epochs(&train_config(LrDecay::Linear), 4);
        assert!((sched.lr_at(10) - (1e-2 - (1e-2 - 1e-4) * 0.25)).abs() < 1e-12);
        assert_eq!(sched.lr_at(40), sched.lr_at(400));
        assert!((sched.lr_at(400) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn warmup_ramps_into_the_decay_curve() {
        let config = TrainConfig {
            lr_warmup_steps: 4,
            ..train_config(LrDecay::Linear)
        };
        let sched = LrScheduler::for_epochs(&config, 10);
        let unwarmed = LrScheduler::for_epochs(&train_config(LrDecay::Linear), 10);
        assert!((sched.lr_at(0) - 0.25 * unwarmed.lr_at(0)).abs() < 1e-12);
        assert!((sched.lr_at(3) - unwarmed.lr_at(3)).abs() < 1e-12);
        assert_eq!(sched.lr_at(20), unwarmed.lr_at(20));
    }

    #[test]
    fn warmup_is_clamped_to_a_short_run() {
        let config = TrainConfig {
            max_epochs: 2,
            lr_warmup_steps: 1000,
            ..train_config(LrDecay::None)
        };
        let sched = LrScheduler::for_epochs(&config, 3);
        assert!((sched.lr_at(5) - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn advancing_follows_lr_at() {
        let mut sched = LrScheduler::for_epochs(&train_config(LrDecay::Cosine), 3);
        for _ in 0..7 {
            sched.advance();
        }
        assert_eq!(sched.step(), 7);
        assert_eq!(sched.current_lr(), sched.lr_at(7));
    }

    #[test]
    fn variational_schedule_is_flat() {
        let config = VariationalConfig {
            learning_rate: 3e-3,
            steps: 20,
            ..VariationalConfig::default()
        };
        let sched = LrScheduler::for_variational(&config);
        assert_eq!(sched.total_steps(), 20);
        assert_eq!(sched.lr_at(0), 3e-3);
        assert_eq!(sched.lr_at(19), 3e-3);
        assert_eq!(sched.lr_at(100), 3e-3);
    }
}
