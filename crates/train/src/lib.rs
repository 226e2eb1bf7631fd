//! # nflow-train — Training Loops
//!
//! Optimisation for flows built with `nflow-core`:
//!
//! * **[`FlowTrainer`]** — owns the optimiser and schedule. One call to
//!   [`FlowTrainer::step`] runs the negative log-likelihood, backward,
//!   gradient clipping, AdamW and schedule advancement.
//! * **[`fit_to_data`]** — epochs, validation, early stopping and
//!   best-parameter restore.
//! * **[`fit_to_variational_target`]** — ELBO fit to an unnormalised density.
//! * **[`LrScheduler`]** — warmup and decay stretched over the step budget
//!   of a fit.

pub mod fit;
pub mod scheduler;
pub mod trainer;

pub use fit::{fit_to_data, fit_to_variational_target, Losses};
pub use scheduler::LrScheduler;
pub use trainer::{clip_grad_norm, grad_norm, FlowTrainer, StepMetrics, TrainerConfig};
