//! # nflow-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`FlowConfig`]** — flow architecture (serialised as JSON).
//! * **[`TrainConfig`]** / **[`VariationalConfig`]** — training knobs.
//! * **[`Matrix`]** and the split / batching helpers in [`data`].

pub mod config;
pub mod data;

pub use config::{
    Activation, FlowArchitecture, FlowConfig, LrDecay, PermutationKind, TrainConfig,
    TransformerKind, VariationalConfig,
};
pub use data::{
    batch_ranges, chunk_ranges, count_fruitless, load_matrix, parse_matrix, random_permutation_multiple,
    train_val_split, write_matrix, Matrix,
};
