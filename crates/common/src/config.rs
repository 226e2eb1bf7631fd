//! Flow and training configuration.
//!
//! Serialised as JSON next to trained weights so a model directory can be
//! rebuilt exactly. Every field has a default, so `{}` deserialises to a
//! small two-dimensional coupling flow.

use std::path::Path;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

// ── Architecture enums ──────────────────────────────────────────────────────

/// Which conditioner family the flow layers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum FlowArchitecture {
    /// Split inputs; transform one half conditioned on the other.
    Coupling,
    /// MADE-style masked network over a fixed variable ordering.
    MaskedAutoregressive,
    /// Block neural autoregressive network (forward-only bijection).
    BlockNeuralAutoregressive,
}

/// Element-wise transformer driven by the conditioner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformerKind {
    Affine,
    RationalQuadraticSpline {
        /// Number of spline bins.
        knots: usize,
        /// Spline acts on `[-interval, interval]`, identity outside.
        interval: f64,
    },
}

/// Hidden-layer activation for conditioner networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Tanh,
    Silu,
}

/// Permutation inserted between flow layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermutationKind {
    /// Seeded random permutation per layer.
    Random,
    /// Reverse the variable order.
    Reverse,
}

/// Shape of the learning-rate curve over a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum LrDecay {
    /// Half cosine from the peak rate down to `lr_min`.
    Cosine,
    /// Straight line from the peak rate down to `lr_min`.
    Linear,
    /// Stay at the peak rate.
    None,
}

// ── FlowConfig ──────────────────────────────────────────────────────────────

/// Architecture of a normalising flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Dimension of the modelled variable.
    #[serde(default = "default_dim")]
    pub dim: usize,
    /// Dimension of the conditioning variable (None = unconditional).
    #[serde(default)]
    pub cond_dim: Option<usize>,
    #[serde(default = "default_architecture")]
    pub architecture: FlowArchitecture,
    /// Ignored by the block neural autoregressive architecture.
    #[serde(default = "default_transformer")]
    pub transformer: TransformerKind,
    /// Number of conditioner + transformer layers.
    #[serde(default = "default_flow_layers")]
    pub flow_layers: usize,
    /// Conditioner hidden width.
    #[serde(default = "default_nn_width")]
    pub nn_width: usize,
    /// Conditioner hidden depth (number of hidden layers).
    #[serde(default = "default_nn_depth")]
    pub nn_depth: usize,
    #[serde(default = "default_activation")]
    pub nn_activation: Activation,
    /// Block size used by the block neural autoregressive layers.
    #[serde(default = "default_nn_block_dim")]
    pub nn_block_dim: usize,
    /// Invert the layer chain so density evaluation uses the layers'
    /// forward pass (fast log-prob, slow sampling for autoregressive flows).
    #[serde(default = "default_true")]
    pub invert: bool,
    #[serde(default = "default_permutation")]
    pub permutation: PermutationKind,
    /// Seed for permutations drawn while building the flow.
    #[serde(default)]
    pub seed: u64,
}

fn default_dim() -> usize {
    2
}
fn default_architecture() -> FlowArchitecture {
    FlowArchitecture::Coupling
}
fn default_transformer() -> TransformerKind {
    TransformerKind::Affine
}
fn default_flow_layers() -> usize {
    8
}
fn default_nn_width() -> usize {
    50
}
fn default_nn_depth() -> usize {
    1
}
fn default_activation() -> Activation {
    Activation::Relu
}
fn default_nn_block_dim() -> usize {
    8
}
fn default_true() -> bool {
    true
}
fn default_permutation() -> PermutationKind {
    PermutationKind::Random
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            dim: default_dim(),
            cond_dim: None,
            architecture: default_architecture(),
            transformer: default_transformer(),
            flow_layers: default_flow_layers(),
            nn_width: default_nn_width(),
            nn_depth: default_nn_depth(),
            nn_activation: default_activation(),
            nn_block_dim: default_nn_block_dim(),
            invert: true,
            permutation: default_permutation(),
            seed: 0,
        }
    }
}

impl FlowConfig {
    /// Check the combination of settings describes a buildable flow.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dim == 0 {
            anyhow::bail!("dim must be positive");
        }
        if self.cond_dim == Some(0) {
            anyhow::bail!("cond_dim must be positive when set");
        }
        if self.flow_layers == 0 {
            anyhow::bail!("flow_layers must be positive");
        }
        if self.nn_width == 0 {
            anyhow::bail!("nn_width must be positive");
        }
        match self.architecture {
            FlowArchitecture::Coupling if self.dim < 2 => {
                anyhow::bail!("coupling flows need dim >= 2, got {}", self.dim);
            }
            FlowArchitecture::BlockNeuralAutoregressive => {
                if self.cond_dim.is_some() {
                    anyhow::bail!("block neural autoregressive flows are unconditional");
                }
                if self.nn_block_dim == 0 {
                    anyhow::bail!("nn_block_dim must be positive");
                }
                if self.nn_depth == 0 {
                    anyhow::bail!("block neural autoregressive flows need nn_depth >= 1");
                }
            }
            _ => {}
        }
        if let TransformerKind::RationalQuadraticSpline { knots, interval } = self.transformer {
            if knots < 2 {
                anyhow::bail!("spline needs at least 2 knots, got {knots}");
            }
            if !(interval > 0.0) {
                anyhow::bail!("spline interval must be positive, got {interval}");
            }
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── TrainConfig ─────────────────────────────────────────────────────────────

/// Maximum-likelihood training hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Stop once this many epochs have passed without a new best val loss.
    #[serde(default = "default_max_patience")]
    pub max_patience: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of rows held out for validation.
    #[serde(default = "default_val_prop")]
    pub val_prop: f64,
    #[serde(default)]
    pub weight_decay: f64,
    /// Global gradient-norm clip (0 = disabled).
    #[serde(default)]
    pub grad_clip_max_norm: f64,
    #[serde(default)]
    pub lr_warmup_steps: usize,
    #[serde(default)]
    pub lr_min: f64,
    #[serde(default = "default_lr_decay")]
    pub lr_decay: LrDecay,
    #[serde(default = "default_true")]
    pub show_progress: bool,
    #[serde(default)]
    pub seed: u64,
}

fn default_max_epochs() -> usize {
    50
}
fn default_max_patience() -> usize {
    5
}
fn default_learning_rate() -> f64 {
    5e-4
}
fn default_batch_size() -> usize {
    256
}
fn default_val_prop() -> f64 {
    0.1
}
fn default_lr_decay() -> LrDecay {
    LrDecay::None
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            max_patience: default_max_patience(),
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            val_prop: default_val_prop(),
            weight_decay: 0.0,
            grad_clip_max_norm: 0.0,
            lr_warmup_steps: 0,
            lr_min: 0.0,
            lr_decay: default_lr_decay(),
            show_progress: true,
            seed: 0,
        }
    }
}

// ── VariationalConfig ───────────────────────────────────────────────────────

/// Hyper-parameters for fitting a distribution to an unnormalised target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationalConfig {
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_samples_per_step")]
    pub samples_per_step: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Maximum global gradient norm before clipping.
    #[serde(default = "default_clip_norm")]
    pub clip_norm: f64,
    #[serde(default = "default_true")]
    pub show_progress: bool,
    #[serde(default)]
    pub seed: u64,
}

fn default_steps() -> usize {
    100
}
fn default_samples_per_step() -> usize {
    500
}
fn default_clip_norm() -> f64 {
    0.5
}

impl Default for VariationalConfig {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            samples_per_step: default_samples_per_step(),
            learning_rate: default_learning_rate(),
            clip_norm: default_clip_norm(),
            show_progress: true,
            seed: 0,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let loaded: FlowConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, FlowConfig::default());
        assert!(loaded.validate().is_ok());

        let train: TrainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(train.max_epochs, 50);
        assert_eq!(train.max_patience, 5);
        assert_eq!(train.batch_size, 256);
        assert!((train.learning_rate - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn spline_config_json_shape() {
        let json = r#"{
            "dim": 3,
            "architecture": "masked_autoregressive",
            "transformer": { "kind": "rational_quadratic_spline", "knots": 8, "interval": 4.0 }
        }"#;
        let loaded: FlowConfig = serde_json::from_str(json).unwrap();
        assert_eq!(loaded.architecture, FlowArchitecture::MaskedAutoregressive);
        assert_eq!(
            loaded.transformer,
            TransformerKind::RationalQuadraticSpline {
                knots: 8,
                interval: 4.0
            }
        );
        assert!(loaded.invert);
    }

    #[test]
    fn validate_rejects_bad_combinations() {
        let coupling_1d = FlowConfig {
            dim: 1,
            ..Default::default()
        };
        assert!(coupling_1d.validate().is_err());

        let conditional_bnaf = FlowConfig {
            architecture: FlowArchitecture::BlockNeuralAutoregressive,
            cond_dim: Some(2),
            ..Default::default()
        };
        assert!(conditional_bnaf.validate().is_err());

        let one_knot = FlowConfig {
            transformer: TransformerKind::RationalQuadraticSpline {
                knots: 1,
                interval: 3.0,
            },
            ..Default::default()
        };
        assert!(one_knot.validate().is_err());
    }

    #[test]
    fn save_load_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = FlowConfig {
            dim: 4,
            cond_dim: Some(2),
            flow_layers: 3,
            seed: 7,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = FlowConfig::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn command_line_names_match_json_names() {
        for decay in [LrDecay::Cosine, LrDecay::Linear, LrDecay::None] {
            let json = serde_json::to_string(&decay).unwrap();
            let name = decay.to_possible_value().unwrap();
            assert_eq!(json, format!("\"{}\"", name.get_name()));
        }
        assert_eq!(
            FlowArchitecture::from_str("block_neural_autoregressive", false),
            Ok(FlowArchitecture::BlockNeuralAutoregressive)
        );
        assert!(LrDecay::from_str("exponential", false).is_err());
        assert!(FlowArchitecture::from_str("realnvp", false).is_err());
    }
}
