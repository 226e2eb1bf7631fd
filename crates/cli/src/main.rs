use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use nflow_common::{load_matrix, FlowArchitecture, FlowConfig, LrDecay, Matrix, TrainConfig};
use nflow_core::{build_flow, Distribution, StandardNormal, Transformed};
use nflow_train::fit_to_data;

const MODEL_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";
const LOSSES_FILE: &str = "losses.csv";

#[derive(Parser, Debug)]
#[command(name = "nflow", about = "Fit and query normalising flows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit a flow to a data file by maximum likelihood.
    Fit(FitArgs),
    /// Print the log-density of each row of a points file.
    LogProb(LogProbArgs),
    /// Draw samples from a trained flow as CSV.
    Sample(SampleArgs),
    /// Write a default flow config to edit.
    InitConfig(InitConfigArgs),
}

// ── Fit ────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct FitArgs {
    /// Training data, one sample per row (CSV or whitespace separated).
    #[arg(long)]
    data: PathBuf,
    /// Optional conditioning variables, one row per data row.
    #[arg(long)]
    condition: Option<PathBuf>,
    /// Flow config; a default one matching the data is used when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "flow")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 50)]
    max_epochs: usize,
    #[arg(long, default_value_t = 5)]
    max_patience: usize,
    #[arg(long, default_value_t = 5e-4)]
    lr: f64,
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    #[arg(long, default_value_t = 0.1)]
    val_prop: f64,
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f64,
    #[arg(long, default_value_t = 0.0)]
    grad_clip_max_norm: f64,
    #[arg(long, default_value_t = 0)]
    lr_warmup_steps: usize,
    #[arg(long, default_value_t = 0.0)]
    lr_min: f64,
    #[arg(long, value_enum, default_value_t = LrDecay::None)]
    lr_decay: LrDecay,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    #[arg(long)]
    no_progress: bool,
}

// ── Log-prob / Sample ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct LogProbArgs {
    #[arg(long)]
    model_dir: PathBuf,
    /// Points to evaluate, one per row.
    #[arg(long)]
    points: PathBuf,
    /// Condition file: one row shared by all points, or one row per point.
    #[arg(long)]
    condition: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct SampleArgs {
    #[arg(long)]
    model_dir: PathBuf,
    #[arg(long, default_value_t = 1000)]
    n: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Condition shared by all samples, comma separated.
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    condition: Option<Vec<f32>>,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "flow.json")]
    output: PathBuf,
    #[arg(long, default_value_t = 2)]
    dim: usize,
    #[arg(long)]
    cond_dim: Option<usize>,
    #[arg(long, value_enum, default_value_t = FlowArchitecture::Coupling)]
    architecture: FlowArchitecture,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Fit(args) => cmd_fit(args),
        Command::LogProb(args) => cmd_log_prob(args),
        Command::Sample(args) => cmd_sample(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn new_flow(config: &FlowConfig, device: &Device) -> Result<(VarMap, Transformed)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let base = StandardNormal::new(config.dim, device);
    let flow = build_flow(config, Box::new(base), vb)?;
    Ok((varmap, flow))
}

/// Rebuild a flow from `config.json` and load its weights.
fn load_model(model_dir: &Path, device: &Device) -> Result<(FlowConfig, Transformed)> {
    let config_path = model_dir.join(CONFIG_FILE);
    let config = FlowConfig::load(&config_path)
        .with_context(|| format!("load {}", config_path.display()))?;
    let (mut varmap, flow) = new_flow(&config, device)?;
    let weights = model_dir.join(MODEL_FILE);
    varmap
        .load(&weights)
        .with_context(|| format!("load weights {}", weights.display()))?;
    Ok((config, flow))
}

fn print_rows(m: &Matrix) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for i in 0..m.rows() {
        let row: Vec<String> = m.row(i).iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", row.join(","))?;
    }
    Ok(())
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_fit(args: FitArgs) -> Result<()> {
    let x = load_matrix(&args.data)?;
    let condition = args.condition.as_deref().map(load_matrix).transpose()?;
    eprintln!("Loaded {} rows of dim {}", x.rows(), x.cols());

    let config = match &args.config {
        Some(path) => FlowConfig::load(path).with_context(|| format!("load {}", path.display()))?,
        None => FlowConfig {
            dim: x.cols(),
            cond_dim: condition.as_ref().map(|c| c.cols()),
            architecture: if x.cols() < 2 {
                FlowArchitecture::MaskedAutoregressive
            } else {
                FlowArchitecture::Coupling
            },
            seed: args.seed,
            ..FlowConfig::default()
        },
    };
    if config.dim != x.cols() {
        anyhow::bail!("config has dim {} but the data has {} columns", config.dim, x.cols());
    }
    if config.cond_dim != condition.as_ref().map(|c| c.cols()) {
        anyhow::bail!(
            "config has cond_dim {:?} but the condition file gives {:?}",
            config.cond_dim,
            condition.as_ref().map(|c| c.cols())
        );
    }

    let train_config = TrainConfig {
        max_epochs: args.max_epochs,
        max_patience: args.max_patience,
        learning_rate: args.lr,
        batch_size: args.batch_size,
        val_prop: args.val_prop,
        weight_decay: args.weight_decay,
        grad_clip_max_norm: args.grad_clip_max_norm,
        lr_warmup_steps: args.lr_warmup_steps,
        lr_min: args.lr_min,
        lr_decay: args.lr_decay,
        show_progress: !args.no_progress,
        seed: args.seed,
    };

    let device = Device::cuda_if_available(0)?;
    let (varmap, flow) = new_flow(&config, &device)?;
    let losses = fit_to_data(&flow, &varmap, &x, condition.as_ref(), &train_config, &device)?;

    std::fs::create_dir_all(&args.output_dir)?;
    varmap.save(args.output_dir.join(MODEL_FILE))?;
    config.save(&args.output_dir.join(CONFIG_FILE))?;
    std::fs::write(args.output_dir.join(LOSSES_FILE), losses.to_csv())?;

    if let Some(best) = losses.best_epoch() {
        eprintln!(
            "epochs {} best epoch {} val loss {:.4}",
            losses.val.len(),
            best,
            losses.val[best]
        );
    }
    eprintln!("Saved model to {}", args.output_dir.display());
    Ok(())
}

fn cmd_log_prob(args: LogProbArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let (_config, flow) = load_model(&args.model_dir, &device)?;
    let points = load_matrix(&args.points)?.to_tensor(&device)?;
    let condition = match &args.condition {
        Some(path) => {
            let c = load_matrix(path)?;
            let t = c.to_tensor(&device)?;
            Some(if c.rows() == 1 { t.squeeze(0)? } else { t })
        }
        None => None,
    };
    let log_prob: Vec<f32> = flow.log_prob(&points, condition.as_ref())?.to_vec1()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for lp in log_prob {
        writeln!(out, "{lp}")?;
    }
    Ok(())
}

fn cmd_sample(args: SampleArgs) -> Result<()> {
    let device = Device::cuda_if_available(0)?;
    let (_config, flow) = load_model(&args.model_dir, &device)?;
    let condition = args
        .condition
        .map(|c| {
            let n = c.len();
            Tensor::from_vec(c, n, &device)
        })
        .transpose()?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let samples = flow.sample(&mut rng, args.n, condition.as_ref())?;
    print_rows(&Matrix::from_tensor(&samples)?)
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    let config = FlowConfig {
        dim: args.dim,
        cond_dim: args.cond_dim,
        architecture: args.architecture,
        ..FlowConfig::default()
    };
    config.validate()?;
    config.save(&args.output)?;
    eprintln!("Wrote {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_flags_reject_unknown_values() {
        let cli = Cli::try_parse_from(["nflow", "fit", "--data", "x.csv", "--lr-decay", "cosine"]).unwrap();
        match cli.command {
            Command::Fit(args) => assert_eq!(args.lr_decay, LrDecay::Cosine),
            other => panic!("parsed {other:?}"),
        }
        assert!(Cli::try_parse_from(["nflow", "fit", "--data", "x.csv", "--lr-decay", "cosin"]).is_err());

        let cli = Cli::try_parse_from(["nflow", "init-config", "--architecture", "masked_autoregressive"]).unwrap();
        match cli.command {
            Command::InitConfig(args) => assert_eq!(args.architecture, FlowArchitecture::MaskedAutoregressive),
            other => panic!("parsed {other:?}"),
        }
        assert!(Cli::try_parse_from(["nflow", "init-config", "--architecture", "realnvp"]).is_err());
    }
}
