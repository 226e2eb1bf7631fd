use std::fs;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution as _, Normal as NormalNoise};
use tempfile::tempdir;

use nflow_common::{load_matrix, write_matrix, FlowArchitecture, FlowConfig, Matrix, TrainConfig, TransformerKind};
use nflow_core::{build_flow, Distribution, StandardNormal};
use nflow_train::fit_to_data;

/// Correlated 2-D Gaussian: x1 ~ N(0, 1), x2 = x1 + 0.3 * noise.
fn correlated_rows(n: usize) -> Matrix {
    let mut rng = StdRng::seed_from_u64(17);
    let noise = NormalNoise::new(0.0f32, 1.0).unwrap();
    let mut data = Vec::with_capacity(n * 2);
    for _ in 0..n {
        let a = noise.sample(&mut rng);
        data.push(a);
        data.push(a + 0.3 * noise.sample(&mut rng));
    }
    Matrix::new(data, n, 2).unwrap()
}

fn flow_config() -> FlowConfig {
    FlowConfig {
        dim: 2,
        architecture: FlowArchitecture::MaskedAutoregressive,
        transformer: TransformerKind::RationalQuadraticSpline {
            knots: 6,
            interval: 4.0,
        },
        flow_layers: 2,
        nn_width: 16,
        seed: 9,
        ..FlowConfig::default()
    }
}

#[test]
fn smoke_fit_save_reload() {
    let tmp = tempdir().expect("tempdir");
    let base = tmp.path();
    let device = Device::Cpu;

    let data_path = base.join("data.csv");
    write_matrix(&data_path, &correlated_rows(400)).unwrap();
    let x = load_matrix(&data_path).unwrap();
    assert_eq!((x.rows(), x.cols()), (400, 2));

    let config = flow_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let flow = build_flow(&config, Box::new(StandardNormal::new(2, &device)), vb).unwrap();

    let train_config = TrainConfig {
        max_epochs: 30,
        learning_rate: 1e-2,
        batch_size: 64,
        show_progress: false,
        ..TrainConfig::default()
    };
    let losses = fit_to_data(&flow, &varmap, &x, None, &train_config, &device).unwrap();
    assert!(!losses.val.is_empty());
    let best = losses.val[losses.best_epoch().unwrap()];
    assert!(best < losses.val[0] || losses.val.len() == 1);
    assert!(losses.to_csv().starts_with("epoch,train_loss,val_loss\n"));

    // The fitted flow prefers the correlated direction.
    let points = Tensor::new(&[[1.0f32, 1.0], [1.0, -1.0]], &device).unwrap();
    let lp: Vec<f32> = flow.log_prob(&points, None).unwrap().to_vec1().unwrap();
    assert!(lp[0] > lp[1], "{lp:?}");

    // Save, rebuild from config and reload.
    let model_dir = base.join("model");
    fs::create_dir_all(&model_dir).unwrap();
    varmap.save(model_dir.join("model.safetensors")).unwrap();
    config.save(&model_dir.join("config.json")).unwrap();

    let reloaded_config = FlowConfig::load(&model_dir.join("config.json")).unwrap();
    assert_eq!(reloaded_config, config);
    let mut reloaded_vars = VarMap::new();
    let vb = VarBuilder::from_varmap(&reloaded_vars, DType::F32, &device);
    let reloaded = build_flow(&reloaded_config, Box::new(StandardNormal::new(2, &device)), vb).unwrap();
    reloaded_vars.load(model_dir.join("model.safetensors")).unwrap();

    let lp2: Vec<f32> = reloaded.log_prob(&points, None).unwrap().to_vec1().unwrap();
    for (a, b) in lp.iter().zip(&lp2) {
        assert!((a - b).abs() < 1e-5, "{a} vs {b}");
    }
}

#[test]
fn smoke_conditional_fit() {
    let device = Device::Cpu;
    let x = correlated_rows(200);
    // Condition on the first column.
    let cond: Vec<f32> = (0..x.rows()).map(|i| x.row(i)[0]).collect();
    let cond = Matrix::new(cond, x.rows(), 1).unwrap();

    let config = FlowConfig {
        cond_dim: Some(1),
        architecture: FlowArchitecture::Coupling,
        transformer: TransformerKind::Affine,
        ..flow_config()
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let flow = build_flow(&config, Box::new(StandardNormal::new(2, &device)), vb).unwrap();
    let train_config = TrainConfig {
        max_epochs: 5,
        learning_rate: 1e-2,
        batch_size: 32,
        show_progress: false,
        ..TrainConfig::default()
    };
    let losses = fit_to_data(&flow, &varmap, &x, Some(&cond), &train_config, &device).unwrap();
    assert!(losses.train.iter().all(|l| l.is_finite()));

    let bad_cond = Matrix::new(vec![0.0; 10], 10, 1).unwrap();
    assert!(fit_to_data(&flow, &varmap, &x, Some(&bad_cond), &train_config, &device).is_err());
}
