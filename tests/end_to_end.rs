// tests/end_to_end.rs - short training runs on the synthetic regression tasks
use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use meta_icl_rs::meta::{
    reference::{LinearRegressionTasksConfig, MlpPredictorConfig, RunningMeanAggregatorConfig},
    ContextConvention, DataModule, JsonLinesLogger, MetaObjective, MetaOptimizer,
    MetaOptimizerConfig, RegressionLoss, TaskDataset,
};
use meta_icl_rs::Settings;
use rand::{rngs::StdRng, SeedableRng};

type TestBackend = Autodiff<NdArray<f32>>;

fn run(objective: MetaObjective, convention: ContextConvention, path: &std::path::Path) -> Vec<f64> {
    let device = Default::default();
    let tasks = LinearRegressionTasksConfig::new(16).with_n_samples(12).with_ood(true);
    let mut data = DataModule::new(
        tasks.clone().with_seed(10).init().unwrap(),
        tasks.with_seed(11).init().unwrap(),
    );

    let aggregator = RunningMeanAggregatorConfig::new(1, 1, 8)
        .with_convention(convention)
        .init::<TestBackend>(&device);
    let predictor = MlpPredictorConfig::new(1, 8, 1)
        .with_hidden_dim(16)
        .with_dropout(0.1)
        .init::<TestBackend>(&device);
    let config = MetaOptimizerConfig::new(objective)
        .with_convention(convention)
        .with_min_train_samples(2)
        .with_lr(5e-3);
    let mut optimizer = MetaOptimizer::new(config, aggregator, predictor, RegressionLoss::default(), &device)
        .unwrap()
        .with_logger(Box::new(JsonLinesLogger::create(path).unwrap()));
    let mut optimizers = optimizer.configure_optimizers();
    let mut rng = StdRng::seed_from_u64(0);

    let mut losses = Vec::new();
    for _ in 0..3 {
        optimizer.train(true);
        for batch in data.train.batches(8, &mut rng) {
            let x = batch.to_channels(&device);
            if let Some(loss) = optimizer
                .optimize_step(&mut optimizers, &x, batch.task_params.as_ref())
                .unwrap()
            {
                losses.push(loss);
            }
        }
        for batch in data.val.batches(8, &mut rng) {
            optimizer
                .validation_step(&batch.to_channels(&device), batch.task_params.as_ref())
                .unwrap();
        }
    }
    optimizer.on_train_end(&mut data).unwrap();
    assert!(optimizer.is_training());
    losses
}

fn read_events(path: &std::path::Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_training_runs_write_json_lines() {
    let dir = std::env::temp_dir().join(format!("meta-icl-e2e-{}", std::process::id()));
    for (objective, convention) in [
        (MetaObjective::Train, ContextConvention::Standard),
        (MetaObjective::Prequential, ContextConvention::Implicit),
        (MetaObjective::Prequential, ContextConvention::ExplicitContext),
    ] {
        let path = dir.join(format!("{}-{:?}.jsonl", objective, convention));
        let losses = run(objective, convention, &path);
        assert_eq!(losses.len(), 3 * 2);
        assert!(losses.iter().all(|l| l.is_finite()));

        let events = read_events(&path);
        let metric_keys: Vec<&str> = events
            .iter()
            .filter(|e| e["type"] == "metric")
            .filter_map(|e| e["key"].as_str())
            .collect();
        assert!(metric_keys.contains(&"train_tasks/loss_train"));
        assert!(metric_keys.contains(&"val_tasks/loss_nexttoken"));
        assert!(events
            .iter()
            .any(|e| e["type"] == "row" && e["values"].get("val_tasks/n_sample_loss_ood").is_some()));
        assert!(events
            .iter()
            .any(|e| e["type"] == "table" && e["key"] == "tables/train_tasks-model_vs_true-model"));
        assert!(events
            .iter()
            .any(|e| e["type"] == "figure" && e["key"] == "probes/val_tasks-model_vs_true"));
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_settings_drive_the_optimizer_config() {
    let mut settings = Settings::default();
    settings.optimizer.meta_objective = "prequential".to_string();
    settings.optimizer.convention = ContextConvention::ExplicitContext;
    settings.optimizer.min_train_samples = 4;

    let config = settings.optimizer_config().unwrap();
    assert_eq!(config.meta_objective, MetaObjective::Prequential);
    assert_eq!(config.convention, ContextConvention::ExplicitContext);
    assert_eq!(config.min_train_samples, 4);
}
