use meta_icl_rs::meta::reference::{
    LinearRegressionTasksConfig, MlpPredictorConfig, RunningMeanAggregatorConfig,
};
use meta_icl_rs::meta::{DataModule, JsonLinesLogger, MetaError, MetaOptimizer, RegressionLoss, TaskDataset};
use meta_icl_rs::{CpuAutodiffBackend, Settings};
use rand::{rngs::StdRng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), MetaError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::new()?;
    let config = settings.optimizer_config()?;
    let run = &settings.run;
    let seed = config.seed;
    tracing::info!(objective = %config.meta_objective, epochs = run.epochs, "meta-icl starting");

    let device = Default::default();
    let tasks = LinearRegressionTasksConfig::new(run.train_tasks)
        .with_n_samples(run.n_samples)
        .with_noise_std(run.noise_std)
        .with_ood(true);
    let train = tasks.clone().with_seed(seed).init()?;
    let mut val = tasks.with_seed(seed + 1);
    val.n_tasks = run.val_tasks;
    let val = val.init()?;
    let mut data = DataModule::new(train, val);

    let aggregator = RunningMeanAggregatorConfig::new(1, 1, run.z_dim)
        .with_convention(config.convention)
        .init::<CpuAutodiffBackend>(&device);
    let predictor = MlpPredictorConfig::new(1, run.z_dim, 1)
        .with_hidden_dim(run.hidden_dim)
        .with_dropout(0.1)
        .init::<CpuAutodiffBackend>(&device);
    let logger = JsonLinesLogger::create(&run.metrics_path)?;

    let mut optimizer = MetaOptimizer::new(config, aggregator, predictor, RegressionLoss::default(), &device)?
        .with_logger(Box::new(logger));
    let mut optimizers = optimizer.configure_optimizers();
    let mut rng = StdRng::seed_from_u64(seed);

    for epoch in 0..run.epochs {
        optimizer.train(true);
        let (mut total, mut steps) = (0.0, 0usize);
        for batch in data.train.batches(run.batch_size, &mut rng) {
            let x = batch.to_channels(&device);
            if let Some(loss) = optimizer.optimize_step(&mut optimizers, &x, batch.task_params.as_ref())? {
                total += loss;
                steps += 1;
            }
        }
        for batch in data.val.batches(run.batch_size, &mut rng) {
            optimizer.validation_step(&batch.to_channels(&device), batch.task_params.as_ref())?;
        }
        tracing::info!(epoch, loss = total / steps.max(1) as f64, steps, "epoch finished");
    }

    optimizer.on_train_end(&mut data)?;
    tracing::info!(path = %run.metrics_path.display(), "metrics written");
    Ok(())
}
