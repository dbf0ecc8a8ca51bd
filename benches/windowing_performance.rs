use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use meta_icl_rs::meta::{
    reference::{LinearRegressionTasksConfig, MlpPredictorConfig, RunningMeanAggregatorConfig},
    ContextConvention, MetaObjective, MetaOptimizer, MetaOptimizerConfig, RegressionLoss,
    TaskDataset, WindowPlan,
};
use meta_icl_rs::CpuAutodiffBackend;
use rand::{rngs::StdRng, SeedableRng};

fn bench_window_draw(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_draw");
    group.measurement_time(Duration::from_secs(5));

    for samples in [64, 512, 4096] {
        for convention in [ContextConvention::Standard, ContextConvention::Implicit] {
            let mut rng = StdRng::seed_from_u64(42);
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", convention), samples),
                &samples,
                |b, &samples| {
                    b.iter(|| {
                        let plan = WindowPlan::draw(convention, black_box(samples), 4, &mut rng);
                        black_box(plan)
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_windowed_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("windowed_forward");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(30);

    let device = Default::default();
    for samples in [32, 128] {
        let tasks = LinearRegressionTasksConfig::new(16)
            .with_n_samples(samples)
            .init()
            .expect("valid task config");
        let batch = tasks.batches(16, &mut StdRng::seed_from_u64(0)).remove(0);
        let x = batch.to_channels::<CpuAutodiffBackend>(&device);

        for objective in [MetaObjective::Train, MetaObjective::Prequential] {
            let aggregator = RunningMeanAggregatorConfig::new(1, 1, 32).init::<CpuAutodiffBackend>(&device);
            let predictor = MlpPredictorConfig::new(1, 32, 1).init::<CpuAutodiffBackend>(&device);
            let optimizer = MetaOptimizer::new(
                MetaOptimizerConfig::new(objective),
                aggregator,
                predictor,
                RegressionLoss::default(),
                &device,
            )
            .expect("valid optimizer config");

            group.bench_with_input(BenchmarkId::new(objective.as_str(), samples), &x, |b, x| {
                b.iter(|| {
                    let loss = optimizer.training_step(black_box(x), None).expect("forward");
                    black_box(loss)
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_window_draw, bench_windowed_forward);
criterion_main!(benches);
