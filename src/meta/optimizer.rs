//! Meta-optimizer: windowed dual-branch forward pass, losses and Adam updates.

use std::cell::RefCell;

use burn::module::AutodiffModule;
use burn::optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor,
};
use rand::{rngs::StdRng, SeedableRng};

use super::channels::{self, Channels};
use super::config::{MetaObjective, MetaOptimizerConfig};
use super::error::{MetaError, Result};
use super::interfaces::{ContextAggregator, Predictor, TaskParams};
use super::logging::MetricLogger;
use super::loss::{check_loss_shape, LossFunction};
use super::mode::ModeFlag;
use super::windowing::WindowPlan;

/// Output of one windowed forward pass.
///
/// `x_*`, `z_*` and `preds_*` of the same branch are aligned row by row with
/// the plan's windows.
#[derive(Debug, Clone)]
pub struct MetaForward<B: Backend> {
    pub plan: WindowPlan,
    /// Full aggregated context
    pub z: Channels<B>,
    pub x_train: Channels<B>,
    pub x_nexttoken: Channels<B>,
    pub z_train: Channels<B>,
    pub z_nexttoken: Channels<B>,
    pub preds_train: Channels<B>,
    pub preds_nexttoken: Channels<B>,
}

impl<B: Backend> MetaForward<B> {
    fn empty(plan: WindowPlan) -> Self {
        Self {
            plan,
            z: Channels::new(),
            x_train: Channels::new(),
            x_nexttoken: Channels::new(),
            z_train: Channels::new(),
            z_nexttoken: Channels::new(),
            preds_train: Channels::new(),
            preds_nexttoken: Channels::new(),
        }
    }

    /// Windowed queries and contexts, predictions still empty.
    fn assemble(plan: WindowPlan, x: &Channels<B>, z: Channels<B>) -> Result<Self> {
        let x_train = plan.train_queries(x);
        let x_nexttoken = plan.next_token_queries(x);
        let z_train = plan.train_context(&z)?;
        let z_nexttoken = plan.next_token_context(&z)?;
        Ok(Self {
            plan,
            z,
            x_train,
            x_nexttoken,
            z_train,
            z_nexttoken,
            preds_train: Channels::new(),
            preds_nexttoken: Channels::new(),
        })
    }

    /// True when the batch had no usable windows.
    pub fn is_empty(&self) -> bool {
        self.plan.is_empty()
    }
}

/// Both branches computed with plain (inference) forward passes.
pub(crate) fn windowed_forward<IB, IA, IP>(
    aggregator: &IA,
    predictor: &IP,
    x: &Channels<IB>,
    plan: WindowPlan,
) -> Result<MetaForward<IB>>
where
    IB: Backend,
    IA: ContextAggregator<IB>,
    IP: Predictor<IB>,
{
    if plan.is_empty() {
        return Ok(MetaForward::empty(plan));
    }
    let z = aggregator.forward(x)?;
    let mut out = MetaForward::assemble(plan, x, z)?;
    out.preds_train = predictor.forward(&out.x_train, &out.z_train)?;
    out.preds_nexttoken = predictor.forward(&out.x_nexttoken, &out.z_nexttoken)?;
    Ok(out)
}

/// Runs the predictor on the inner backend: no autodiff graph, inference layers.
fn monitored<B, P>(predictor: &P, query: &Channels<B>, context: &Channels<B>) -> Result<Channels<B>>
where
    B: AutodiffBackend,
    P: AutodiffModule<B>,
    P::InnerModule: Predictor<B::InnerBackend>,
{
    let predictor = predictor.valid();
    let preds = predictor.forward(&channels::to_inner(query), &channels::to_inner(context))?;
    Ok(channels::from_inner(preds))
}

/// Adam optimizers of the two trainable modules (same learning rate).
pub struct MetaOptimizers<B, A, P>
where
    B: AutodiffBackend,
    A: AutodiffModule<B>,
    P: AutodiffModule<B>,
{
    aggregator: OptimizerAdaptor<Adam, A, B>,
    predictor: OptimizerAdaptor<Adam, P, B>,
}

/// Meta-optimizer wrapping a context aggregator and a predictor.
///
/// Each forward pass predicts two query sets from the aggregated context:
/// train queries (already-seen samples) and next-token queries (the first
/// unseen sample). Only the branch selected by the
/// [`MetaObjective`] is computed with gradients; the other one is evaluated in
/// inference form for monitoring.
pub struct MetaOptimizer<B, A, P, L>
where
    B: AutodiffBackend,
    A: AutodiffModule<B> + ContextAggregator<B>,
    P: AutodiffModule<B> + Predictor<B>,
    L: LossFunction,
{
    pub aggregator: A,
    pub predictor: P,
    pub(crate) loss: L,
    pub(crate) config: MetaOptimizerConfig,
    pub(crate) mode: ModeFlag,
    pub(crate) rng: RefCell<StdRng>,
    pub(crate) logger: RefCell<Option<Box<dyn MetricLogger>>>,
    pub(crate) device: B::Device,
}

impl<B, A, P, L> MetaOptimizer<B, A, P, L>
where
    B: AutodiffBackend,
    A: AutodiffModule<B> + ContextAggregator<B>,
    A::InnerModule: ContextAggregator<B::InnerBackend>,
    P: AutodiffModule<B> + Predictor<B>,
    P::InnerModule: Predictor<B::InnerBackend>,
    L: LossFunction,
{
    pub fn new(
        config: MetaOptimizerConfig,
        aggregator: A,
        predictor: P,
        loss: L,
        device: &B::Device,
    ) -> Result<Self> {
        config.validate()?;
        if aggregator.convention() != config.convention {
            return Err(MetaError::InvalidConfig(format!(
                "aggregator lays out context as {:?}, optimizer is configured for {:?}",
                aggregator.convention(),
                config.convention
            )));
        }
        tracing::info!(
            objective = %config.meta_objective,
            convention = ?config.convention,
            min_train_samples = config.min_train_samples,
            lr = config.lr,
            "meta-optimizer initialized"
        );
        Ok(Self {
            aggregator,
            predictor,
            loss,
            rng: RefCell::new(StdRng::seed_from_u64(config.seed)),
            config,
            mode: ModeFlag::new(true),
            logger: RefCell::new(None),
            device: device.clone(),
        })
    }

    pub fn with_logger(self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger.replace(Some(logger));
        self
    }

    pub fn set_logger(&mut self, logger: Option<Box<dyn MetricLogger>>) {
        self.logger.replace(logger);
    }

    pub fn has_logger(&self) -> bool {
        self.logger.borrow().is_some()
    }

    pub fn config(&self) -> &MetaOptimizerConfig {
        &self.config
    }

    pub fn objective(&self) -> MetaObjective {
        self.config.meta_objective
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn mode(&self) -> &ModeFlag {
        &self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode.is_training()
    }

    /// Switches between training and evaluation mode.
    pub fn train(&self, training: bool) {
        self.mode.set(training);
    }

    pub(crate) fn emit<F: FnOnce(&mut dyn MetricLogger)>(&self, f: F) {
        if let Some(logger) = self.logger.borrow_mut().as_mut() {
            f(logger.as_mut());
        }
    }

    /// Windowed dual-branch forward pass.
    ///
    /// In training mode the branch of the active objective is computed with
    /// gradients first; the other one runs afterwards inside an evaluation
    /// scope on the inner backend. In evaluation mode both branches run in
    /// inference form. The mode flag is restored before returning.
    pub fn forward(&self, x: &Channels<B>) -> Result<MetaForward<B>> {
        let x = channels::in_distribution(x);
        let [samples, _] = channels::extents(&x)?;
        let plan = WindowPlan::draw(
            self.config.convention,
            samples,
            self.config.min_train_samples,
            &mut *self.rng.borrow_mut(),
        )?;
        if plan.is_empty() {
            tracing::debug!(samples, "batch too short for any window");
            return Ok(MetaForward::empty(plan));
        }

        if !self.mode.is_training() {
            let aggregator = self.aggregator.valid();
            let predictor = self.predictor.valid();
            let out = windowed_forward(&aggregator, &predictor, &channels::to_inner(&x), plan)?;
            return Ok(lift(out));
        }

        let z = self.aggregator.forward(&x)?;
        let mut out = MetaForward::assemble(plan, &x, z)?;
        match self.config.meta_objective {
            MetaObjective::Train => {
                out.preds_train = self.predictor.forward(&out.x_train, &out.z_train)?;
                let _eval = self.mode.eval_scope();
                out.preds_nexttoken = monitored(&self.predictor, &out.x_nexttoken, &out.z_nexttoken)?;
            }
            MetaObjective::Prequential => {
                out.preds_nexttoken = self.predictor.forward(&out.x_nexttoken, &out.z_nexttoken)?;
                let _eval = self.mode.eval_scope();
                out.preds_train = monitored(&self.predictor, &out.x_train, &out.z_train)?;
            }
        }
        Ok(out)
    }

    /// Loss per `[sample, task]`, shape-checked against the target.
    pub fn loss_function(&self, target: &Channels<B>, preds: &Channels<B>) -> Result<Tensor<B, 2>> {
        per_sample_loss(&self.loss, target, preds)
    }

    /// Computes and logs both branch losses; returns the one to optimize.
    ///
    /// Task parameters are accepted for auxiliary objectives and are not used
    /// by the base losses.
    pub fn losses_and_metrics(
        &self,
        out: &MetaForward<B>,
        _task_params: Option<&TaskParams>,
    ) -> Result<Tensor<B, 1>> {
        let mode = self.mode.prefix();
        let [_, num_tasks] = channels::extents(&out.x_train)?;

        let loss_train = self.loss_function(&out.x_train, &out.preds_train)?.mean();
        let loss_nexttoken = self.loss_function(&out.x_nexttoken, &out.preds_nexttoken)?.mean();

        let train_value = channels::scalar(loss_train.clone());
        let nexttoken_value = channels::scalar(loss_nexttoken.clone());
        tracing::debug!(mode, loss_train = train_value, loss_nexttoken = nexttoken_value, "step losses");
        self.emit(|logger| {
            logger.log_metric(&format!("{}/loss_train", mode), train_value, num_tasks);
            logger.log_metric(&format!("{}/loss_nexttoken", mode), nexttoken_value, num_tasks);
        });

        Ok(match self.config.meta_objective {
            MetaObjective::Train => loss_train,
            MetaObjective::Prequential => loss_nexttoken,
        })
    }

    /// Loss to optimize for one batch, or `None` if no window fits.
    pub fn training_step(
        &self,
        x: &Channels<B>,
        task_params: Option<&TaskParams>,
    ) -> Result<Option<Tensor<B, 1>>> {
        let out = self.forward(x)?;
        if out.is_empty() {
            return Ok(None);
        }
        self.losses_and_metrics(&out, task_params).map(Some)
    }

    /// Logs validation losses for one batch.
    pub fn validation_step(&self, x: &Channels<B>, task_params: Option<&TaskParams>) -> Result<()> {
        let _eval = self.mode.eval_scope();
        let out = self.forward(x)?;
        if !out.is_empty() {
            self.losses_and_metrics(&out, task_params)?;
        }
        Ok(())
    }

    /// Adam optimizers over the aggregator and predictor parameters.
    pub fn configure_optimizers(&self) -> MetaOptimizers<B, A, P> {
        MetaOptimizers {
            aggregator: AdamConfig::new().init(),
            predictor: AdamConfig::new().init(),
        }
    }

    /// Training step, backward pass and Adam update.
    ///
    /// Returns the optimized loss value, or `None` if the batch had no usable
    /// windows.
    pub fn optimize_step(
        &mut self,
        optimizers: &mut MetaOptimizers<B, A, P>,
        x: &Channels<B>,
        task_params: Option<&TaskParams>,
    ) -> Result<Option<f64>> {
        let Some(loss) = self.training_step(x, task_params)? else {
            return Ok(None);
        };
        let value = channels::scalar(loss.clone());
        if !value.is_finite() {
            return Err(MetaError::NonFiniteLoss(value));
        }

        let mut grads = loss.backward();
        let aggregator_grads = GradientsParams::from_module(&mut grads, &self.aggregator);
        let predictor_grads = GradientsParams::from_module(&mut grads, &self.predictor);
        self.aggregator = optimizers
            .aggregator
            .step(self.config.lr, self.aggregator.clone(), aggregator_grads);
        self.predictor = optimizers
            .predictor
            .step(self.config.lr, self.predictor.clone(), predictor_grads);
        Ok(Some(value))
    }
}

pub(crate) fn per_sample_loss<BB: Backend, L: LossFunction>(
    loss: &L,
    target: &Channels<BB>,
    preds: &Channels<BB>,
) -> Result<Tensor<BB, 2>> {
    let extents = channels::extents(target)?;
    let values = loss.per_sample(target, preds)?;
    check_loss_shape(&values, extents)?;
    Ok(values)
}

fn lift<B: AutodiffBackend>(out: MetaForward<B::InnerBackend>) -> MetaForward<B> {
    MetaForward {
        plan: out.plan,
        z: channels::from_inner(out.z),
        x_train: channels::from_inner(out.x_train),
        x_nexttoken: channels::from_inner(out.x_nexttoken),
        z_train: channels::from_inner(out.z_train),
        z_nexttoken: channels::from_inner(out.z_nexttoken),
        preds_train: channels::from_inner(out.preds_train),
        preds_nexttoken: channels::from_inner(out.preds_nexttoken),
    }
}
