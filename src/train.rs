//! The training engine.
//!
//! [`ScoreTrainer`] owns the root key, the raw and EMA parameters and the optimizer state.
//! Its lifecycle is
//!
//! ```text
//! Uninitialized --setup(Fit)--> Ready --configure_optimizers()--> Stepping
//! ```
//!
//! and `training_step` is only legal in `Stepping`. The numerical work lives in the pure
//! [`ScoreTrainer::step`], which takes and returns the whole state bundle; `training_step`
//! stores the returned bundle back into the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array3, ArrayView3};
use tracing::{debug, info};

use crate::config::{CkptMonitor, TrainConfig};
use crate::diffusion::DiffusionProcess;
use crate::event::EventConstraint;
use crate::loss::Monitors;
use crate::metrics::relative_error;
use crate::model::ScoreModel;
use crate::optim::{apply_updates, AnyOptimizer, Optimizer};
use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::sampler::Sampler;
use crate::score::ScoreEvaluator;
use crate::sde::SdeSample;
use crate::{Error, Result};

/// Lifecycle stage requested by the surrounding loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fit,
    Validate,
    Predict,
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fit" => Ok(Stage::Fit),
            "validate" | "val" => Ok(Stage::Validate),
            "predict" => Ok(Stage::Predict),
            other => Err(Error::UnknownStage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Stepping,
}

/// Derives conditioning from a batch; `None` means unconditioned.
pub type CondFn = Box<dyn Fn(&ArrayView3<f32>) -> Option<Array3<f32>> + Send + Sync>;

/// Result of the pure training step.
#[derive(Debug, Clone)]
pub struct StepOutput<S> {
    pub loss: f32,
    pub monitors: Monitors,
    pub params: ParamSet,
    pub params_ema: ParamSet,
    pub opt_state: S,
}

/// What `training_step` reports for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainStepOutput {
    pub loss: f32,
    pub loss_ema: f32,
    pub monitors: Monitors,
    pub monitors_ema: Monitors,
}

/// `ema + (p - ema) / ema_ts`, element-wise.
pub fn ema_update(params: &ParamSet, params_ema: &ParamSet, ema_ts: f32) -> Result<ParamSet> {
    params_ema.zip_map(params, |ema, p| ema + (p - ema) / ema_ts)
}

/// Population std over every element of every batch.
pub fn train_data_std<'a>(batches: impl IntoIterator<Item = ArrayView3<'a, f32>>) -> Result<f32> {
    let (mut n, mut sum, mut sq) = (0usize, 0.0f64, 0.0f64);
    for b in batches {
        for &v in b.iter() {
            n += 1;
            sum += v as f64;
            sq += (v as f64) * (v as f64);
        }
    }
    if n == 0 {
        return Err(Error::Domain("no training data to estimate data std from"));
    }
    let mean = sum / n as f64;
    Ok(((sq / n as f64 - mean * mean).max(0.0)).sqrt() as f32)
}

struct Slots<S> {
    params: ParamSet,
    params_ema: ParamSet,
    opt_state: Option<S>,
}

pub struct ScoreTrainer<M, P, O: Optimizer> {
    cfg: TrainConfig,
    key: RngKey,
    evaluator: ScoreEvaluator<M, P>,
    optimizer: O,
    cond_fn: Option<CondFn>,
    predict_event: Option<(Box<dyn EventConstraint>, f32)>,
    x_shape: (usize, usize, usize),
    ema_ts: f32,
    slots: Option<Slots<O::State>>,
    global_step: u64,
    sanity_checking: bool,
}

impl<M, P, O> fmt::Debug for ScoreTrainer<M, P, O>
where
    M: fmt::Debug,
    P: fmt::Debug,
    O: Optimizer + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoreTrainer")
            .field("evaluator", &self.evaluator)
            .field("optimizer", &self.optimizer)
            .field("x_shape", &self.x_shape)
            .field("ema_ts", &self.ema_ts)
            .field("global_step", &self.global_step)
            .finish_non_exhaustive()
    }
}

impl<M: ScoreModel, P: DiffusionProcess> ScoreTrainer<M, P, AnyOptimizer> {
    /// Build with the optimizer named in `cfg`.
    pub fn from_config(
        cfg: TrainConfig,
        model: M,
        diffusion: P,
        x_shape: (usize, usize, usize),
        data_std: f32,
    ) -> Result<Self> {
        let optimizer = cfg.build_optimizer()?;
        Self::new(cfg, model, diffusion, optimizer, x_shape, data_std)
    }
}

impl<M: ScoreModel, P: DiffusionProcess, O: Optimizer> ScoreTrainer<M, P, O> {
    /// `x_shape` is the shape of the first training batch; its `(T, D)` tail is the event shape
    /// every later batch must match.
    pub fn new(
        cfg: TrainConfig,
        model: M,
        diffusion: P,
        optimizer: O,
        x_shape: (usize, usize, usize),
        data_std: f32,
    ) -> Result<Self> {
        cfg.validate()?;
        if x_shape.0 == 0 || x_shape.1 == 0 || x_shape.2 == 0 {
            return Err(Error::Domain("batch shape must be non-empty"));
        }
        let evaluator = ScoreEvaluator::new(model, diffusion, data_std)?;
        Ok(Self {
            key: RngKey::new(cfg.seed),
            ema_ts: cfg.ema_ts(),
            cfg,
            evaluator,
            optimizer,
            cond_fn: None,
            predict_event: None,
            x_shape,
            slots: None,
            global_step: 0,
            sanity_checking: false,
        })
    }

    pub fn with_cond_fn(mut self, cond_fn: CondFn) -> Self {
        self.cond_fn = Some(cond_fn);
        self
    }

    /// Make `predict_step` sample with an event-corrected score.
    pub fn with_predict_event(mut self, constraint: Box<dyn EventConstraint>, reg: f32) -> Self {
        self.predict_event = Some((constraint, reg));
        self
    }

    pub fn state(&self) -> EngineState {
        match &self.slots {
            None => EngineState::Uninitialized,
            Some(s) if s.opt_state.is_none() => EngineState::Ready,
            Some(_) => EngineState::Stepping,
        }
    }

    pub fn evaluator(&self) -> &ScoreEvaluator<M, P> {
        &self.evaluator
    }

    pub fn config(&self) -> &TrainConfig {
        &self.cfg
    }

    pub fn ema_ts(&self) -> f32 {
        self.ema_ts
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn event_shape(&self) -> (usize, usize) {
        (self.x_shape.1, self.x_shape.2)
    }

    pub fn set_sanity_checking(&mut self, on: bool) {
        self.sanity_checking = on;
    }

    pub fn params(&self) -> Option<&ParamSet> {
        self.slots.as_ref().map(|s| &s.params)
    }

    pub fn params_ema(&self) -> Option<&ParamSet> {
        self.slots.as_ref().map(|s| &s.params_ema)
    }

    pub fn opt_state(&self) -> Option<&O::State> {
        self.slots.as_ref().and_then(|s| s.opt_state.as_ref())
    }

    fn slots(&self) -> Result<&Slots<O::State>> {
        self.slots
            .as_ref()
            .ok_or(Error::Lifecycle("setup(fit) or load_params must run first"))
    }

    /// Split the root key; the parent is replaced by its first child.
    fn next_key(&mut self) -> RngKey {
        let root = std::mem::replace(&mut self.key, RngKey::new(0));
        let (root, sub) = root.split();
        self.key = root;
        sub
    }

    fn cond_for(&self, batch: &ArrayView3<f32>) -> Option<Array3<f32>> {
        self.cond_fn.as_ref().and_then(|f| f(batch))
    }

    fn check_batch(&self, batch: &ArrayView3<f32>) -> Result<()> {
        let (_, len, d) = batch.dim();
        if (len, d) != self.event_shape() {
            return Err(Error::ShapeMismatch {
                what: "batch event shape vs setup",
                expected: vec![self.x_shape.1, self.x_shape.2],
                found: vec![len, d],
            });
        }
        Ok(())
    }

    /// `Fit` initializes parameters from a ones-valued batch (once). `Validate` and
    /// `Predict` need no preparation.
    pub fn setup(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Fit if self.slots.is_none() => {
                let key = self.next_key();
                let x = Array3::<f32>::ones(self.x_shape);
                let t = Array1::<f32>::ones(self.x_shape.0);
                let cond = self.cond_for(&x.view());
                let params = self.evaluator.model().init(
                    key,
                    &x.view(),
                    &t.view(),
                    false,
                    cond.as_ref().map(|c| c.view()).as_ref(),
                )?;
                info!(
                    leaves = params.len(),
                    num_params = params.num_params(),
                    ema_ts = self.ema_ts,
                    "initialized parameters"
                );
                self.slots = Some(Slots {
                    params_ema: params.clone(),
                    params,
                    opt_state: None,
                });
            }
            Stage::Fit => debug!("setup(fit): parameters already initialized"),
            Stage::Validate | Stage::Predict => {}
        }
        Ok(())
    }

    /// String form of [`ScoreTrainer::setup`]; unknown names fail with `UnknownStage`.
    pub fn setup_stage(&mut self, stage: &str) -> Result<()> {
        self.setup(stage.parse()?)
    }

    /// Install externally loaded parameters (e.g. from a checkpoint pair).
    pub fn load_params(&mut self, params: ParamSet, params_ema: ParamSet) -> Result<()> {
        if !params.same_structure(&params_ema) {
            return Err(Error::Structure("raw and EMA parameters differ in structure".to_string()));
        }
        self.slots = Some(Slots {
            params,
            params_ema,
            opt_state: None,
        });
        Ok(())
    }

    pub fn configure_optimizers(&mut self) -> Result<()> {
        let optimizer = &self.optimizer;
        let slots = self
            .slots
            .as_mut()
            .ok_or(Error::Lifecycle("configure_optimizers before setup(fit)"))?;
        slots.opt_state = Some(optimizer.init(&slots.params));
        info!(learning_rate = self.cfg.learning_rate, optimizer = ?self.cfg.optimizer, "configured optimizer");
        Ok(())
    }

    /// One functional update: gradient step on `params`, EMA update on `params_ema`.
    pub fn step(
        &self,
        key: RngKey,
        batch: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
        params: &ParamSet,
        params_ema: &ParamSet,
        opt_state: O::State,
    ) -> Result<StepOutput<O::State>> {
        let (loss, monitors, grads) = self.evaluator.loss_and_grad(key, batch, cond, params)?;
        let (updates, opt_state) = self.optimizer.update(&grads, opt_state)?;
        let params = apply_updates(params, &updates)?;
        let params_ema = ema_update(&params, params_ema, self.ema_ts)?;
        Ok(StepOutput {
            loss,
            monitors,
            params,
            params_ema,
            opt_state,
        })
    }

    pub fn training_step(&mut self, batch: &ArrayView3<f32>) -> Result<TrainStepOutput> {
        self.check_batch(batch)?;
        if self.state() != EngineState::Stepping {
            return Err(Error::Lifecycle("configure_optimizers must run before training_step"));
        }
        let cond = self.cond_for(batch);
        let cond_view = cond.as_ref().map(|c| c.view());
        let key_train = self.next_key();

        let slots = self.slots()?;
        let opt_state = slots
            .opt_state
            .clone()
            .ok_or(Error::Lifecycle("optimizer state missing"))?;
        let out = self.step(
            key_train.clone(),
            batch,
            cond_view.as_ref(),
            &slots.params,
            &slots.params_ema,
            opt_state,
        )?;
        // same key: identical time and noise draw for the EMA loss
        let (loss_ema, monitors_ema) =
            self.evaluator
                .loss(key_train, batch, cond_view.as_ref(), &out.params_ema)?;

        self.slots = Some(Slots {
            params: out.params,
            params_ema: out.params_ema,
            opt_state: Some(out.opt_state),
        });
        self.global_step += 1;
        debug!(step = self.global_step, loss = out.loss, loss_ema, "training step");
        Ok(TrainStepOutput {
            loss: out.loss,
            loss_ema,
            monitors: out.monitors,
            monitors_ema,
        })
    }

    /// Validation scalar (`loss_val`).
    ///
    /// With [`CkptMonitor::ValRelativeErrorEma`] this samples the EMA model and reports the mean
    /// relative error against the batch. Otherwise it passes the monitored metric through from
    /// `callback_metrics`, or `-1` while sanity checking.
    pub fn validation_step(
        &mut self,
        batch: &ArrayView3<f32>,
        callback_metrics: &BTreeMap<String, f32>,
    ) -> Result<f32> {
        let key_val = self.next_key();
        if self.cfg.ckpt_monitor == CkptMonitor::ValRelativeErrorEma {
            self.check_batch(batch)?;
            let cond = self.cond_for(batch);
            let samples = self.sample(key_val, 1.0, cond.as_ref().map(|c| c.view()), batch.dim(), None, false)?;
            let err = relative_error(batch, &samples.sample.view())?;
            return Ok(err.mean().unwrap_or(f32::NAN));
        }
        if self.sanity_checking {
            return Ok(-1.0);
        }
        let name = self.cfg.ckpt_monitor.metric_name();
        callback_metrics
            .get(name)
            .copied()
            .ok_or(Error::Lifecycle("monitored metric has not been logged yet"))
    }

    /// EMA sample of `shape`, event-conditioned when a predict constraint is installed.
    ///
    /// The key stream only advances once `shape` has been accepted.
    pub fn predict_step(&mut self, shape: (usize, usize, usize)) -> Result<Array3<f32>> {
        self.slots()?;
        if (shape.1, shape.2) != self.event_shape() {
            return Err(Error::ShapeMismatch {
                what: "predict shape vs setup",
                expected: vec![self.x_shape.1, self.x_shape.2],
                found: vec![shape.1, shape.2],
            });
        }
        let key_pred = self.next_key();
        let slots = self.slots()?;
        let sampler = Sampler::new(&self.evaluator, self.cfg.time_step_count_sampling)?;
        let out = match &self.predict_event {
            Some((constraint, reg)) => sampler.sample_event_conditioned(
                key_pred,
                1.0,
                None,
                shape,
                &slots.params_ema,
                constraint.as_ref(),
                *reg,
            )?,
            None => sampler.sample(key_pred, 1.0, None, shape, &slots.params_ema, false)?,
        };
        Ok(out.sample)
    }

    /// Reverse-SDE sample; `params` defaults to the EMA set.
    pub fn sample(
        &self,
        key: RngKey,
        horizon: f32,
        cond: Option<ArrayView3<'_, f32>>,
        shape: (usize, usize, usize),
        params: Option<&ParamSet>,
        keep_path: bool,
    ) -> Result<SdeSample> {
        let params = match params {
            Some(p) => p,
            None => &self.slots()?.params_ema,
        };
        Sampler::new(&self.evaluator, self.cfg.time_step_count_sampling)?
            .sample(key, horizon, cond, shape, params, keep_path)
    }

    /// Per-example NLL in nats; `params` defaults to the EMA set.
    pub fn compute_nll(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        params: Option<&ParamSet>,
    ) -> Result<Array1<f32>> {
        let params = match params {
            Some(p) => p,
            None => &self.slots()?.params_ema,
        };
        Sampler::new(&self.evaluator, self.cfg.time_step_count_sampling)?
            .compute_nll(key, x, params, self.cfg.nll_probes)
    }
}
