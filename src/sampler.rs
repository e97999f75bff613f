//! Sampling entry points over a trained [`ScoreEvaluator`].
//!
//! A [`Sampler`] binds `(params, cond)` into a score closure and hands it to the integrators in
//! `sde`. It never mutates the evaluator or the parameters.

use ndarray::{Array1, Array3, ArrayView3};
use tracing::info;

use crate::diffusion::DiffusionProcess;
use crate::event::{EventConstraint, EventScore};
use crate::model::ScoreModel;
use crate::nll::{compute_nll, NllOptions};
use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::score::ScoreEvaluator;
use crate::sde::{probability_flow_sample, reverse_sde_sample, OdeMethod, SdeSample};
use crate::{Error, Result};

/// Default event-score regularization.
pub const EVENT_REG: f32 = 1e-3;

#[derive(Debug)]
pub struct Sampler<'a, M, P> {
    evaluator: &'a ScoreEvaluator<M, P>,
    nsteps: usize,
}

impl<'a, M: ScoreModel, P: DiffusionProcess> Sampler<'a, M, P> {
    pub fn new(evaluator: &'a ScoreEvaluator<M, P>, nsteps: usize) -> Result<Self> {
        if nsteps == 0 {
            return Err(Error::Domain("nsteps must be >= 1"));
        }
        Ok(Self { evaluator, nsteps })
    }

    fn check_cond(shape: (usize, usize, usize), cond: Option<&ArrayView3<f32>>) -> Result<()> {
        if let Some(c) = cond {
            if c.shape()[..2] != [shape.0, shape.1] {
                return Err(Error::ShapeMismatch {
                    what: "conditioning vs sample shape",
                    expected: vec![shape.0, shape.1],
                    found: c.shape()[..2].to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Reverse-SDE sample of `shape`, integrating from `horizon` down to `tmin`.
    pub fn sample(
        &self,
        key: RngKey,
        horizon: f32,
        cond: Option<ArrayView3<'_, f32>>,
        shape: (usize, usize, usize),
        params: &ParamSet,
        keep_path: bool,
    ) -> Result<SdeSample> {
        Self::check_cond(shape, cond.as_ref())?;
        let score = self.evaluator.bind(params, cond);
        reverse_sde_sample(
            self.evaluator.diffusion(),
            &score,
            key,
            shape,
            horizon,
            self.nsteps,
            keep_path,
        )
    }

    /// Like [`Sampler::sample`], with the score corrected toward `constraint`.
    pub fn sample_event_conditioned<C: EventConstraint + ?Sized>(
        &self,
        key: RngKey,
        horizon: f32,
        cond: Option<ArrayView3<'_, f32>>,
        shape: (usize, usize, usize),
        params: &ParamSet,
        constraint: &C,
        reg: f32,
    ) -> Result<SdeSample> {
        Self::check_cond(shape, cond.as_ref())?;
        info!(rows = constraint.dim(), reg, "event-conditioned sampling");
        let diffusion = self.evaluator.diffusion();
        let score = EventScore::new(diffusion, self.evaluator.bind(params, cond), constraint, reg)?;
        reverse_sde_sample(diffusion, &score, key, shape, horizon, self.nsteps, false)
    }

    /// Deterministic sample through the probability-flow ODE; only the prior draw uses `key`.
    pub fn sample_probability_flow(
        &self,
        key: RngKey,
        horizon: f32,
        cond: Option<ArrayView3<'_, f32>>,
        shape: (usize, usize, usize),
        params: &ParamSet,
        method: OdeMethod,
    ) -> Result<Array3<f32>> {
        Self::check_cond(shape, cond.as_ref())?;
        let score = self.evaluator.bind(params, cond);
        probability_flow_sample(self.evaluator.diffusion(), &score, key, shape, horizon, self.nsteps, method)
    }

    /// Per-example NLL of `x` in nats (unconditioned).
    pub fn compute_nll(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        params: &ParamSet,
        probes: usize,
    ) -> Result<Array1<f32>> {
        let score = self.evaluator.bind(params, None);
        let opts = NllOptions {
            nsteps: self.nsteps,
            probes,
            ..NllOptions::default()
        };
        compute_nll(self.evaluator.diffusion(), &score, key, x, opts)
    }
}
