//! Score evaluation with EDM-style input/output scaling.
//!
//! With \(\sigma = \sigma(t)\), \(s = s(t)\) and the fixed training-data std \(\sigma_d\):
//! \[
//! c(t) = \frac{1}{\sqrt{\sigma^2 + s^2\sigma_d^2}},\qquad
//! \hat s_\theta(x, t; c) = c(t)\,F_\theta\!\left(c(t)\,x,\ t;\ c/\sigma_d\right).
//! \]
//! The input scale keeps the network's effective input magnitude near 1 across the whole
//! noise range (Karras et al., arXiv:2206.00364, \(c_{in}\)); the output is divided by the
//! same factor.
//!
//! Everything here is pure: the same `(x, t, cond, params)` always gives the same result, so
//! the evaluator can be shared between the gradient computation and the sampler.

use ndarray::{Array1, Array3, ArrayView3, Axis};

use crate::diffusion::{broadcast_time, check_time, DiffusionProcess};
use crate::model::ScoreModel;
use crate::params::ParamSet;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ScoreEvaluator<M, P> {
    model: M,
    diffusion: P,
    data_std: f32,
}

/// Network-side inputs for one evaluation.
struct ScaledInputs {
    x: Array3<f32>,
    t: Array1<f32>,
    cond: Option<Array3<f32>>,
    c: Vec<f32>,
}

impl<M: ScoreModel, P: DiffusionProcess> ScoreEvaluator<M, P> {
    /// `data_std` is captured once from the training data and never changes afterwards.
    pub fn new(model: M, diffusion: P, data_std: f32) -> Result<Self> {
        if !data_std.is_finite() || data_std < 0.0 {
            return Err(Error::Domain("data_std must be finite and nonnegative"));
        }
        Ok(Self {
            model,
            diffusion,
            data_std,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn diffusion(&self) -> &P {
        &self.diffusion
    }

    pub fn data_std(&self) -> f32 {
        self.data_std
    }

    /// \(c(t) = 1/\sqrt{\sigma(t)^2 + (s(t)\sigma_d)^2}\).
    pub fn input_scale(&self, t: f32) -> f32 {
        let sig = self.diffusion.sigma(t);
        let s = self.diffusion.scale(t) * self.data_std;
        1.0 / (sig * sig + s * s).sqrt()
    }

    fn scaled_inputs(
        &self,
        x: &ArrayView3<f32>,
        t: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<ScaledInputs> {
        check_time(x, t)?;
        let t_flat: Array1<f32> = t.iter().copied().collect();
        let c: Vec<f32> = t_flat.iter().map(|&tb| self.input_scale(tb)).collect();
        let mut x_in = x.to_owned();
        for (b, mut row) in x_in.axis_iter_mut(Axis(0)).enumerate() {
            let cb = c[b];
            row.mapv_inplace(|v| v * cb);
        }
        // A zero data std leaves nothing to normalize by; conditioning passes through unchanged.
        let cond = cond.map(|cv| {
            if self.data_std > 0.0 {
                cv.mapv(|v| v / self.data_std)
            } else {
                cv.to_owned()
            }
        });
        Ok(ScaledInputs {
            x: x_in,
            t: t_flat,
            cond,
            c,
        })
    }

    /// Scaled score estimate, same shape as `x`. `t` is `(batch, 1, 1)`.
    pub fn score(
        &self,
        x: &ArrayView3<f32>,
        t: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
        params: &ParamSet,
        train: bool,
    ) -> Result<Array3<f32>> {
        let inp = self.scaled_inputs(x, t, cond)?;
        let mut out = self.model.apply(
            params,
            &inp.x.view(),
            &inp.t.view(),
            train,
            inp.cond.as_ref().map(|c| c.view()).as_ref(),
        )?;
        if out.shape() != x.shape() {
            return Err(Error::ShapeMismatch {
                what: "model output vs input",
                expected: x.shape().to_vec(),
                found: out.shape().to_vec(),
            });
        }
        for (b, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let cb = inp.c[b];
            row.mapv_inplace(|v| v * cb);
        }
        Ok(out)
    }

    /// Parameter gradient of \(\langle v, \hat s_\theta(x, t; c)\rangle\) for a cotangent `v`
    /// shaped like the score.
    pub fn score_pullback(
        &self,
        x: &ArrayView3<f32>,
        t: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
        params: &ParamSet,
        train: bool,
        cotangent: &ArrayView3<f32>,
    ) -> Result<ParamSet> {
        let inp = self.scaled_inputs(x, t, cond)?;
        // output scaling is per example, so it moves onto the cotangent
        let mut v = cotangent.to_owned();
        for (b, mut row) in v.axis_iter_mut(Axis(0)).enumerate() {
            let cb = inp.c[b];
            row.mapv_inplace(|g| g * cb);
        }
        self.model.pullback(
            params,
            &inp.x.view(),
            &inp.t.view(),
            train,
            inp.cond.as_ref().map(|c| c.view()).as_ref(),
            &v.view(),
        )
    }

    /// Bind `params` and `cond` into a score function for an integrator.
    pub fn bind<'a, 'c: 'a>(
        &'a self,
        params: &'a ParamSet,
        cond: Option<ArrayView3<'c, f32>>,
    ) -> BoundScore<'a, M, P> {
        BoundScore {
            evaluator: self,
            params,
            cond: cond.map(|c| c.reborrow()),
        }
    }
}

/// Diffusion time as handed to a score function: either one scalar for the whole batch
/// (what fixed-step integrators produce) or an explicit `(batch, 1, 1)` tensor.
#[derive(Debug, Clone)]
pub enum Time {
    Scalar(f32),
    PerExample(Array3<f32>),
}

impl Time {
    /// Coerce to the `(batch, 1, 1)` layout.
    pub fn into_batch(self, batch: usize) -> Result<Array3<f32>> {
        match self {
            Time::Scalar(t) => Ok(broadcast_time(t, batch)),
            Time::PerExample(t) => {
                if t.shape() != [batch, 1, 1] {
                    return Err(Error::ShapeMismatch {
                        what: "per-example time",
                        expected: vec![batch, 1, 1],
                        found: t.shape().to_vec(),
                    });
                }
                Ok(t)
            }
        }
    }
}

impl From<f32> for Time {
    fn from(t: f32) -> Self {
        Time::Scalar(t)
    }
}

impl From<Array3<f32>> for Time {
    fn from(t: Array3<f32>) -> Self {
        Time::PerExample(t)
    }
}

/// A score function \(s(x, t)\) with everything else already bound.
pub trait ScoreFn {
    fn score(&self, x: &ArrayView3<f32>, t: Time) -> Result<Array3<f32>>;
}

/// Evaluator + fixed parameters + fixed conditioning.
#[derive(Debug, Clone)]
pub struct BoundScore<'a, M, P> {
    evaluator: &'a ScoreEvaluator<M, P>,
    params: &'a ParamSet,
    cond: Option<ArrayView3<'a, f32>>,
}

impl<M: ScoreModel, P: DiffusionProcess> ScoreFn for BoundScore<'_, M, P> {
    fn score(&self, x: &ArrayView3<f32>, t: Time) -> Result<Array3<f32>> {
        let t = t.into_batch(x.shape()[0])?;
        self.evaluator
            .score(x, &t.view(), self.cond.as_ref(), self.params, false)
    }
}

/// Adapter for plain closures `(x, t_batch) -> score`.
pub struct FnScore<F>(pub F);

impl<F> ScoreFn for FnScore<F>
where
    F: Fn(&ArrayView3<f32>, &ArrayView3<f32>) -> Result<Array3<f32>>,
{
    fn score(&self, x: &ArrayView3<f32>, t: Time) -> Result<Array3<f32>> {
        let t = t.into_batch(x.shape()[0])?;
        (self.0)(x, &t.view())
    }
}

impl<S: ScoreFn + ?Sized> ScoreFn for &S {
    fn score(&self, x: &ArrayView3<f32>, t: Time) -> Result<Array3<f32>> {
        (**self).score(x, t)
    }
}
