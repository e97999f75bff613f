//! Functional optimizers over [`ParamSet`]s.
//!
//! `update` takes the state by value and hands back a new one, so the training step stays a
//! pure function of its inputs. Updates are deltas to *add* to the parameters.

use serde::{Deserialize, Serialize};

use crate::params::ParamSet;
use crate::{Error, Result};

pub trait Optimizer {
    type State: Clone + std::fmt::Debug;

    fn init(&self, params: &ParamSet) -> Self::State;

    /// `(updates, new_state)` from gradients; the old state is consumed.
    fn update(&self, grads: &ParamSet, state: Self::State) -> Result<(ParamSet, Self::State)>;
}

/// `params + updates`, structure checked.
pub fn apply_updates(params: &ParamSet, updates: &ParamSet) -> Result<ParamSet> {
    params.scaled_add(1.0, updates)
}

/// Plain gradient descent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Result<Self> {
        check_lr(learning_rate)?;
        Ok(Self { learning_rate })
    }
}

impl Optimizer for Sgd {
    type State = ();

    fn init(&self, _params: &ParamSet) -> Self::State {}

    fn update(&self, grads: &ParamSet, state: ()) -> Result<(ParamSet, ())> {
        let lr = self.learning_rate;
        Ok((grads.map(|g| -lr * g), state))
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdamState {
    pub count: u32,
    pub mu: ParamSet,
    pub nu: ParamSet,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Result<Self> {
        check_lr(learning_rate)?;
        Ok(Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        })
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    type State = AdamState;

    fn init(&self, params: &ParamSet) -> AdamState {
        AdamState {
            count: 0,
            mu: params.zeros_like(),
            nu: params.zeros_like(),
        }
    }

    fn update(&self, grads: &ParamSet, state: AdamState) -> Result<(ParamSet, AdamState)> {
        let (b1, b2) = (self.beta1, self.beta2);
        let mu = state.mu.zip_map(grads, |m, g| b1 * m + (1.0 - b1) * g)?;
        let nu = state.nu.zip_map(grads, |v, g| b2 * v + (1.0 - b2) * g * g)?;
        let count = state.count.saturating_add(1);
        // powf keeps the exponent non-negative for counts past i32::MAX
        let c1 = 1.0 - b1.powf(count as f32);
        let c2 = 1.0 - b2.powf(count as f32);
        let (lr, eps) = (self.learning_rate, self.epsilon);
        let updates = mu.zip_map(&nu, |m, v| -lr * (m / c1) / ((v / c2).sqrt() + eps))?;
        Ok((updates, AdamState { count, mu, nu }))
    }
}

/// Runtime choice between the two optimizers (what [`crate::config::TrainConfig`] builds).
#[derive(Debug, Clone, Copy)]
pub enum AnyOptimizer {
    Sgd(Sgd),
    Adam(Adam),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnyState {
    Sgd,
    Adam(AdamState),
}

impl Optimizer for AnyOptimizer {
    type State = AnyState;

    fn init(&self, params: &ParamSet) -> AnyState {
        match self {
            AnyOptimizer::Sgd(_) => AnyState::Sgd,
            AnyOptimizer::Adam(a) => AnyState::Adam(a.init(params)),
        }
    }

    fn update(&self, grads: &ParamSet, state: AnyState) -> Result<(ParamSet, AnyState)> {
        match (self, state) {
            (AnyOptimizer::Sgd(s), AnyState::Sgd) => {
                let (u, ()) = s.update(grads, ())?;
                Ok((u, AnyState::Sgd))
            }
            (AnyOptimizer::Adam(a), AnyState::Adam(st)) => {
                let (u, st) = a.update(grads, st)?;
                Ok((u, AnyState::Adam(st)))
            }
            _ => Err(Error::Structure(
                "optimizer state does not belong to this optimizer".to_string(),
            )),
        }
    }
}

fn check_lr(lr: f32) -> Result<()> {
    if !lr.is_finite() || lr <= 0.0 {
        return Err(Error::Domain("learning rate must be positive and finite"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn ones(v: f32) -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("w", ArrayD::from_elem(IxDyn(&[3, 2]), v));
        p
    }

    #[test]
    fn sgd_steps_against_the_gradient() {
        let opt = Sgd::new(0.01).unwrap();
        let p = ones(1.0);
        let (u, ()) = opt.update(&ones(1.0), opt.init(&p)).unwrap();
        let p2 = apply_updates(&p, &u).unwrap();
        assert!(p2.get("w").unwrap().iter().all(|&v| (v - 0.99).abs() < 1e-7));
    }

    #[test]
    fn adam_first_step_has_magnitude_lr() {
        // With bias correction the first update is -lr * g/|g| (up to eps).
        let opt = Adam::new(1e-3).unwrap();
        let p = ones(0.0);
        let g = ones(-4.0);
        let (u, st) = opt.update(&g, opt.init(&p)).unwrap();
        assert_eq!(st.count, 1);
        assert!(u.get("w").unwrap().iter().all(|&v| (v - 1e-3).abs() < 1e-6));
    }

    #[test]
    fn adam_bias_correction_vanishes_for_huge_step_counts() {
        // Fully decayed betas: the update is -lr * m / sqrt(v) with m = 0.1 g, v = 0.001 g^2.
        let opt = Adam::new(1e-3).unwrap();
        let g = ones(-4.0);
        let expected = 1e-3 * 0.4 / 0.016f32.sqrt();
        for count in [i32::MAX as u32, u32::MAX - 1, u32::MAX] {
            let state = AdamState { count, ..opt.init(&ones(0.0)) };
            let (u, st) = opt.update(&g, state).unwrap();
            assert_eq!(st.count, count.saturating_add(1));
            for &v in u.get("w").unwrap().iter() {
                assert!((v - expected).abs() < 1e-5, "count={count}: {v} vs {expected}");
            }
        }
    }

    #[test]
    fn adam_rejects_mismatched_gradients() {
        let opt = Adam::new(1e-3).unwrap();
        let mut g = ones(1.0);
        g.insert("extra", ArrayD::zeros(IxDyn(&[1])));
        assert!(opt.update(&g, opt.init(&ones(0.0))).is_err());
    }

    #[test]
    fn any_optimizer_refuses_foreign_state() {
        let opt = AnyOptimizer::Sgd(Sgd::new(0.1).unwrap());
        let adam = Adam::new(0.1).unwrap();
        let foreign = AnyState::Adam(adam.init(&ones(0.0)));
        assert!(opt.update(&ones(1.0), foreign).is_err());
    }

    #[test]
    fn bad_learning_rate_is_rejected() {
        assert!(Sgd::new(0.0).is_err());
        assert!(Adam::new(f32::NAN).is_err());
    }
}
