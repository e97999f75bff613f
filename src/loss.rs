//! Weighted denoising score-matching loss.
//!
//! Times are stratified: one uniform offset \(u_0\) per batch, then
//! \(u_i = (u_0 + i/N) \bmod 1\), mapped affinely into `[tmin, tmax]`
//! (Kingma et al., arXiv:2107.00630, App. I). The weighting is \(\lambda(t) = \sigma(t)^2\).

use std::collections::BTreeMap;

use ndarray::{Array1, Array3, ArrayView3, Axis};
use rand::Rng;

use crate::diffusion::DiffusionProcess;
use crate::model::ScoreModel;
use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::score::ScoreEvaluator;
use crate::Result;

/// Stable diagnostics key for the scalar loss.
pub const FLOW_LOSS: &str = "flow_loss";

/// Scalar diagnostics returned next to the loss, keyed by name.
pub type Monitors = BTreeMap<String, f32>;

/// Fixed-stride fractions `frac(u0 + i/n)` for `i in 0..n`.
pub fn stratified_fractions(u0: f32, n: usize) -> Array1<f32> {
    Array1::from_shape_fn(n, |i| {
        let u = u0 + i as f32 / n as f32;
        let f = u - u.floor();
        // f32 rounding can land exactly on 1.0
        if f >= 1.0 {
            0.0
        } else {
            f
        }
    })
}

/// Stratified per-example times in `[tmin, tmax]`, shaped `(n, 1, 1)`.
pub fn stratified_times<P: DiffusionProcess + ?Sized>(
    diffusion: &P,
    key: RngKey,
    n: usize,
) -> Array3<f32> {
    let u0: f32 = key.into_rng().random();
    let (tmin, tmax) = (diffusion.tmin(), diffusion.tmax());
    let u = stratified_fractions(u0, n);
    Array3::from_shape_fn((n, 1, 1), |(i, _, _)| u[i] * (tmax - tmin) + tmin)
}

/// Everything the gradient needs from one forward evaluation.
struct Forward {
    loss: f32,
    xt: Array3<f32>,
    t: Array3<f32>,
    whitened: Array3<f32>,
}

impl<M: ScoreModel, P: DiffusionProcess> ScoreEvaluator<M, P> {
    fn loss_forward(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
        params: &ParamSet,
    ) -> Result<Forward> {
        let diffusion = self.diffusion();
        let (key, key_time) = key.split();
        let t = stratified_times(diffusion, key_time, x.shape()[0]);
        let (_, key_noise) = key.split();

        let xt = diffusion.noise_input(x, &t.view(), key_noise)?;
        let target = diffusion.noise_score(&xt.view(), x, &t.view())?;
        let estimate = self.score(&xt.view(), &t.view(), cond, params, true)?;
        let error = estimate - target;
        let whitened = diffusion.covsqrt().inverse(&error.view())?;

        let mut total = 0.0f64;
        for (b, row) in whitened.axis_iter(Axis(0)).enumerate() {
            let sig = diffusion.sigma(t[[b, 0, 0]]);
            let w = (sig * sig) as f64;
            total += row.iter().map(|&e| (e as f64) * (e as f64) * w).sum::<f64>();
        }
        let loss = (total / whitened.len().max(1) as f64) as f32;
        Ok(Forward {
            loss,
            xt,
            t,
            whitened,
        })
    }

    /// `(loss, {"flow_loss": loss})` for one batch.
    pub fn loss(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
        params: &ParamSet,
    ) -> Result<(f32, Monitors)> {
        let fwd = self.loss_forward(key, x, cond, params)?;
        Ok((fwd.loss, monitors(fwd.loss)))
    }

    /// Loss, diagnostics and the gradient of the loss with respect to `params`.
    pub fn loss_and_grad(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        cond: Option<&ArrayView3<f32>>,
        params: &ParamSet,
    ) -> Result<(f32, Monitors, ParamSet)> {
        let fwd = self.loss_forward(key, x, cond, params)?;
        let diffusion = self.diffusion();

        // dL/dw = 2 w sigma^2 / N, then back through the (self-adjoint) whitening.
        let n = fwd.whitened.len().max(1) as f32;
        let mut dw = fwd.whitened;
        for (b, mut row) in dw.axis_iter_mut(Axis(0)).enumerate() {
            let sig = diffusion.sigma(fwd.t[[b, 0, 0]]);
            let k = 2.0 * sig * sig / n;
            row.mapv_inplace(|e| e * k);
        }
        let d_score = diffusion.covsqrt().inverse(&dw.view())?;
        let grads = self.score_pullback(
            &fwd.xt.view(),
            &fwd.t.view(),
            cond,
            params,
            true,
            &d_score.view(),
        )?;
        Ok((fwd.loss, monitors(fwd.loss), grads))
    }
}

fn monitors(loss: f32) -> Monitors {
    let mut m = Monitors::new();
    m.insert(FLOW_LOSS.to_string(), loss);
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::{DiagonalCov, VarianceExploding};
    use crate::linear::LinearScoreModel;
    use crate::mlp::MlpScoreModel;
    use ndarray::{Array, IxDyn};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn batch() -> Array3<f32> {
        Array::from_shape_fn((6, 3, 2), |(b, p, d)| ((b * 7 + p * 3 + d * 5) % 11) as f32 * 0.2 - 1.0)
    }

    #[test]
    fn loss_is_finite_nonnegative_and_keyed() {
        let ve = VarianceExploding::new(0.01, 10.0).unwrap();
        let ev = ScoreEvaluator::new(MlpScoreModel::new(8), ve, 0.6).unwrap();
        let x = batch();
        let params = ev
            .model()
            .init(RngKey::new(0), &x.view(), &Array1::zeros(6).view(), false, None)
            .unwrap();
        let (l, m) = ev.loss(RngKey::new(1), &x.view(), None, &params).unwrap();
        assert!(l.is_finite() && l >= 0.0);
        assert_eq!(m.get(FLOW_LOSS).copied(), Some(l));
    }

    #[test]
    fn same_key_gives_same_loss() {
        let ve = VarianceExploding::new(0.01, 10.0).unwrap();
        let ev = ScoreEvaluator::new(LinearScoreModel::default(), ve, 0.6).unwrap();
        let x = batch();
        let params = ev
            .model()
            .init(RngKey::new(0), &x.view(), &Array1::zeros(6).view(), false, None)
            .unwrap();
        let a = ev.loss(RngKey::new(9), &x.view(), None, &params).unwrap().0;
        let b = ev.loss(RngKey::new(9), &x.view(), None, &params).unwrap().0;
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn gradient_matches_finite_differences_with_diagonal_covariance() {
        let cov = DiagonalCov::new(Array1::from_vec(vec![0.5, 1.5])).unwrap();
        let ve = VarianceExploding::with_covariance(0.1, 3.0, Arc::new(cov)).unwrap();
        let ev = ScoreEvaluator::new(LinearScoreModel::default(), ve, 0.8).unwrap();
        let x = batch();
        let params = ev
            .model()
            .init(RngKey::new(2), &x.view(), &Array1::zeros(6).view(), false, None)
            .unwrap();
        let key = RngKey::new(4);
        let (_, _, grads) = ev.loss_and_grad(key.clone(), &x.view(), None, &params).unwrap();
        assert!(grads.same_structure(&params));

        let loss_at = |p: &ParamSet| ev.loss(key.clone(), &x.view(), None, p).unwrap().0 as f64;
        let w = params.require("linear/w").unwrap();
        let h = 1e-2f32;
        for idx in [[0usize, 0usize], [1, 1], [0, 3]] {
            let mut wp = w.clone();
            let mut wm = w.clone();
            wp[IxDyn(&idx)] += h;
            wm[IxDyn(&idx)] -= h;
            let mut pp = params.clone();
            let mut pm = params.clone();
            pp.insert("linear/w", wp);
            pm.insert("linear/w", wm);
            let fd = ((loss_at(&pp) - loss_at(&pm)) / (2.0 * h as f64)) as f32;
            let an = grads.require("linear/w").unwrap()[IxDyn(&idx)];
            assert!((fd - an).abs() < 1e-2 * (1.0 + an.abs()), "{idx:?}: fd={fd} an={an}");
        }
    }

    proptest! {
        #[test]
        fn prop_stratified_fractions_are_evenly_spread(u0 in 0.0f32..1.0, n in 1usize..64) {
            let mut u = stratified_fractions(u0, n).to_vec();
            prop_assert!(u.iter().all(|&v| (0.0..1.0).contains(&v)));
            u.sort_by(|a, b| a.total_cmp(b));
            for (i, &v) in u.iter().enumerate() {
                let rank = i as f32 / n as f32;
                prop_assert!((v - rank).abs() <= 1.0 / n as f32 + 1e-5, "i={} v={} n={}", i, v, n);
            }
        }

        #[test]
        fn prop_stratified_times_stay_in_range(seed in any::<u64>(), n in 1usize..32) {
            let ve = VarianceExploding::new(0.01, 10.0).unwrap();
            let t = stratified_times(&ve, RngKey::new(seed), n);
            prop_assert_eq!(t.shape(), &[n, 1, 1]);
            prop_assert!(t.iter().all(|&v| v >= ve.tmin && v <= ve.tmax));
        }
    }
}
