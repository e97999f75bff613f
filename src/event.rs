//! Event-conditioned scores.
//!
//! Given a constraint \(C(x_0) = 0\) on the clean trajectory, the plain score is corrected by a
//! regularized projection through the Tweedie estimate
//! \(\hat x_0 = (x_t + \sigma^2\Sigma s)/s(t)\):
//! \[
//! \tilde s = s - \tfrac{1}{s(t)} J^\top\lambda,\qquad
//! \Big(r I + \tfrac{\sigma^2}{s(t)^2} J\Sigma J^\top\Big)\lambda = C(\hat x_0),
//! \]
//! with \(J = \partial C/\partial x_0\) at \(\hat x_0\). The system is symmetric positive definite
//! per example and is solved matrix-free with conjugate gradients.

use std::fmt;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::diffusion::DiffusionProcess;
use crate::score::{ScoreFn, Time};
use crate::{Error, Result};

/// A per-example constraint \(C: \mathbb R^{T\times D} \to \mathbb R^m\) with its linearization.
pub trait EventConstraint: fmt::Debug + Send + Sync {
    /// Constraint rows per example (`m`).
    fn dim(&self) -> usize;
    /// \(C(x)\), shape `(batch, m)`.
    fn residual(&self, x: &ArrayView3<f32>) -> Result<Array2<f32>>;
    /// \(J(x)\,v\), shape `(batch, m)`.
    fn jvp(&self, x: &ArrayView3<f32>, v: &ArrayView3<f32>) -> Result<Array2<f32>>;
    /// \(J(x)^\top\lambda\), shape of `x`.
    fn vjp(&self, x: &ArrayView3<f32>, lambda: &ArrayView2<f32>) -> Result<Array3<f32>>;
}

/// The trajectory passes through fixed values: \(x_{t_k, d_k} = v_k\).
#[derive(Debug, Clone)]
pub struct PinnedValues {
    points: Vec<(usize, usize, f32)>,
}

impl PinnedValues {
    /// `(time index, feature index, value)` triples.
    pub fn new(points: Vec<(usize, usize, f32)>) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::Domain("at least one pinned value is required"));
        }
        if points.iter().any(|p| !p.2.is_finite()) {
            return Err(Error::Domain("pinned values must be finite"));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(usize, usize, f32)] {
        &self.points
    }

    fn check(&self, x: &ArrayView3<f32>) -> Result<()> {
        let (_, len, d) = x.dim();
        match self.points.iter().find(|&&(t, f, _)| t >= len || f >= d) {
            Some(&(t, f, _)) => Err(Error::ShapeMismatch {
                what: "pinned index outside event shape",
                expected: vec![len, d],
                found: vec![t, f],
            }),
            None => Ok(()),
        }
    }
}

impl EventConstraint for PinnedValues {
    fn dim(&self) -> usize {
        self.points.len()
    }

    fn residual(&self, x: &ArrayView3<f32>) -> Result<Array2<f32>> {
        self.check(x)?;
        Ok(Array2::from_shape_fn((x.shape()[0], self.points.len()), |(b, k)| {
            let (t, f, v) = self.points[k];
            x[[b, t, f]] - v
        }))
    }

    fn jvp(&self, x: &ArrayView3<f32>, v: &ArrayView3<f32>) -> Result<Array2<f32>> {
        self.check(x)?;
        Ok(Array2::from_shape_fn((v.shape()[0], self.points.len()), |(b, k)| {
            let (t, f, _) = self.points[k];
            v[[b, t, f]]
        }))
    }

    fn vjp(&self, x: &ArrayView3<f32>, lambda: &ArrayView2<f32>) -> Result<Array3<f32>> {
        self.check(x)?;
        let mut out = Array3::<f32>::zeros(x.raw_dim());
        for b in 0..x.shape()[0] {
            for (k, &(t, f, _)) in self.points.iter().enumerate() {
                out[[b, t, f]] += lambda[[b, k]];
            }
        }
        Ok(out)
    }
}

/// Row-wise dot products of two `(batch, m)` arrays.
fn row_dots(a: &Array2<f32>, b: &Array2<f32>) -> Vec<f32> {
    a.axis_iter(Axis(0))
        .zip(b.axis_iter(Axis(0)))
        .map(|(x, y)| x.dot(&y))
        .collect()
}

/// Batched conjugate gradients for a block-diagonal SPD operator `op`, one block per row.
pub(crate) fn conjugate_gradient(
    op: impl Fn(&Array2<f32>) -> Result<Array2<f32>>,
    rhs: &Array2<f32>,
    max_iters: usize,
    tol: f32,
) -> Result<Array2<f32>> {
    let mut x = Array2::<f32>::zeros(rhs.raw_dim());
    let mut r = rhs.clone();
    let mut p = r.clone();
    let mut rs = row_dots(&r, &r);
    let tol2: Vec<f32> = row_dots(rhs, rhs)
        .iter()
        .map(|&n| (tol * tol * n).max(f32::MIN_POSITIVE))
        .collect();
    for _ in 0..max_iters {
        if rs.iter().zip(&tol2).all(|(&a, &b)| a <= b) {
            break;
        }
        let ap = op(&p)?;
        let pap = row_dots(&p, &ap);
        for b in 0..rhs.nrows() {
            if rs[b] <= tol2[b] || pap[b] <= 0.0 {
                continue;
            }
            let alpha = rs[b] / pap[b];
            x.row_mut(b).scaled_add(alpha, &p.row(b));
            r.row_mut(b).scaled_add(-alpha, &ap.row(b));
        }
        let rs_new = row_dots(&r, &r);
        for b in 0..rhs.nrows() {
            if rs[b] <= tol2[b] || pap[b] <= 0.0 {
                continue;
            }
            let beta = rs_new[b] / rs[b];
            let rb = r.row(b).to_owned();
            let mut pb = p.row_mut(b);
            pb.mapv_inplace(|v| v * beta);
            pb += &rb;
        }
        rs = rs_new;
    }
    Ok(x)
}

/// A score corrected toward an event constraint.
pub struct EventScore<'a, P: ?Sized, S, C: ?Sized> {
    diffusion: &'a P,
    score: S,
    constraint: &'a C,
    reg: f32,
    max_iters: usize,
    tol: f32,
}

impl<'a, P, S, C> EventScore<'a, P, S, C>
where
    P: DiffusionProcess + ?Sized,
    S: ScoreFn,
    C: EventConstraint + ?Sized,
{
    pub fn new(diffusion: &'a P, score: S, constraint: &'a C, reg: f32) -> Result<Self> {
        if !reg.is_finite() || reg <= 0.0 {
            return Err(Error::Domain("event regularization must be positive and finite"));
        }
        Ok(Self {
            diffusion,
            score,
            constraint,
            reg,
            max_iters: 4 * constraint.dim().max(1),
            tol: 1e-6,
        })
    }

    pub fn with_solver(mut self, max_iters: usize, tol: f32) -> Self {
        self.max_iters = max_iters.max(1);
        self.tol = tol;
        self
    }
}

impl<P: ?Sized, S, C: ?Sized> fmt::Debug for EventScore<'_, P, S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventScore")
            .field("reg", &self.reg)
            .field("max_iters", &self.max_iters)
            .field("tol", &self.tol)
            .finish_non_exhaustive()
    }
}

impl<P, S, C> ScoreFn for EventScore<'_, P, S, C>
where
    P: DiffusionProcess + ?Sized,
    S: ScoreFn,
    C: EventConstraint + ?Sized,
{
    fn score(&self, x: &ArrayView3<f32>, t: Time) -> Result<Array3<f32>> {
        let t = t.into_batch(x.shape()[0])?;
        let mut s = self.score.score(x, Time::PerExample(t.clone()))?;
        let cov = self.diffusion.covsqrt();
        let sig2: Vec<f32> = t.iter().map(|&tb| self.diffusion.sigma(tb).powi(2)).collect();
        let scale: Vec<f32> = t.iter().map(|&tb| self.diffusion.scale(tb)).collect();

        // Tweedie: x0_hat = (x + sigma^2 Σ s) / scale
        let cov_s = cov.apply(&cov.apply(&s.view())?.view())?;
        let mut x0_hat = x.to_owned();
        for (b, mut row) in x0_hat.axis_iter_mut(Axis(0)).enumerate() {
            Zip::from(&mut row)
                .and(&cov_s.index_axis(Axis(0), b))
                .for_each(|o, &cs| *o = (*o + sig2[b] * cs) / scale[b]);
        }

        let rhs = self.constraint.residual(&x0_hat.view())?;
        if rhs.ncols() != self.constraint.dim() {
            return Err(Error::ShapeMismatch {
                what: "constraint residual",
                expected: vec![x.shape()[0], self.constraint.dim()],
                found: rhs.shape().to_vec(),
            });
        }
        let x0v = x0_hat.view();
        let op = |v: &Array2<f32>| -> Result<Array2<f32>> {
            let jt = self.constraint.vjp(&x0v, &v.view())?;
            let sjt = cov.apply(&cov.apply(&jt.view())?.view())?;
            let mut out = self.constraint.jvp(&x0v, &sjt.view())?;
            for (b, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
                let k = sig2[b] / (scale[b] * scale[b]);
                Zip::from(&mut row)
                    .and(&v.row(b))
                    .for_each(|o, &vi| *o = k * *o + self.reg * vi);
            }
            Ok(out)
        };
        let lambda = conjugate_gradient(op, &rhs, self.max_iters, self.tol)?;

        let correction = self.constraint.vjp(&x0v, &lambda.view())?;
        for (b, mut row) in s.axis_iter_mut(Axis(0)).enumerate() {
            let k = 1.0 / scale[b];
            Zip::from(&mut row)
                .and(&correction.index_axis(Axis(0), b))
                .for_each(|o, &c| *o -= k * c);
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::{broadcast_time, VarianceExploding, VariancePreserving};
    use crate::score::FnScore;
    use ndarray::Array;

    fn zero_score() -> FnScore<impl Fn(&ArrayView3<f32>, &ArrayView3<f32>) -> Result<Array3<f32>>> {
        FnScore(|x: &ArrayView3<f32>, _t: &ArrayView3<f32>| Ok(Array3::zeros(x.raw_dim())))
    }

    #[test]
    fn pinned_values_residual_and_adjoint_agree() {
        let c = PinnedValues::new(vec![(0, 1, 2.0), (2, 0, -1.0)]).unwrap();
        let x = Array::from_shape_fn((2, 3, 2), |(b, t, d)| (b * 6 + t * 2 + d) as f32);
        let r = c.residual(&x.view()).unwrap();
        assert_eq!(r.row(1).to_vec(), vec![7.0 - 2.0, 10.0 + 1.0]);
        // <J v, l> == <v, J^T l>
        let v = x.mapv(|a| a * 0.5 - 1.0);
        let l = Array2::from_shape_vec((2, 2), vec![1.0, -2.0, 0.5, 3.0]).unwrap();
        let lhs = (&c.jvp(&x.view(), &v.view()).unwrap() * &l).sum();
        let rhs = (&c.vjp(&x.view(), &l.view()).unwrap() * &v).sum();
        assert!((lhs - rhs).abs() < 1e-5);
    }

    #[test]
    fn out_of_range_pin_is_a_shape_error() {
        let c = PinnedValues::new(vec![(5, 0, 1.0)]).unwrap();
        let x = Array3::<f32>::zeros((1, 3, 1));
        assert!(matches!(c.residual(&x.view()), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn conjugate_gradient_solves_diagonal_blocks() {
        let d = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 4.0, 0.5, 3.0, 9.0]).unwrap();
        let rhs = Array2::from_shape_vec((2, 3), vec![1.0, 1.0, 1.0, 2.0, -3.0, 0.0]).unwrap();
        let sol = conjugate_gradient(|v| Ok(v * &d), &rhs, 10, 1e-7).unwrap();
        for ((s, r), dd) in sol.iter().zip(rhs.iter()).zip(d.iter()) {
            assert!((s * dd - r).abs() < 1e-4);
        }
    }

    #[test]
    fn identity_cov_correction_has_closed_form() {
        // Pins are distinct coordinates, so J Σ J^T = I and lambda = C / (reg + sigma^2 / scale^2).
        let vp = VariancePreserving::new(0.1, 20.0).unwrap();
        let pins = PinnedValues::new(vec![(0, 0, 1.5), (1, 1, -0.5)]).unwrap();
        let reg = 1e-2;
        let es = EventScore::new(&vp, zero_score(), &pins, reg).unwrap();
        let x = Array::from_shape_fn((2, 2, 2), |(b, t, d)| (b + t + d) as f32 * 0.3);
        let t = 0.4f32;
        let out = es.score(&x.view(), Time::PerExample(broadcast_time(t, 2))).unwrap();

        let (sig, sc) = (vp.sigma(t), vp.scale(t));
        let denom = reg + sig * sig / (sc * sc);
        for b in 0..2 {
            for &(ti, di, v) in pins.points() {
                let r = x[[b, ti, di]] / sc - v;
                let expected = -(r / denom) / sc;
                assert!((out[[b, ti, di]] - expected).abs() < 1e-3 * (1.0 + expected.abs()));
            }
            // untouched coordinates keep the plain (zero) score
            assert_eq!(out[[b, 0, 1]], 0.0);
            assert_eq!(out[[b, 1, 0]], 0.0);
        }
    }

    #[test]
    fn nonpositive_regularization_is_rejected() {
        let ve = VarianceExploding::new(0.01, 5.0).unwrap();
        let pins = PinnedValues::new(vec![(0, 0, 0.0)]).unwrap();
        assert!(EventScore::new(&ve, zero_score(), &pins, 0.0).is_err());
    }
}
