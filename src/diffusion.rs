//! Diffusion processes (noise schedules) for score-based training.
//!
//! A process is a linear SDE
//! \[
//! dx = a(t)\,x\,dt + g(t)\,\Sigma^{1/2} dW
//! \]
//! with marginals \(x_t \mid x_0 \sim \mathcal N(s(t)\,x_0,\ \sigma(t)^2\Sigma)\).
//! The training core only sees `sigma`, `scale`, `noise_input`, `noise_score` and the
//! whitening operator; the integrators in `sde` also use `drift` and `g2`.
//!
//! Shapes: data is `(batch, T, D)`, per-example time is `(batch, 1, 1)`.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array1, Array3, ArrayView3, Axis, Zip};
use rand_distr::{Distribution, StandardNormal};

use crate::rng::RngKey;
use crate::{Error, Result};

/// A symmetric square root \(\Sigma^{1/2}\) of the noise covariance.
///
/// Implementations must be self-adjoint: the loss gradient and the event-score solve use
/// `inverse` in place of the adjoint of `inverse`.
pub trait CovarianceSqrt: fmt::Debug + Send + Sync {
    /// \(\Sigma^{1/2} x\), applied per example.
    fn apply(&self, x: &ArrayView3<f32>) -> Result<Array3<f32>>;
    /// \(\Sigma^{-1/2} x\), applied per example.
    fn inverse(&self, x: &ArrayView3<f32>) -> Result<Array3<f32>>;
    /// \(\log\lvert\det \Sigma^{1/2}\rvert\) for one example of event shape `(T, D)`.
    fn log_det(&self, event: (usize, usize)) -> f32;
}

/// \(\Sigma = I\).
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl CovarianceSqrt for Identity {
    fn apply(&self, x: &ArrayView3<f32>) -> Result<Array3<f32>> {
        Ok(x.to_owned())
    }

    fn inverse(&self, x: &ArrayView3<f32>) -> Result<Array3<f32>> {
        Ok(x.to_owned())
    }

    fn log_det(&self, _event: (usize, usize)) -> f32 {
        0.0
    }
}

/// Diagonal covariance with one standard deviation per feature (last axis).
#[derive(Debug, Clone)]
pub struct DiagonalCov {
    std: Array1<f32>,
}

impl DiagonalCov {
    pub fn new(std: Array1<f32>) -> Result<Self> {
        if std.is_empty() {
            return Err(Error::Domain("diagonal covariance needs at least one feature"));
        }
        if std.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(Error::Domain("diagonal std entries must be positive and finite"));
        }
        Ok(Self { std })
    }

    fn check(&self, x: &ArrayView3<f32>) -> Result<()> {
        let d = x.shape()[2];
        if d != self.std.len() {
            return Err(Error::ShapeMismatch {
                what: "feature axis of diagonal covariance",
                expected: vec![self.std.len()],
                found: vec![d],
            });
        }
        Ok(())
    }
}

impl CovarianceSqrt for DiagonalCov {
    fn apply(&self, x: &ArrayView3<f32>) -> Result<Array3<f32>> {
        self.check(x)?;
        Ok(x * &self.std)
    }

    fn inverse(&self, x: &ArrayView3<f32>) -> Result<Array3<f32>> {
        self.check(x)?;
        Ok(x / &self.std)
    }

    fn log_det(&self, event: (usize, usize)) -> f32 {
        let per_row: f32 = self.std.iter().map(|s| s.ln()).sum();
        per_row * event.0 as f32
    }
}

/// Scalar schedule plus forward noising operators.
pub trait DiffusionProcess: fmt::Debug + Send + Sync {
    fn tmin(&self) -> f32;
    fn tmax(&self) -> f32;
    /// Marginal noise level \(\sigma(t)\).
    fn sigma(&self, t: f32) -> f32;
    /// Marginal mean scale \(s(t)\).
    fn scale(&self, t: f32) -> f32;
    /// Linear drift coefficient \(a(t)\) with \(f(x,t) = a(t)\,x\).
    fn drift_coeff(&self, t: f32) -> f32;
    /// Squared diffusion coefficient \(g(t)^2\).
    fn g2(&self, t: f32) -> f32;
    /// Whitening operator \(\Sigma^{1/2}\).
    fn covsqrt(&self) -> &dyn CovarianceSqrt;

    /// Forward drift \(f(x, t)\).
    fn drift(&self, x: &ArrayView3<f32>, t: f32) -> Array3<f32> {
        let a = self.drift_coeff(t);
        x.mapv(|v| a * v)
    }

    /// Sample \(x_t = s(t)\,x + \sigma(t)\,\Sigma^{1/2} z\).
    fn noise_input(
        &self,
        x: &ArrayView3<f32>,
        t: &ArrayView3<f32>,
        key: RngKey,
    ) -> Result<Array3<f32>> {
        check_time(x, t)?;
        let mut rng = key.into_rng();
        let z: Array3<f32> =
            Array3::from_shape_simple_fn(x.raw_dim(), || StandardNormal.sample(&mut rng));
        let cz = self.covsqrt().apply(&z.view())?;
        let mut xt = Array3::<f32>::zeros(x.raw_dim());
        for (b, mut row) in xt.axis_iter_mut(Axis(0)).enumerate() {
            let tb = t[[b, 0, 0]];
            let (s, sig) = (self.scale(tb), self.sigma(tb));
            Zip::from(&mut row)
                .and(&x.index_axis(Axis(0), b))
                .and(&cz.index_axis(Axis(0), b))
                .for_each(|o, &xv, &zv| *o = s * xv + sig * zv);
        }
        Ok(xt)
    }

    /// Analytic score of the Gaussian transition kernel:
    /// \(-\Sigma^{-1}(x_t - s(t)x)/\sigma(t)^2\).
    fn noise_score(
        &self,
        xt: &ArrayView3<f32>,
        x: &ArrayView3<f32>,
        t: &ArrayView3<f32>,
    ) -> Result<Array3<f32>> {
        check_time(x, t)?;
        if xt.shape() != x.shape() {
            return Err(Error::ShapeMismatch {
                what: "noised sample vs data",
                expected: x.shape().to_vec(),
                found: xt.shape().to_vec(),
            });
        }
        let mut resid = xt.to_owned();
        for (b, mut row) in resid.axis_iter_mut(Axis(0)).enumerate() {
            let s = self.scale(t[[b, 0, 0]]);
            Zip::from(&mut row)
                .and(&x.index_axis(Axis(0), b))
                .for_each(|r, &xv| *r -= s * xv);
        }
        let cov = self.covsqrt();
        let mut score = cov.inverse(&cov.inverse(&resid.view())?.view())?;
        for (b, mut row) in score.axis_iter_mut(Axis(0)).enumerate() {
            let sig = self.sigma(t[[b, 0, 0]]);
            let k = -1.0 / (sig * sig);
            row.mapv_inplace(|v| v * k);
        }
        Ok(score)
    }

    /// Draw from the (zero-mean) marginal at time `t`: \(\sigma(t)\,\Sigma^{1/2} z\).
    fn prior_sample(&self, key: RngKey, shape: (usize, usize, usize), t: f32) -> Result<Array3<f32>> {
        let mut rng = key.into_rng();
        let z: Array3<f32> = Array3::from_shape_simple_fn(shape, || StandardNormal.sample(&mut rng));
        let sig = self.sigma(t);
        Ok(self.covsqrt().apply(&z.view())?.mapv(|v| v * sig))
    }
}

/// Broadcast a scalar time to the `(batch, 1, 1)` layout.
pub fn broadcast_time(t: f32, batch: usize) -> Array3<f32> {
    Array3::from_elem((batch, 1, 1), t)
}

/// `t` must be `(batch, 1, 1)` with the same batch as `x`.
pub fn check_time(x: &ArrayView3<f32>, t: &ArrayView3<f32>) -> Result<()> {
    let b = x.shape()[0];
    if t.shape() != [b, 1, 1] {
        return Err(Error::ShapeMismatch {
            what: "diffusion time",
            expected: vec![b, 1, 1],
            found: t.shape().to_vec(),
        });
    }
    Ok(())
}

/// Variance-exploding SDE: \(\sigma(t) = \sigma_{min}(\sigma_{max}/\sigma_{min})^t\), \(s(t)=1\).
#[derive(Debug, Clone)]
pub struct VarianceExploding {
    pub sigma_min: f32,
    pub sigma_max: f32,
    pub tmin: f32,
    pub tmax: f32,
    cov: Arc<dyn CovarianceSqrt>,
}

impl VarianceExploding {
    pub fn new(sigma_min: f32, sigma_max: f32) -> Result<Self> {
        Self::with_covariance(sigma_min, sigma_max, Arc::new(Identity))
    }

    pub fn with_covariance(
        sigma_min: f32,
        sigma_max: f32,
        cov: Arc<dyn CovarianceSqrt>,
    ) -> Result<Self> {
        if !(sigma_min > 0.0) || !sigma_min.is_finite() || !sigma_max.is_finite() {
            return Err(Error::Domain("sigma_min must be positive and sigma_max finite"));
        }
        if sigma_max <= sigma_min {
            return Err(Error::Domain("sigma_max must exceed sigma_min"));
        }
        Ok(Self {
            sigma_min,
            sigma_max,
            tmin: 1e-3,
            tmax: 1.0,
            cov,
        })
    }

    fn log_ratio(&self) -> f32 {
        (self.sigma_max / self.sigma_min).ln()
    }
}

impl DiffusionProcess for VarianceExploding {
    fn tmin(&self) -> f32 {
        self.tmin
    }
    fn tmax(&self) -> f32 {
        self.tmax
    }
    fn sigma(&self, t: f32) -> f32 {
        self.sigma_min * (self.log_ratio() * t).exp()
    }
    fn scale(&self, _t: f32) -> f32 {
        1.0
    }
    fn drift_coeff(&self, _t: f32) -> f32 {
        0.0
    }
    fn g2(&self, t: f32) -> f32 {
        let s = self.sigma(t);
        2.0 * self.log_ratio() * s * s
    }
    fn covsqrt(&self) -> &dyn CovarianceSqrt {
        self.cov.as_ref()
    }
}

/// Variance-preserving SDE with linear \(\beta(t)\):
/// \(s(t) = e^{-\frac12\int_0^t\beta}\), \(\sigma(t) = \sqrt{1 - s(t)^2}\).
#[derive(Debug, Clone)]
pub struct VariancePreserving {
    pub beta_min: f32,
    pub beta_max: f32,
    pub tmin: f32,
    pub tmax: f32,
    cov: Arc<dyn CovarianceSqrt>,
}

impl VariancePreserving {
    pub fn new(beta_min: f32, beta_max: f32) -> Result<Self> {
        Self::with_covariance(beta_min, beta_max, Arc::new(Identity))
    }

    pub fn with_covariance(
        beta_min: f32,
        beta_max: f32,
        cov: Arc<dyn CovarianceSqrt>,
    ) -> Result<Self> {
        if !(beta_min > 0.0) || !beta_max.is_finite() || beta_max < beta_min {
            return Err(Error::Domain("need 0 < beta_min <= beta_max < inf"));
        }
        Ok(Self {
            beta_min,
            beta_max,
            tmin: 1e-3,
            tmax: 1.0,
            cov,
        })
    }

    fn beta(&self, t: f32) -> f32 {
        self.beta_min + t * (self.beta_max - self.beta_min)
    }

    fn int_beta(&self, t: f32) -> f32 {
        self.beta_min * t + 0.5 * (self.beta_max - self.beta_min) * t * t
    }
}

impl DiffusionProcess for VariancePreserving {
    fn tmin(&self) -> f32 {
        self.tmin
    }
    fn tmax(&self) -> f32 {
        self.tmax
    }
    fn sigma(&self, t: f32) -> f32 {
        // 1 - exp(-B) without cancellation near t = 0
        (-(-self.int_beta(t)).exp_m1()).sqrt()
    }
    fn scale(&self, t: f32) -> f32 {
        (-0.5 * self.int_beta(t)).exp()
    }
    fn drift_coeff(&self, t: f32) -> f32 {
        -0.5 * self.beta(t)
    }
    fn g2(&self, t: f32) -> f32 {
        self.beta(t)
    }
    fn covsqrt(&self) -> &dyn CovarianceSqrt {
        self.cov.as_ref()
    }
}
