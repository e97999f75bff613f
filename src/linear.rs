//! Per-position linear score model.
//!
//! This is intentionally a boring baseline: enough structure to exercise the training loop,
//! EMA, checkpointing and sampling without importing a full ML framework.
//!
//! \[
//! F_\theta(x, t; c)_{b,p} = W \cdot [x_{b,p};\ c_{b,p};\ \phi(t_b)],
//! \]
//!
//! where \(\phi\) is one of the [`TimeFeatures`] layouts (which includes the constant `1`, so
//! the bias lives in the last column of `W`). `W` has shape `(D, D + C + k)`.

use ndarray::{Array3, ArrayD, ArrayView1, ArrayView3, IxDyn};
use rand_distr::{Distribution, StandardNormal};

use crate::model::{flatten, position_features, unflatten, ScoreModel, TimeFeatures};
use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::{Error, Result};

const W: &str = "linear/w";

#[derive(Debug, Clone)]
pub struct LinearScoreModel {
    pub time: TimeFeatures,
    /// Std of the initial weights, relative to `1/sqrt(fan_in)`. `0.0` gives a zero field.
    pub init_gain: f32,
}

impl Default for LinearScoreModel {
    fn default() -> Self {
        Self {
            time: TimeFeatures::Affine,
            init_gain: 1.0,
        }
    }
}

impl LinearScoreModel {
    /// A model whose initial field is identically zero.
    pub fn zeros() -> Self {
        Self {
            init_gain: 0.0,
            ..Self::default()
        }
    }
}

impl ScoreModel for LinearScoreModel {
    fn init(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        _t: &ArrayView1<f32>,
        _train: bool,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<ParamSet> {
        let d = x.shape()[2];
        let c = cond.map(|cv| cv.shape()[2]).unwrap_or(0);
        let fan_in = d + c + self.time.len();
        if d == 0 {
            return Err(Error::Domain("feature axis must be non-empty"));
        }
        let std = self.init_gain / (fan_in as f32).sqrt();
        let mut rng = key.into_rng();
        let w = ArrayD::from_shape_simple_fn(IxDyn(&[d, fan_in]), || {
            let z: f32 = StandardNormal.sample(&mut rng);
            std * z
        });
        let mut params = ParamSet::new();
        params.insert(W, w);
        Ok(params)
    }

    fn apply(
        &self,
        params: &ParamSet,
        x: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
        _train: bool,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<Array3<f32>> {
        let (b, len, d) = x.dim();
        let w = params.require2(W)?;
        let feats = position_features(x, t, cond, self.time)?;
        if w.dim() != (d, feats.ncols()) {
            return Err(Error::ShapeMismatch {
                what: "linear weight vs input features",
                expected: vec![d, feats.ncols()],
                found: w.shape().to_vec(),
            });
        }
        unflatten(feats.dot(&w.t()), b, len)
    }

    fn pullback(
        &self,
        params: &ParamSet,
        x: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
        _train: bool,
        cond: Option<&ArrayView3<f32>>,
        cotangent: &ArrayView3<f32>,
    ) -> Result<ParamSet> {
        let w = params.require2(W)?;
        if cotangent.shape() != x.shape() {
            return Err(Error::ShapeMismatch {
                what: "cotangent vs model output",
                expected: x.shape().to_vec(),
                found: cotangent.shape().to_vec(),
            });
        }
        let feats = position_features(x, t, cond, self.time)?;
        let g = flatten(cotangent);
        // dW[i, f] = sum over positions of g[n, i] * feats[n, f]
        let dw = g.t().dot(&feats);
        if dw.dim() != w.dim() {
            return Err(Error::Structure(format!(
                "gradient shape {:?} does not match `{W}` {:?}",
                dw.dim(),
                w.dim()
            )));
        }
        let mut grads = ParamSet::new();
        grads.insert(W, dw.into_dyn());
        Ok(grads)
    }
}
