//! The score-network contract.
//!
//! The training core treats the network as opaque: it only needs `init`, `apply`, and a
//! reverse-mode product with respect to the parameters (`pullback`). Models that are built on
//! a framework with autodiff (see `burn_score`) get `pullback` from the framework; the small
//! ndarray baselines in `linear` and `mlp` derive it by hand.

use std::fmt;

use ndarray::{Array2, ArrayView1, ArrayView3, Axis};

use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::{Error, Result};

/// A parametric function \(F_\theta(x, t; c)\) with a parameter-space vector-Jacobian product.
///
/// Shapes: `x` and the output are `(batch, T, D)`; `t` is `(batch,)`; `cond`, when present, is
/// `(batch, T, C)`.
pub trait ScoreModel: fmt::Debug + Send + Sync {
    /// Build parameters whose shapes fit the example input.
    fn init(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
        train: bool,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<ParamSet>;

    /// Forward pass. `train` enables train-only behavior in models that have any.
    fn apply(
        &self,
        params: &ParamSet,
        x: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
        train: bool,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<ndarray::Array3<f32>>;

    /// \(\left(\partial F_\theta / \partial\theta\right)^\top v\) for a cotangent `v` shaped like the output.
    ///
    /// The returned tree has exactly the structure of `params`.
    fn pullback(
        &self,
        params: &ParamSet,
        x: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
        train: bool,
        cond: Option<&ArrayView3<f32>>,
        cotangent: &ArrayView3<f32>,
    ) -> Result<ParamSet>;
}

/// How per-example time enters the per-position feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFeatures {
    /// `[t, 1]`
    Affine,
    /// `[t, sin(πt), cos(πt), 1]`
    Fourier,
}

impl TimeFeatures {
    pub fn len(self) -> usize {
        match self {
            TimeFeatures::Affine => 2,
            TimeFeatures::Fourier => 4,
        }
    }

    fn write(self, t: f32, out: &mut [f32]) {
        match self {
            TimeFeatures::Affine => {
                out[0] = t;
                out[1] = 1.0;
            }
            TimeFeatures::Fourier => {
                let a = core::f32::consts::PI * t;
                out[0] = t;
                out[1] = a.sin();
                out[2] = a.cos();
                out[3] = 1.0;
            }
        }
    }
}

/// Flatten `(batch, T, ·)` inputs into one feature row per position:
/// `[x (D); cond (C); time features]`, shape `(batch * T, D + C + k)`.
pub(crate) fn position_features(
    x: &ArrayView3<f32>,
    t: &ArrayView1<f32>,
    cond: Option<&ArrayView3<f32>>,
    time: TimeFeatures,
) -> Result<Array2<f32>> {
    let (b, len, d) = x.dim();
    if t.len() != b {
        return Err(Error::ShapeMismatch {
            what: "model time input",
            expected: vec![b],
            found: vec![t.len()],
        });
    }
    let c = match cond {
        Some(cv) => {
            if cv.shape()[0] != b || cv.shape()[1] != len {
                return Err(Error::ShapeMismatch {
                    what: "conditioning leading axes",
                    expected: vec![b, len],
                    found: cv.shape()[..2].to_vec(),
                });
            }
            cv.shape()[2]
        }
        None => 0,
    };
    let k = time.len();
    let width = d + c + k;
    let mut feats = Array2::<f32>::zeros((b * len, width));
    for bi in 0..b {
        for p in 0..len {
            let mut row = feats.row_mut(bi * len + p);
            for j in 0..d {
                row[j] = x[[bi, p, j]];
            }
            if let Some(cv) = cond {
                for j in 0..c {
                    row[d + j] = cv[[bi, p, j]];
                }
            }
            let mut tf = [0.0f32; 4];
            time.write(t[bi], &mut tf[..k]);
            for j in 0..k {
                row[d + c + j] = tf[j];
            }
        }
    }
    Ok(feats)
}

/// Reshape per-position rows `(batch * T, D)` back to `(batch, T, D)`.
pub(crate) fn unflatten(rows: Array2<f32>, batch: usize, len: usize) -> Result<ndarray::Array3<f32>> {
    let d = rows.ncols();
    rows.into_shape_with_order((batch, len, d))
        .map_err(|_| Error::Shape("per-position rows do not tile (batch, T, D)"))
}

/// Flatten a `(batch, T, D)` cotangent into `(batch * T, D)` rows.
pub(crate) fn flatten(v: &ArrayView3<f32>) -> Array2<f32> {
    let (b, len, d) = v.dim();
    let mut out = Array2::<f32>::zeros((b * len, d));
    for (i, lane) in v.lanes(Axis(2)).into_iter().enumerate() {
        out.row_mut(i).assign(&lane);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array1};

    #[test]
    fn features_layout_is_x_then_cond_then_time() {
        let x = Array::from_shape_fn((2, 3, 2), |(b, p, d)| (b * 100 + p * 10 + d) as f32);
        let c = Array::from_shape_fn((2, 3, 1), |(b, p, _)| -((b * 100 + p * 10) as f32));
        let t = Array1::from_vec(vec![0.25, 0.75]);
        let f = position_features(&x.view(), &t.view(), Some(&c.view()), TimeFeatures::Affine).unwrap();
        assert_eq!(f.dim(), (6, 5));
        // batch 1, position 2
        let r = f.row(5);
        assert_eq!(r.to_vec(), vec![120.0, 121.0, -120.0, 0.75, 1.0]);
    }

    #[test]
    fn flatten_then_unflatten_is_identity() {
        let x = Array::from_shape_fn((3, 4, 2), |(b, p, d)| (b * 8 + p * 2 + d) as f32);
        let back = unflatten(flatten(&x.view()), 3, 4).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn cond_with_wrong_length_is_rejected() {
        let x = Array::<f32, _>::zeros((2, 3, 2));
        let c = Array::<f32, _>::zeros((2, 4, 1));
        let t = Array1::<f32>::zeros(2);
        assert!(position_features(&x.view(), &t.view(), Some(&c.view()), TimeFeatures::Affine).is_err());
    }
}
