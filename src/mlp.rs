//! Two-layer tanh MLP applied independently at every position.
//!
//! Parameters:
//! - `hidden/w` `(H, F)`, `hidden/b` `(H,)`
//! - `out/w` `(D, H)`, `out/b` `(D,)`
//!
//! with `F = D + C + k` per-position input features (see [`TimeFeatures`]).

use ndarray::{Array2, Array3, ArrayD, ArrayView1, ArrayView3, Axis, IxDyn};
use rand_distr::{Distribution, StandardNormal};

use crate::model::{flatten, position_features, unflatten, ScoreModel, TimeFeatures};
use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MlpScoreModel {
    pub hidden: usize,
    pub time: TimeFeatures,
}

impl MlpScoreModel {
    pub fn new(hidden: usize) -> Self {
        Self {
            hidden,
            time: TimeFeatures::Fourier,
        }
    }

    fn hidden_activations(
        &self,
        params: &ParamSet,
        feats: &Array2<f32>,
    ) -> Result<Array2<f32>> {
        let w1 = params.require2("hidden/w")?;
        let b1 = params.require1("hidden/b")?;
        if w1.ncols() != feats.ncols() {
            return Err(Error::ShapeMismatch {
                what: "hidden weight vs input features",
                expected: vec![w1.nrows(), feats.ncols()],
                found: w1.shape().to_vec(),
            });
        }
        let mut h = feats.dot(&w1.t());
        h += &b1;
        h.mapv_inplace(f32::tanh);
        Ok(h)
    }
}

fn gaussian(rng: &mut impl rand::Rng, shape: &[usize], std: f32) -> ArrayD<f32> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || {
        let z: f32 = StandardNormal.sample(&mut *rng);
        std * z
    })
}

impl ScoreModel for MlpScoreModel {
    fn init(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        _t: &ArrayView1<f32>,
        _train: bool,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<ParamSet> {
        if self.hidden == 0 {
            return Err(Error::Domain("hidden width must be >= 1"));
        }
        let d = x.shape()[2];
        let f = d + cond.map(|c| c.shape()[2]).unwrap_or(0) + self.time.len();
        let (k1, k2) = key.split();
        let mut r1 = k1.into_rng();
        let mut r2 = k2.into_rng();

        let mut params = ParamSet::new();
        params.insert("hidden/w", gaussian(&mut r1, &[self.hidden, f], 1.0 / (f as f32).sqrt()));
        params.insert("hidden/b", ArrayD::zeros(IxDyn(&[self.hidden])));
        params.insert("out/w", gaussian(&mut r2, &[d, self.hidden], 1.0 / (self.hidden as f32).sqrt()));
        params.insert("out/b", ArrayD::zeros(IxDyn(&[d])));
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
        let feats = position_features(x, t, cond, self.time)?;
        let h = self.hidden_activations(params, &feats)?;
        let w2 = params.require2("out/w")?;
        let b2 = params.require1("out/b")?;
        if w2.nrows() != d {
            return Err(Error::ShapeMismatch {
                what: "output weight rows vs data features",
                expected: vec![d, h.ncols()],
                found: w2.shape().to_vec(),
            });
        }
        let mut out = h.dot(&w2.t());
        out += &b2;
        unflatten(out, b, len)
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
        if cotangent.shape() != x.shape() {
            return Err(Error::ShapeMismatch {
                what: "cotangent vs model output",
                expected: x.shape().to_vec(),
                found: cotangent.shape().to_vec(),
            });
        }
        let feats = position_features(x, t, cond, self.time)?;
        let h = self.hidden_activations(params, &feats)?;
        let w2 = params.require2("out/w")?;
        let g = flatten(cotangent);

        let dw2 = g.t().dot(&h);
        let db2 = g.sum_axis(Axis(0));
        // back through tanh: (g W2) * (1 - h^2)
        let mut gh = g.dot(&w2);
        gh.zip_mut_with(&h, |a, &hv| *a *= 1.0 - hv * hv);
        let dw1 = gh.t().dot(&feats);
        let db1 = gh.sum_axis(Axis(0));

        let mut grads = ParamSet::new();
        grads.insert("hidden/w", dw1.into_dyn());
        grads.insert("hidden/b", db1.into_dyn());
        grads.insert("out/w", dw2.into_dyn());
        grads.insert("out/b", db2.into_dyn());
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array1};

    #[test]
    fn pullback_matches_finite_differences() {
        let x = Array::from_shape_fn((2, 4, 3), |(b, p, d)| ((b * 11 + p * 5 + d * 3) % 9) as f32 * 0.2 - 0.8);
        let c = Array::from_shape_fn((2, 4, 1), |(b, p, _)| (b + p) as f32 * 0.1);
        let t = Array1::from_vec(vec![0.3, 0.9]);
        let v = Array::from_shape_fn((2, 4, 3), |(b, p, d)| ((b + p * 2 + d) % 5) as f32 * 0.25 - 0.5);
        let m = MlpScoreModel::new(5);
        let p = m.init(RngKey::new(11), &x.view(), &t.view(), true, Some(&c.view())).unwrap();
        let grads = m
            .pullback(&p, &x.view(), &t.view(), true, Some(&c.view()), &v.view())
            .unwrap();
        assert!(grads.same_structure(&p));

        let objective = |params: &ParamSet| -> f64 {
            let out = m.apply(params, &x.view(), &t.view(), true, Some(&c.view())).unwrap();
            out.iter().zip(v.iter()).map(|(&a, &b)| a as f64 * b as f64).sum()
        };
        let h = 1e-3f32;
        let probes: [(&str, Vec<usize>); 4] = [
            ("hidden/w", vec![1, 2]),
            ("hidden/b", vec![4]),
            ("out/w", vec![2, 3]),
            ("out/b", vec![0]),
        ];
        for (name, idx) in probes.iter() {
            let mut plus = p.clone();
            let mut minus = p.clone();
            let mut a = p.require(name).unwrap().clone();
            let mut b = a.clone();
            a[IxDyn(idx)] += h;
            b[IxDyn(idx)] -= h;
            plus.insert(*name, a);
            minus.insert(*name, b);
            let fd = ((objective(&plus) - objective(&minus)) / (2.0 * h as f64)) as f32;
            let an = grads.require(name).unwrap()[IxDyn(idx)];
            assert!((fd - an).abs() < 2e-2 * (1.0 + an.abs()), "{name}{idx:?}: fd={fd} an={an}");
        }
    }
}
