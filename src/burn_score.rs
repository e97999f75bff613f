//! Burn-backed (opt-in) score model.
//!
//! [`BurnMlpScoreModel`] has the parameter layout of [`MlpScoreModel`](crate::mlp::MlpScoreModel)
//! (`hidden/{w,b}`, `out/{w,b}`) and the same per-position features, so trees are
//! interchangeable between the two. The forward pass runs on `NdArray<f32>`; `pullback` runs the
//! same graph on `Autodiff<NdArray<f32>>` and reads parameter gradients from `backward()`.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use ndarray::{Array2, Array3, ArrayD, ArrayView1, ArrayView3, IxDyn};

use crate::mlp::MlpScoreModel;
use crate::model::{flatten, position_features, unflatten, ScoreModel};
use crate::params::ParamSet;
use crate::rng::RngKey;
use crate::{Error, Result};

/// Forward backend.
pub type BurnBackend = NdArray<f32>;
/// Backend used for `pullback`.
pub type BurnAutodiffBackend = Autodiff<NdArray<f32>>;

const KEYS: [&str; 4] = ["hidden/w", "hidden/b", "out/w", "out/b"];

#[derive(Debug, Clone)]
pub struct BurnMlpScoreModel {
    inner: MlpScoreModel,
    device: NdArrayDevice,
}

impl BurnMlpScoreModel {
    pub fn new(hidden: usize) -> Self {
        Self {
            inner: MlpScoreModel::new(hidden),
            device: NdArrayDevice::default(),
        }
    }

    pub fn hidden(&self) -> usize {
        self.inner.hidden
    }
}

fn tensor2<B: Backend>(a: &ArrayD<f32>, device: &B::Device) -> Result<Tensor<B, 2>> {
    let shape = match a.shape() {
        [r, c] => [*r, *c],
        [n] => [1, *n],
        _ => return Err(Error::Shape("burn score model expects rank-1 or rank-2 parameters")),
    };
    let data = TensorData::new(a.iter().copied().collect::<Vec<f32>>(), shape);
    Ok(Tensor::from_data(data, device))
}

fn features<B: Backend>(feats: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let data = TensorData::new(feats.iter().copied().collect::<Vec<f32>>(), [feats.nrows(), feats.ncols()]);
    Tensor::from_data(data, device)
}

/// `tanh(f W1ᵀ + b1) W2ᵀ + b2`; biases are `[1, n]` rows.
fn forward<B: Backend>(
    feats: Tensor<B, 2>,
    w1: Tensor<B, 2>,
    b1: Tensor<B, 2>,
    w2: Tensor<B, 2>,
    b2: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let h = (feats.matmul(w1.transpose()) + b1).tanh();
    h.matmul(w2.transpose()) + b2
}

fn to_vec<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f32>> {
    t.into_data()
        .to_vec::<f32>()
        .map_err(|e| Error::Structure(format!("reading burn tensor: {e:?}")))
}

impl BurnMlpScoreModel {
    fn check(&self, params: &ParamSet, f: usize, d: usize) -> Result<()> {
        let w1 = params.require2("hidden/w")?;
        let w2 = params.require2("out/w")?;
        if w1.ncols() != f || w2.nrows() != d || w2.ncols() != w1.nrows() {
            return Err(Error::ShapeMismatch {
                what: "burn score model weights",
                expected: vec![w1.nrows(), f, d],
                found: vec![w1.nrows(), w1.ncols(), w2.nrows()],
            });
        }
        Ok(())
    }
}

impl ScoreModel for BurnMlpScoreModel {
    fn init(
        &self,
        key: RngKey,
        x: &ArrayView3<f32>,
        t: &ArrayView1<f32>,
        train: bool,
        cond: Option<&ArrayView3<f32>>,
    ) -> Result<ParamSet> {
        self.inner.init(key, x, t, train, cond)
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
        let feats = position_features(x, t, cond, self.inner.time)?;
        self.check(params, feats.ncols(), d)?;
        let dev = &self.device;
        let out = forward::<BurnBackend>(
            features(&feats, dev),
            tensor2(params.require("hidden/w")?, dev)?,
            tensor2(params.require("hidden/b")?, dev)?,
            tensor2(params.require("out/w")?, dev)?,
            tensor2(params.require("out/b")?, dev)?,
        );
        let rows = Array2::from_shape_vec((b * len, d), to_vec(out)?)
            .map_err(|_| Error::Shape("burn output does not match (batch*T, D)"))?;
        unflatten(rows, b, len)
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
        let feats = position_features(x, t, cond, self.inner.time)?;
        self.check(params, feats.ncols(), x.dim().2)?;
        let dev = &self.device;
        let leaves = KEYS
            .iter()
            .map(|k| Ok(tensor2::<BurnAutodiffBackend>(params.require(k)?, dev)?.require_grad()))
            .collect::<Result<Vec<_>>>()?;
        let out = forward(
            features(&feats, dev),
            leaves[0].clone(),
            leaves[1].clone(),
            leaves[2].clone(),
            leaves[3].clone(),
        );
        // <F(θ), v> has gradient (∂F/∂θ)ᵀ v
        let v = features::<BurnAutodiffBackend>(&flatten(cotangent), dev);
        let grads = (out * v).sum().backward();

        let mut tree = ParamSet::new();
        for (k, leaf) in KEYS.iter().zip(leaves.iter()) {
            let shape = params.require(k)?.shape().to_vec();
            let values = match leaf.grad(&grads) {
                Some(g) => to_vec(g)?,
                None => vec![0.0; shape.iter().product()],
            };
            let arr = ArrayD::from_shape_vec(IxDyn(&shape), values)
                .map_err(|_| Error::Shape("burn gradient does not match parameter shape"))?;
            tree.insert(*k, arr);
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, Array1};

    fn inputs() -> (Array3<f32>, Array3<f32>, Array1<f32>, Array3<f32>) {
        let x = Array::from_shape_fn((2, 3, 2), |(b, p, d)| ((b * 7 + p * 3 + d) % 5) as f32 * 0.3 - 0.6);
        let c = Array::from_shape_fn((2, 3, 1), |(b, p, _)| (b + p) as f32 * 0.2);
        let t = Array1::from_vec(vec![0.25, 0.75]);
        let v = Array::from_shape_fn((2, 3, 2), |(b, p, d)| ((b + p + d) % 3) as f32 - 1.0);
        (x, c, t, v)
    }

    #[test]
    fn matches_ndarray_mlp_forward_and_pullback() {
        let (x, c, t, v) = inputs();
        let burn_model = BurnMlpScoreModel::new(6);
        let nd_model = MlpScoreModel::new(6);
        let p = burn_model
            .init(RngKey::new(5), &x.view(), &t.view(), true, Some(&c.view()))
            .unwrap();

        let a = burn_model.apply(&p, &x.view(), &t.view(), false, Some(&c.view())).unwrap();
        let b = nd_model.apply(&p, &x.view(), &t.view(), false, Some(&c.view())).unwrap();
        for (u, w) in a.iter().zip(b.iter()) {
            assert!((u - w).abs() < 1e-5);
        }

        let ga = burn_model
            .pullback(&p, &x.view(), &t.view(), true, Some(&c.view()), &v.view())
            .unwrap();
        let gb = nd_model
            .pullback(&p, &x.view(), &t.view(), true, Some(&c.view()), &v.view())
            .unwrap();
        assert!(ga.same_structure(&p));
        assert!(ga.max_abs_diff(&gb).unwrap() < 1e-4);
    }
}
