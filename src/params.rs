//! Parameter trees.
//!
//! A [`ParamSet`] maps `/`-joined layer paths (`"hidden/w"`, `"out/b"`) to dense tensors.
//! The raw and EMA sets always share one structure: every binary operation here checks
//! keys and shapes first and refuses to combine mismatched trees.

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayView1, ArrayView2, Ix1, Ix2, Zip};

use crate::{Error, Result};

/// An ordered mapping from layer paths to `f32` tensors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(path.into(), value)
    }

    pub fn get(&self, path: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(path)
    }

    /// Lookup that reports the missing path instead of returning `None`.
    pub fn require(&self, path: &str) -> Result<&ArrayD<f32>> {
        self.tensors
            .get(path)
            .ok_or_else(|| Error::Structure(format!("missing parameter `{path}`")))
    }

    /// Matrix-valued leaf.
    pub fn require2(&self, path: &str) -> Result<ArrayView2<'_, f32>> {
        self.require(path)?
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| Error::Structure(format!("parameter `{path}` is not a matrix")))
    }

    /// Vector-valued leaf.
    pub fn require1(&self, path: &str) -> Result<ArrayView1<'_, f32>> {
        self.require(path)?
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| Error::Structure(format!("parameter `{path}` is not a vector")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.tensors.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_params(&self) -> usize {
        self.tensors.values().map(|a| a.len()).sum()
    }

    /// `true` iff both trees have the same key set and per-key shapes.
    pub fn same_structure(&self, other: &ParamSet) -> bool {
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(other.tensors.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.shape() == b.shape())
    }

    fn check_structure(&self, other: &ParamSet) -> Result<()> {
        if self.tensors.len() != other.tensors.len() {
            return Err(Error::Structure(format!(
                "parameter trees have {} and {} leaves",
                self.tensors.len(),
                other.tensors.len()
            )));
        }
        for ((ka, a), (kb, b)) in self.tensors.iter().zip(other.tensors.iter()) {
            if ka != kb {
                return Err(Error::Structure(format!("key mismatch: `{ka}` vs `{kb}`")));
            }
            if a.shape() != b.shape() {
                return Err(Error::Structure(format!(
                    "shape mismatch at `{ka}`: {:?} vs {:?}",
                    a.shape(),
                    b.shape()
                )));
            }
        }
        Ok(())
    }

    /// Element-wise map over every leaf.
    pub fn map(&self, mut f: impl FnMut(f32) -> f32) -> ParamSet {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, a)| (k.clone(), a.mapv(&mut f)))
            .collect();
        ParamSet { tensors }
    }

    /// Element-wise combination of two trees with identical structure.
    pub fn zip_map(&self, other: &ParamSet, mut f: impl FnMut(f32, f32) -> f32) -> Result<ParamSet> {
        self.check_structure(other)?;
        let mut tensors = BTreeMap::new();
        for ((k, a), (_, b)) in self.tensors.iter().zip(other.tensors.iter()) {
            let mut out = a.clone();
            Zip::from(&mut out).and(b).for_each(|o, &bv| *o = f(*o, bv));
            tensors.insert(k.clone(), out);
        }
        Ok(ParamSet { tensors })
    }

    /// `self + alpha * other`.
    pub fn scaled_add(&self, alpha: f32, other: &ParamSet) -> Result<ParamSet> {
        self.zip_map(other, |a, b| a + alpha * b)
    }

    /// A tree with the same structure, filled with zeros.
    pub fn zeros_like(&self) -> ParamSet {
        self.map(|_| 0.0)
    }

    /// Largest absolute element-wise difference (useful for diagnostics and tests).
    pub fn max_abs_diff(&self, other: &ParamSet) -> Result<f32> {
        self.check_structure(other)?;
        let mut m = 0.0f32;
        for ((_, a), (_, b)) in self.tensors.iter().zip(other.tensors.iter()) {
            Zip::from(a).and(b).for_each(|&x, &y| m = m.max((x - y).abs()));
        }
        Ok(m)
    }
}

impl FromIterator<(String, ArrayD<f32>)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        ParamSet {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use proptest::prelude::*;

    fn tree(vals: &[f32]) -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("a/w", ArrayD::from_shape_vec(IxDyn(&[2, 2]), vals[..4].to_vec()).unwrap());
        p.insert("a/b", ArrayD::from_shape_vec(IxDyn(&[2]), vals[4..6].to_vec()).unwrap());
        p
    }

    #[test]
    fn zip_map_rejects_key_mismatch() {
        let a = tree(&[1.0; 6]);
        let mut b = tree(&[1.0; 6]);
        b.insert("c/w", ArrayD::zeros(IxDyn(&[1])));
        assert!(matches!(a.zip_map(&b, |x, _| x), Err(Error::Structure(_))));
        assert!(!a.same_structure(&b));
    }

    #[test]
    fn zip_map_rejects_shape_mismatch() {
        let a = tree(&[1.0; 6]);
        let mut b = tree(&[1.0; 6]);
        b.insert("a/b", ArrayD::zeros(IxDyn(&[3])));
        assert!(a.zip_map(&b, |x, _| x).is_err());
    }

    #[test]
    fn require_reports_missing_path() {
        let a = tree(&[0.0; 6]);
        let err = a.require("nope").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    proptest! {
        #[test]
        fn prop_scaled_add_matches_elementwise(
            xs in prop::collection::vec(-10.0f32..10.0, 6),
            ys in prop::collection::vec(-10.0f32..10.0, 6),
            alpha in -2.0f32..2.0,
        ) {
            let a = tree(&xs);
            let b = tree(&ys);
            let c = a.scaled_add(alpha, &b).unwrap();
            prop_assert!(c.same_structure(&a));
            let w = c.get("a/w").unwrap();
            for i in 0..4 {
                let expected = xs[i] + alpha * ys[i];
                prop_assert!((w.as_slice().unwrap()[i] - expected).abs() <= 1e-5);
            }
            prop_assert_eq!(a.num_params(), 6);
        }
    }
}
