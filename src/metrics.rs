//! Evaluation utilities (small + explicit).
//!
//! These helpers are intentionally "glass box": they surface the exact scalar computed and do
//! not hide any normalization.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView3, Axis, Zip};

use crate::{Error, Result};

/// Relative error \(\lVert x - y\rVert / \lVert x\rVert\) over the feature axis, shape `(batch, T)`.
///
/// Rows where \(x\) is exactly zero give `inf` (or `NaN` if `y` is zero too); the caller decides
/// whether that is meaningful.
pub fn relative_error(x: &ArrayView3<f32>, y: &ArrayView3<f32>) -> Result<Array2<f32>> {
    if x.shape() != y.shape() {
        return Err(Error::ShapeMismatch {
            what: "relative_error operands",
            expected: x.shape().to_vec(),
            found: y.shape().to_vec(),
        });
    }
    let (b, len, _) = x.dim();
    let mut out = Array2::<f32>::zeros((b, len));
    Zip::from(&mut out)
        .and(x.lanes(Axis(2)))
        .and(y.lanes(Axis(2)))
        .for_each(|o, xl, yl| {
            let mut num = 0.0f32;
            let mut den = 0.0f32;
            Zip::from(&xl).and(&yl).for_each(|&a, &c| {
                num += (a - c) * (a - c);
                den += a * a;
            });
            *o = num.sqrt() / den.sqrt();
        });
    Ok(out)
}

/// Batch-size-weighted running means, one per metric name, reset per epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    running: BTreeMap<String, (f64, usize)>,
    last_epoch: BTreeMap<String, f32>,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, value: f32, batch_size: usize) {
        let e = self.running.entry(name.to_string()).or_insert((0.0, 0));
        e.0 += value as f64 * batch_size as f64;
        e.1 += batch_size;
    }

    /// Mean of `name` over the epoch so far.
    pub fn epoch_mean(&self, name: &str) -> Option<f32> {
        self.running
            .get(name)
            .filter(|(_, n)| *n > 0)
            .map(|(s, n)| (s / *n as f64) as f32)
    }

    /// Close the epoch: running means become the callback metrics and are reset.
    pub fn end_epoch(&mut self) -> &BTreeMap<String, f32> {
        let finished = std::mem::take(&mut self.running);
        for (k, (s, n)) in finished {
            if n > 0 {
                self.last_epoch.insert(k, (s / n as f64) as f32);
            }
        }
        &self.last_epoch
    }

    /// Latest value per metric: the running epoch mean if any, else the last finished epoch.
    pub fn callback_metrics(&self) -> BTreeMap<String, f32> {
        let mut out = self.last_epoch.clone();
        for k in self.running.keys() {
            if let Some(v) = self.epoch_mean(k) {
                out.insert(k.clone(), v);
            }
        }
        out
    }
}
