//! Metric reporting and the top-k checkpoint policy.
//!
//! [`LogStats`] turns step outputs into named scalars on a [`MetricSink`]; [`ModelCheckpoint`]
//! decides which `(raw, EMA)` pairs to keep and drives a
//! [`CheckpointCoordinator`](crate::checkpoint::CheckpointCoordinator).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::checkpoint::CheckpointCoordinator;
use crate::config::{CheckpointPolicy, MonitorMode};
use crate::metrics::EpochMetrics;
use crate::params::ParamSet;
use crate::train::TrainStepOutput;
use crate::{Error, Result};

/// Separator between a placeholder's name and its value in checkpoint names (`epoch_3`).
pub const CHECKPOINT_EQUALS_CHAR: char = '_';
/// File extension given to checkpoint paths; only the stem becomes a directory.
pub const CHECKPOINT_EXT: &str = "ckpt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub batch_size: usize,
    pub on_epoch: bool,
    pub prog_bar: bool,
}

impl LogOptions {
    pub fn epoch(batch_size: usize) -> Self {
        Self {
            batch_size,
            on_epoch: true,
            prog_bar: true,
        }
    }
}

pub trait MetricSink {
    fn log(&mut self, name: &str, value: f32, opts: LogOptions);
}

/// Emits every metric as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log(&mut self, name: &str, value: f32, opts: LogOptions) {
        if opts.prog_bar {
            info!(metric = name, value, batch_size = opts.batch_size, "metric");
        } else {
            debug!(metric = name, value, batch_size = opts.batch_size, "metric");
        }
    }
}

impl MetricSink for EpochMetrics {
    fn log(&mut self, name: &str, value: f32, opts: LogOptions) {
        if opts.on_epoch {
            self.record(name, value, opts.batch_size);
        }
    }
}

impl<S: MetricSink + ?Sized> MetricSink for &mut S {
    fn log(&mut self, name: &str, value: f32, opts: LogOptions) {
        (**self).log(name, value, opts);
    }
}

/// Fan out to both sinks.
impl<A: MetricSink, B: MetricSink> MetricSink for (A, B) {
    fn log(&mut self, name: &str, value: f32, opts: LogOptions) {
        self.0.log(name, value, opts);
        self.1.log(name, value, opts);
    }
}

/// Logs the training and validation scalars.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStats;

impl LogStats {
    /// `train_loss`, `train_loss_ema`, then every monitor and its `_ema` twin.
    pub fn on_train_batch_end<S: MetricSink + ?Sized>(
        &self,
        sink: &mut S,
        out: &TrainStepOutput,
        batch_size: usize,
    ) {
        let opts = LogOptions::epoch(batch_size);
        sink.log("train_loss", out.loss, opts);
        sink.log("train_loss_ema", out.loss_ema, opts);
        for (k, v) in &out.monitors {
            sink.log(k, *v, opts);
        }
        for (k, v) in &out.monitors_ema {
            sink.log(&format!("{k}_ema"), *v, opts);
        }
    }

    pub fn on_validation_batch_end<S: MetricSink + ?Sized>(&self, sink: &mut S, loss_val: f32, batch_size: usize) {
        sink.log("loss_val", loss_val, LogOptions::epoch(batch_size));
    }
}

/// Render a filename template: `{epoch}` becomes `epoch_<n>`, `{step}` becomes `step_<n>`.
pub fn format_checkpoint_name(template: &str, epoch: u64, step: u64) -> String {
    let eq = CHECKPOINT_EQUALS_CHAR;
    template
        .replace("{epoch}", &format!("epoch{eq}{epoch}"))
        .replace("{step}", &format!("step{eq}{step}"))
}

/// Keeps the best `save_top_k` pairs by the monitored metric, plus `best` and `last` aliases.
#[derive(Debug)]
pub struct ModelCheckpoint {
    policy: CheckpointPolicy,
    /// Kept pairs, best first.
    best_k: Vec<(f32, PathBuf)>,
    last_model_path: Option<PathBuf>,
}

impl ModelCheckpoint {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self {
            policy,
            best_k: Vec::new(),
            last_model_path: None,
        }
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    pub fn checkpoint_path(&self, epoch: u64, step: u64) -> PathBuf {
        let name = format_checkpoint_name(&self.policy.filename, epoch, step);
        self.policy.dirpath.join(format!("{name}.{CHECKPOINT_EXT}"))
    }

    pub fn best_path(&self) -> PathBuf {
        self.policy.dirpath.join(format!("best.{CHECKPOINT_EXT}"))
    }

    pub fn last_path(&self) -> PathBuf {
        self.policy.dirpath.join(format!("last.{CHECKPOINT_EXT}"))
    }

    pub fn best_model_path(&self) -> Option<&Path> {
        self.best_k.first().map(|(_, p)| p.as_path())
    }

    pub fn best_model_score(&self) -> Option<f32> {
        self.best_k.first().map(|(s, _)| *s)
    }

    pub fn last_model_path(&self) -> Option<&Path> {
        self.last_model_path.as_deref()
    }

    /// Paths currently kept, best first.
    pub fn kept(&self) -> impl Iterator<Item = (f32, &Path)> {
        self.best_k.iter().map(|(s, p)| (*s, p.as_path()))
    }

    /// Whether score `a` ranks above `b`. Without a monitor the newer entry always does.
    fn outranks(&self, a: f32, b: f32) -> bool {
        match (&self.policy.monitor, self.policy.mode) {
            (None, _) => true,
            (Some(_), MonitorMode::Min) => a < b,
            (Some(_), MonitorMode::Max) => a > b,
        }
    }

    /// Apply the policy at the end of an epoch. Returns the path saved into the top-k, if any.
    pub fn on_epoch_end(
        &mut self,
        coordinator: &mut CheckpointCoordinator,
        params: &ParamSet,
        params_ema: &ParamSet,
        epoch: u64,
        step: u64,
        callback_metrics: &BTreeMap<String, f32>,
    ) -> Result<Option<PathBuf>> {
        let path = self.checkpoint_path(epoch, step);
        let score = match &self.policy.monitor {
            Some(name) => {
                let v = *callback_metrics
                    .get(name)
                    .ok_or_else(|| Error::Checkpoint(format!("monitored metric `{name}` was never logged")))?;
                // NaN never ranks
                if v.is_nan() {
                    None
                } else {
                    Some(v)
                }
            }
            // unmonitored: newest wins
            None => Some(step as f32),
        };
        let k = self.policy.save_top_k;

        let mut saved = None;
        if let Some(s) = score {
            let admit = k > 0
                && (self.best_k.len() < k
                    || self
                        .best_k
                        .last()
                        .is_some_and(|(w, _)| self.outranks(s, *w)));
            if admit {
                coordinator.save(params, params_ema, &path, step)?;
                self.best_k.retain(|(_, p)| p != &path);
                let pos = self
                    .best_k
                    .iter()
                    .position(|(w, _)| self.outranks(s, *w))
                    .unwrap_or(self.best_k.len());
                self.best_k.insert(pos, (s, path.clone()));
                while self.best_k.len() > k {
                    if let Some((ws, wp)) = self.best_k.pop() {
                        coordinator.remove(&wp)?;
                        debug!(path = %wp.display(), score = ws, "evicted checkpoint");
                    }
                }
                if let Some((bs, best)) = self.best_k.first() {
                    coordinator.link(best, self.best_path())?;
                    info!(path = %best.display(), score = bs, "best checkpoint");
                }
                saved = Some(path.clone());
            }
        }

        if self.policy.save_last {
            let last = self.last_path();
            match &saved {
                Some(p) => coordinator.link(p, &last)?,
                None => coordinator.save(params, params_ema, &last, step)?,
            }
            self.last_model_path = Some(last);
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn tree(v: f32) -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("w", ArrayD::from_elem(IxDyn(&[2]), v));
        p
    }

    #[derive(Default)]
    struct Recorder(Vec<(String, f32, usize)>);

    impl MetricSink for Recorder {
        fn log(&mut self, name: &str, value: f32, opts: LogOptions) {
            self.0.push((name.to_string(), value, opts.batch_size));
        }
    }

    #[test]
    fn checkpoint_names_use_underscore() {
        assert_eq!(format_checkpoint_name("{epoch}-{step}", 3, 120), "epoch_3-step_120");
        let cb = ModelCheckpoint::new(CheckpointPolicy {
            dirpath: PathBuf::from("/runs/a"),
            ..CheckpointPolicy::default()
        });
        assert_eq!(cb.checkpoint_path(0, 7), PathBuf::from("/runs/a/epoch_0-step_7.ckpt"));
    }

    #[test]
    fn log_stats_names_every_scalar() {
        let mut monitors = BTreeMap::new();
        monitors.insert("flow_loss".to_string(), 0.5);
        let out = TrainStepOutput {
            loss: 1.0,
            loss_ema: 2.0,
            monitors: monitors.clone(),
            monitors_ema: monitors,
        };
        let mut rec = Recorder::default();
        LogStats.on_train_batch_end(&mut rec, &out, 8);
        LogStats.on_validation_batch_end(&mut rec, 0.25, 8);
        let names: Vec<&str> = rec.0.iter().map(|(n, _, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["train_loss", "train_loss_ema", "flow_loss", "flow_loss_ema", "loss_val"]
        );
        assert!(rec.0.iter().all(|(_, _, b)| *b == 8));
    }

    #[test]
    fn fan_out_feeds_epoch_metrics() {
        let mut m = EpochMetrics::new();
        let mut rec = Recorder::default();
        {
            let mut both = (&mut m, &mut rec);
            LogStats.on_validation_batch_end(&mut both, 2.0, 4);
        }
        assert_eq!(m.epoch_mean("loss_val"), Some(2.0));
        assert_eq!(rec.0.len(), 1);
    }

    #[test]
    fn top_k_keeps_best_and_evicts_worst() {
        let tmp = tempfile::tempdir().unwrap();
        let mut co = CheckpointCoordinator::safetensors(true);
        let mut cb = ModelCheckpoint::new(CheckpointPolicy {
            dirpath: tmp.path().to_path_buf(),
            monitor: Some("loss_val".to_string()),
            mode: MonitorMode::Min,
            save_top_k: 2,
            save_last: true,
            ..CheckpointPolicy::default()
        });
        let losses = [3.0f32, 1.0, 2.0, 5.0];
        for (epoch, loss) in losses.iter().enumerate() {
            let mut metrics = BTreeMap::new();
            metrics.insert("loss_val".to_string(), *loss);
            let step = 10 * (epoch as u64 + 1);
            cb.on_epoch_end(&mut co, &tree(*loss), &tree(*loss), epoch as u64, step, &metrics)
                .unwrap();
        }
        let kept: Vec<f32> = cb.kept().map(|(s, _)| s).collect();
        assert_eq!(kept, vec![1.0, 2.0]);
        assert!(!tmp.path().join("epoch_0-step_10").exists());
        assert!(!tmp.path().join("epoch_0-step_10_ema").exists());
        assert!(!tmp.path().join("epoch_3-step_40").exists());

        let (best, _, _) = co.load_pair(cb.best_path()).unwrap();
        assert_eq!(best, tree(1.0));
        let (last, last_ema, marker) = co.load_pair(cb.last_path()).unwrap();
        assert_eq!(last, tree(5.0));
        assert_eq!(last_ema, tree(5.0));
        assert_eq!(marker.global_step, 40);
    }

    #[test]
    fn missing_monitor_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut co = CheckpointCoordinator::safetensors(true);
        let mut cb = ModelCheckpoint::new(CheckpointPolicy {
            dirpath: tmp.path().to_path_buf(),
            monitor: Some("loss_val".to_string()),
            ..CheckpointPolicy::default()
        });
        let r = cb.on_epoch_end(&mut co, &tree(0.0), &tree(0.0), 0, 1, &BTreeMap::new());
        assert!(matches!(r, Err(Error::Checkpoint(_))));
    }

    #[test]
    fn unmonitored_keeps_latest_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut co = CheckpointCoordinator::safetensors(false);
        let mut cb = ModelCheckpoint::new(CheckpointPolicy {
            dirpath: tmp.path().to_path_buf(),
            save_last: false,
            ..CheckpointPolicy::default()
        });
        for step in 1..=3u64 {
            cb.on_epoch_end(&mut co, &tree(step as f32), &tree(0.0), step, step, &BTreeMap::new())
                .unwrap();
        }
        assert_eq!(cb.kept().count(), 1);
        assert_eq!(cb.best_model_path(), Some(tmp.path().join("epoch_3-step_3.ckpt").as_path()));
        assert!(!tmp.path().join("epoch_1-step_1").exists());
        assert!(cb.last_model_path().is_none());
    }
}
