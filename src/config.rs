//! Training and checkpoint configuration.
//!
//! Both structs deserialize from JSON with every field optional (`#[serde(default)]`), so a
//! config file only lists what it overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::optim::{Adam, AnyOptimizer, Sgd};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Which scalar drives checkpoint selection, and how validation reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CkptMonitor {
    TrainLoss,
    TrainLossEma,
    /// Validation samples the EMA model and reports its relative error against the batch.
    ValRelativeErrorEma,
}

impl CkptMonitor {
    /// Name of the logged metric this monitor reads.
    pub fn metric_name(self) -> &'static str {
        match self {
            CkptMonitor::TrainLoss => "train_loss",
            CkptMonitor::TrainLossEma => "train_loss_ema",
            CkptMonitor::ValRelativeErrorEma => "loss_val",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Planned number of epochs; only used to derive the EMA time constant.
    pub epochs: usize,
    /// How many EMA time constants fit into the planned run.
    pub ema_folding_count: usize,
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    /// Reverse-SDE steps per sample.
    pub time_step_count_sampling: usize,
    pub seed: u64,
    pub ckpt_monitor: CkptMonitor,
    /// Hutchinson probes per NLL evaluation.
    pub nll_probes: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            ema_folding_count: 5,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::Adam,
            time_step_count_sampling: 100,
            seed: 0,
            ckpt_monitor: CkptMonitor::TrainLossEma,
            nll_probes: 1,
        }
    }
}

impl TrainConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: TrainConfig = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::Domain("epochs must be >= 1"));
        }
        if self.ema_folding_count == 0 {
            return Err(Error::Domain("ema_folding_count must be >= 1"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(Error::Domain("learning_rate must be positive and finite"));
        }
        if self.time_step_count_sampling == 0 {
            return Err(Error::Domain("time_step_count_sampling must be >= 1"));
        }
        if self.nll_probes == 0 {
            return Err(Error::Domain("nll_probes must be >= 1"));
        }
        Ok(())
    }

    /// EMA time constant `epochs / ema_folding_count`.
    pub fn ema_ts(&self) -> f32 {
        self.epochs as f32 / self.ema_folding_count as f32
    }

    pub fn build_optimizer(&self) -> Result<AnyOptimizer> {
        Ok(match self.optimizer {
            OptimizerKind::Adam => AnyOptimizer::Adam(Adam::new(self.learning_rate)?),
            OptimizerKind::Sgd => AnyOptimizer::Sgd(Sgd::new(self.learning_rate)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub dirpath: PathBuf,
    /// Metric to rank checkpoints by; `None` keeps only the latest.
    pub monitor: Option<String>,
    pub mode: MonitorMode,
    pub save_top_k: usize,
    pub save_last: bool,
    /// `{epoch}` and `{step}` are substituted; each placeholder renders as `name_value`.
    pub filename: String,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            dirpath: PathBuf::from("checkpoints"),
            monitor: None,
            mode: MonitorMode::Min,
            save_top_k: 1,
            save_last: true,
            filename: "{epoch}-{step}".to_string(),
        }
    }
}
