//! # scoresde
//!
//! Score-based diffusion training as a library primitive.
//!
//! This crate is intentionally small:
//!
//! - it implements the **score-matching loss**, a **training step** with an EMA shadow of the
//!   parameters, **reverse-SDE sampling**, and **paired (raw, EMA) checkpoints**,
//! - the network and the noise schedule are opaque capabilities ([`model::ScoreModel`],
//!   [`diffusion::DiffusionProcess`]) with small concrete implementations for tests and demos,
//! - it does not provide a CLI, a data loader, or a distributed runtime.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every random draw takes an [`rng::RngKey`] by value and
//!   splits it before use; a split key is never drawn from again.
//! - **Raw and EMA parameters share one structure**: every binary [`params::ParamSet`] operation
//!   checks keys and shapes first.
//! - **No hidden normalization**: the only rescaling is the EDM input/output scaling in
//!   [`score::ScoreEvaluator`], driven by a `data_std` fixed at setup.
//! - **Backend-agnostic by default**: `ndarray` only; the `burn` model is feature-gated.
//!
//! ## The objective
//!
//! For a forward SDE with marginals \(x_t \mid x_0 \sim \mathcal N(s(t)x_0, \sigma(t)^2\Sigma)\),
//! the loss is denoising score matching with \(\lambda(t) = \sigma(t)^2\) weighting in the
//! whitened metric:
//! \[
//! \mathcal L(\theta) = \mathbb E\left[\sigma(t)^2\,\big\lVert \Sigma^{-1/2}\big(\hat s_\theta(x_t,t)
//! - \nabla_{x_t}\log p(x_t\mid x_0)\big)\big\rVert^2\right],
//! \]
//! with stratified times (one uniform offset per batch).
//!
//! ## References
//!
//! - Song et al., *Score-Based Generative Modeling through SDEs* (arXiv:2011.13456):
//!   VE/VP SDEs, reverse-time sampling, probability-flow likelihoods.
//! - Karras et al., *Elucidating the Design Space of Diffusion-Based Generative Models*
//!   (arXiv:2206.00364): the input/output preconditioning used by the evaluator.
//! - Kingma et al., *Variational Diffusion Models* (arXiv:2107.00630): low-discrepancy time sampling.
//!
//! ## Module map
//!
//! - `rng`: splittable keys
//! - `params`: parameter trees
//! - `diffusion`: VE / VP processes and covariance square roots
//! - `model`, `linear`, `mlp`: the score-network contract and two ndarray baselines
//! - `score`: scaled score evaluation and score closures
//! - `loss`: stratified-time weighted score-matching loss and its gradient
//! - `optim`: SGD / Adam
//! - `train`: the training engine (setup, step, EMA, validation, prediction)
//! - `sde`: fixed-step reverse-SDE and probability-flow integrators
//! - `sampler`, `event`, `nll`: sampling entry points, constrained sampling, likelihoods
//! - `checkpoint`, `callbacks`, `metrics`: persistence and metric reporting
//! - `config`: serde configuration

pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod diffusion;
pub mod event;
pub mod linear;
pub mod loss;
pub mod metrics;
pub mod mlp;
pub mod model;
pub mod nll;
pub mod optim;
pub mod params;
pub mod rng;
pub mod sampler;
pub mod score;
pub mod sde;
pub mod train;

#[cfg(feature = "burn")]
pub mod burn_score;

/// scoresde error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("parameter structure: {0}")]
    Structure(String),
    #[error("unknown stage `{0}` (expected fit, validate or predict)")]
    UnknownStage(String),
    #[error("lifecycle: {0}")]
    Lifecycle(&'static str),
    #[error("checkpoint: {0}")]
    Checkpoint(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, Error>;
