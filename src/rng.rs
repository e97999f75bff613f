//! Splittable deterministic random streams.
//!
//! Every consumer of randomness takes an [`RngKey`] by value and splits it before drawing.
//! `split` consumes the parent, so a key that has been split cannot be drawn from again
//! without an explicit `clone()`; the only place that clones on purpose is the EMA loss
//! replay in `train`, which must see the exact same time/noise draw as the raw loss.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// A 256-bit ChaCha seed used as a functional random key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RngKey {
    seed: [u8; 32],
}

impl RngKey {
    /// Root key derived from a `u64` seed.
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self { seed: bytes }
    }

    /// Split into two independent keys. The parent is consumed.
    pub fn split(self) -> (RngKey, RngKey) {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        rng.fill_bytes(&mut a);
        rng.fill_bytes(&mut b);
        (RngKey { seed: a }, RngKey { seed: b })
    }

    /// Split into `n` independent keys. The parent is consumed.
    pub fn split_n(self, n: usize) -> Vec<RngKey> {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        (0..n)
            .map(|_| {
                let mut s = [0u8; 32];
                rng.fill_bytes(&mut s);
                RngKey { seed: s }
            })
            .collect()
    }

    /// Turn the key into a generator. The key is consumed.
    pub fn into_rng(self) -> ChaCha8Rng {
        ChaCha8Rng::from_seed(self.seed)
    }
}
