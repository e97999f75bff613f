//! Event-conditioned sampling with an analytic score.
//!
//! Data is a smooth random walk `x_t = x_{t-1} + 0.3 z_t` over 8 steps, so its score is known in
//! closed form. Pinning `x_7 = 2.0` should bend the whole path toward the endpoint.

use ndarray::{Array2, Array3, ArrayView3, Axis};
use tracing_subscriber::EnvFilter;

use scoresde::diffusion::{DiffusionProcess, VarianceExploding};
use scoresde::event::{EventScore, PinnedValues};
use scoresde::rng::RngKey;
use scoresde::sampler::EVENT_REG;
use scoresde::score::FnScore;
use scoresde::sde::reverse_sde_sample;

const LEN: usize = 8;
const STEP: f32 = 0.3;

/// Covariance of the walk, `C[i][j] = STEP^2 (min(i, j) + 1)`.
fn walk_cov() -> Array2<f32> {
    Array2::from_shape_fn((LEN, LEN), |(i, j)| STEP * STEP * (i.min(j) + 1) as f32)
}

/// Inverse of a small SPD matrix by Gauss-Jordan.
fn invert(a: &Array2<f32>) -> Option<Array2<f32>> {
    let n = a.nrows();
    let mut m = a.clone();
    let mut inv = Array2::<f32>::eye(n);
    for c in 0..n {
        let p = m[[c, c]];
        if p.abs() < 1e-12 {
            return None;
        }
        for k in 0..n {
            m[[c, k]] /= p;
            inv[[c, k]] /= p;
        }
        for r in 0..n {
            if r != c {
                let f = m[[r, c]];
                for k in 0..n {
                    m[[r, k]] -= f * m[[c, k]];
                    inv[[r, k]] -= f * inv[[c, k]];
                }
            }
        }
    }
    Some(inv)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ve = VarianceExploding::new(0.01, 5.0)?;
    let cov = walk_cov();
    // score of N(0, C + sigma^2 I) is -(C + sigma^2 I)^{-1} x, per example
    let score = FnScore(|x: &ArrayView3<f32>, t: &ArrayView3<f32>| -> scoresde::Result<Array3<f32>> {
        let mut s = Array3::<f32>::zeros(x.raw_dim());
        for b in 0..x.dim().0 {
            let sig = ve.sigma(t[[b, 0, 0]]);
            let mut k = cov.clone();
            k.diag_mut().mapv_inplace(|v| v + sig * sig);
            let kinv = invert(&k).ok_or(scoresde::Error::Domain("singular covariance"))?;
            let xb = x.index_axis(Axis(0), b).index_axis(Axis(1), 0).to_owned();
            let sb = kinv.dot(&xb).mapv(|v| -v);
            s.index_axis_mut(Axis(0), b).index_axis_mut(Axis(1), 0).assign(&sb);
        }
        Ok(s)
    });

    let pins = PinnedValues::new(vec![(LEN - 1, 0, 2.0)])?;
    let conditioned = EventScore::new(&ve, &score, &pins, EVENT_REG)?;
    let shape = (256, LEN, 1);

    let plain = reverse_sde_sample(&ve, &score, RngKey::new(1), shape, 1.0, 300, false)?.sample;
    let pinned = reverse_sde_sample(&ve, &conditioned, RngKey::new(1), shape, 1.0, 300, false)?.sample;

    println!("  t   plain mean   pinned mean   (pinned target at t={} is 2.0)", LEN - 1);
    for t in 0..LEN {
        let a = plain.index_axis(Axis(1), t).mean().unwrap_or(f32::NAN);
        let b = pinned.index_axis(Axis(1), t).mean().unwrap_or(f32::NAN);
        println!("{t:>3}   {a:>+10.3}   {b:>+11.3}");
    }
    Ok(())
}
