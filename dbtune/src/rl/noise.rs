// src/rl/noise.rs
//
// Exploration noise added to latent actions during collection.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{NoiseKind, NoiseParams};
use crate::error::{Result, TuneError};

pub trait ActionNoise {
    fn sample(&mut self) -> Vec<f32>;

    /// Called at every episode boundary.
    fn reset(&mut self);
}

fn standard(sigma: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, sigma)
        .map_err(|e| TuneError::invalid_config("noise.sigma", e.to_string()))
}

/// Independent Gaussian noise per dimension.
pub struct NormalNoise {
    dim: usize,
    dist: Normal<f64>,
    rng: ChaCha8Rng,
}

impl NormalNoise {
    pub fn new(dim: usize, sigma: f64, seed: u64) -> Result<Self> {
        Ok(Self {
            dim,
            dist: standard(sigma)?,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl ActionNoise for NormalNoise {
    fn sample(&mut self) -> Vec<f32> {
        (0..self.dim)
            .map(|_| self.dist.sample(&mut self.rng) as f32)
            .collect()
    }

    fn reset(&mut self) {}
}

/// Temporally correlated Ornstein-Uhlenbeck noise, reverting to zero.
pub struct OrnsteinUhlenbeckNoise {
    theta: f64,
    dt: f64,
    sigma: f64,
    unit: Normal<f64>,
    state: Vec<f64>,
    rng: ChaCha8Rng,
}

impl OrnsteinUhlenbeckNoise {
    pub fn new(dim: usize, sigma: f64, theta: f64, dt: f64, seed: u64) -> Result<Self> {
        if dt.is_nan() || dt <= 0.0 {
            return Err(TuneError::invalid_config("noise.dt", "dt must be > 0"));
        }
        Ok(Self {
            theta,
            dt,
            sigma,
            unit: standard(1.0)?,
            state: vec![0.0; dim],
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }
}

impl ActionNoise for OrnsteinUhlenbeckNoise {
    fn sample(&mut self) -> Vec<f32> {
        let scale = self.sigma * self.dt.sqrt();
        for x in self.state.iter_mut() {
            let z = self.unit.sample(&mut self.rng);
            *x += self.theta * (0.0 - *x) * self.dt + scale * z;
        }
        self.state.iter().map(|x| *x as f32).collect()
    }

    fn reset(&mut self) {
        self.state.iter_mut().for_each(|x| *x = 0.0);
    }
}

pub fn build_noise(
    params: &NoiseParams,
    dim: usize,
    seed: u64,
) -> Result<Option<Box<dyn ActionNoise>>> {
    let noise: Box<dyn ActionNoise> = match params.kind {
        NoiseKind::None => return Ok(None),
        NoiseKind::Normal => Box::new(NormalNoise::new(dim, params.sigma, seed)?),
        NoiseKind::Ou => Box::new(OrnsteinUhlenbeckNoise::new(
            dim,
            params.sigma,
            params.theta,
            params.dt,
            seed,
        )?),
    };
    Ok(Some(noise))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_noise_is_seeded() {
        let mut a = NormalNoise::new(3, 0.5, 9).unwrap();
        let mut b = NormalNoise::new(3, 0.5, 9).unwrap();
        assert_eq!(a.sample(), b.sample());
        assert_eq!(a.sample().len(), 3);
    }

    #[test]
    fn test_zero_sigma_is_silent() {
        let mut n = NormalNoise::new(4, 0.0, 1).unwrap();
        assert!(n.sample().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_ou_reset_returns_to_origin() {
        let mut ou = OrnsteinUhlenbeckNoise::new(2, 1.0, 0.15, 0.01, 5).unwrap();
        for _ in 0..10 {
            ou.sample();
        }
        ou.reset();
        assert!(ou.state.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_build_noise_none() {
        let params = NoiseParams {
            kind: NoiseKind::None,
            ..NoiseParams::default()
        };
        assert!(build_noise(&params, 2, 0).unwrap().is_none());
        assert!(build_noise(&NoiseParams::default(), 2, 0).unwrap().is_some());
    }
}
