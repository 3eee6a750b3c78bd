// src/rl/curriculum.rs
//
// Latent space curriculum (LSC).
//
// The curriculum adds a per-position bias to every proposed latent action.
// Two clocks drive it:
// - a step clock, advanced once per environment step, selecting which
//   horizon position's shift applies to the current action;
// - an episode clock, advanced at episode boundaries, which on schedule
//   widens every shift by its increment (wrapping modulo max).
//
// Widening only happens at episode boundaries, so experience already in the
// replay buffer was always collected under a single, consistent bias.
//
// One curriculum is built per tuning run and passed explicitly to whoever
// needs to read the bias or scale.

use tracing::info;

use crate::config::{CurriculumParams, EmbeddingParams};
use crate::error::{Result, TuneError};

/// Returned by [`Curriculum::current_scale`] when the curriculum is disabled.
pub const INACTIVE_SCALE: f32 = -1.0;

/// Length of [`Curriculum::current_scale`], enabled or not.
pub const SCALE_DIM: usize = 1;

/// Euclidean remainder clamped to [0, max); float rounding can land exactly on max.
fn wrap(value: f64, max: f64) -> f64 {
    let r = value.rem_euclid(max);
    if r >= max {
        0.0
    } else {
        r
    }
}

#[derive(Debug, Clone)]
pub struct Curriculum {
    enabled: bool,
    frozen: bool,
    horizon: usize,
    latent_dim: usize,
    output_scale: f64,
    shift: Vec<f64>,
    increment: Vec<f64>,
    max: Vec<f64>,
    shift_after: u64,
    shift_eps_freq: u64,
    num_steps: u64,
    num_episodes: u64,
}

impl Curriculum {
    pub fn new(
        horizon: usize,
        params: &CurriculumParams,
        embedding: &EmbeddingParams,
    ) -> Result<Self> {
        if horizon == 0 {
            return Err(TuneError::invalid_config("horizon", "horizon must be > 0"));
        }
        if params.shift_eps_freq == 0 {
            return Err(TuneError::invalid_config(
                "curriculum.shift_eps_freq",
                "shift_eps_freq must be >= 1",
            ));
        }

        let initial = params.initial.expand(horizon, "curriculum.initial")?;
        let increment = params.increment.expand(horizon, "curriculum.increment")?;
        let max = params.max.expand(horizon, "curriculum.max")?;
        if max.iter().any(|m| m.is_nan() || *m <= 0.0) {
            return Err(TuneError::invalid_config(
                "curriculum.max",
                "every max entry must be > 0",
            ));
        }

        // Keep the [0, max) invariant from the very first step.
        let shift = initial
            .iter()
            .zip(&max)
            .map(|(s, m)| wrap(*s, *m))
            .collect::<Vec<_>>();

        info!(?shift, ?increment, ?max, enabled = params.enabled, "curriculum initialised");

        Ok(Self {
            enabled: params.enabled,
            frozen: false,
            horizon,
            latent_dim: embedding.latent_dim,
            output_scale: embedding.output_scale,
            shift,
            increment,
            max,
            shift_after: params.shift_after,
            shift_eps_freq: params.shift_eps_freq,
            num_steps: 0,
            num_episodes: 0,
        })
    }

    fn position(&self) -> usize {
        (self.num_steps % self.horizon as u64) as usize
    }

    /// Add the current position's bias to a latent action.
    ///
    /// Identity when disabled. Otherwise the action must have exactly
    /// `latent_dim` entries.
    pub fn apply_bias(&self, action: &[f32]) -> Result<Vec<f32>> {
        if !self.enabled {
            return Ok(action.to_vec());
        }

        if action.len() != self.latent_dim {
            return Err(TuneError::DimensionMismatch {
                what: "curriculum action",
                expected: self.latent_dim,
                actual: action.len(),
            });
        }

        let bias = self.current_bias() as f32;
        Ok(action.iter().map(|a| a + bias).collect())
    }

    /// Bias applied at the current position, in output units.
    pub fn current_bias(&self) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.shift[self.position()] * self.output_scale
    }

    /// Current shift relative to its max, mapped into [-1, 1].
    ///
    /// Returns `[INACTIVE_SCALE]` when disabled.
    pub fn current_scale(&self) -> Vec<f32> {
        if !self.enabled {
            return vec![INACTIVE_SCALE];
        }
        let pos = self.position();
        let rel = self.shift[pos] / self.max[pos];
        vec![(rel * 2.0 - 1.0) as f32]
    }

    /// Map a normalized value in [-1, 1] back to a raw bias.
    pub fn inverse_scale(&self, value: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        ((value + 1.0) / 2.0) * self.max[0] * self.output_scale
    }

    pub fn advance(&mut self) {
        if self.frozen || !self.enabled {
            return;
        }
        self.num_steps += 1;
    }

    /// Episode boundary: bump the episode clock and widen on schedule.
    pub fn reset(&mut self) {
        if self.frozen || !self.enabled {
            return;
        }

        self.num_episodes += 1;
        self.num_steps = 0;

        if !self.widens_at(self.num_episodes) {
            return;
        }

        for ((s, inc), m) in self.shift.iter_mut().zip(&self.increment).zip(&self.max) {
            *s = wrap(*s + inc, *m);
        }
        info!(episode = self.num_episodes, shift = ?self.shift, "curriculum bias update");
    }

    /// Whether completing episode `episode` triggers a widening.
    pub fn widens_at(&self, episode: u64) -> bool {
        episode > self.shift_after && (episode - self.shift_after) % self.shift_eps_freq == 0
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn shift(&self) -> &[f64] {
        &self.shift
    }

    pub fn max(&self) -> &[f64] {
        &self.max
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    pub fn num_episodes(&self) -> u64 {
        self.num_episodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerPosition;

    fn params(shift_after: u64, shift_eps_freq: u64) -> CurriculumParams {
        CurriculumParams {
            enabled: true,
            initial: PerPosition::Uniform(0.0),
            increment: PerPosition::Uniform(0.3),
            max: PerPosition::Uniform(1.0),
            shift_after,
            shift_eps_freq,
        }
    }

    fn embedding(latent_dim: usize, output_scale: f64) -> EmbeddingParams {
        EmbeddingParams {
            latent_dim,
            output_scale,
        }
    }

    #[test]
    fn test_widening_schedule() {
        let mut lsc = Curriculum::new(3, &params(5, 3), &embedding(2, 1.0)).unwrap();

        let mut widened_at = Vec::new();
        for _ in 0..15 {
            let before = lsc.shift().to_vec();
            lsc.reset();
            if lsc.shift() != before.as_slice() {
                widened_at.push(lsc.num_episodes());
            }
        }

        assert_eq!(widened_at, vec![8, 11, 14]);
    }

    #[test]
    fn test_shift_stays_within_max() {
        let p = CurriculumParams {
            enabled: true,
            initial: PerPosition::Positions(vec![0.9, 2.5, -0.2]),
            increment: PerPosition::Positions(vec![0.7, 1.3, 0.45]),
            max: PerPosition::Positions(vec![1.0, 2.0, 0.5]),
            shift_after: 0,
            shift_eps_freq: 1,
        };
        let mut lsc = Curriculum::new(3, &p, &embedding(1, 1.0)).unwrap();

        for _ in 0..200 {
            for (s, m) in lsc.shift().iter().zip(lsc.max()) {
                assert!(*s >= 0.0 && *s < *m, "shift {} escaped [0, {})", s, m);
            }
            lsc.reset();
        }
    }

    #[test]
    fn test_apply_bias_uses_step_position_and_output_scale() {
        let p = CurriculumParams {
            enabled: true,
            initial: PerPosition::Positions(vec![0.1, 0.2]),
            increment: PerPosition::Uniform(0.0),
            max: PerPosition::Uniform(1.0),
            shift_after: 0,
            shift_eps_freq: 1,
        };
        let mut lsc = Curriculum::new(2, &p, &embedding(2, 10.0)).unwrap();

        let biased = lsc.apply_bias(&[1.0, 2.0]).unwrap();
        assert!((biased[0] - 2.0).abs() < 1e-5);
        assert!((biased[1] - 3.0).abs() < 1e-5);

        lsc.advance();
        assert!((lsc.current_bias() - 2.0).abs() < 1e-9);

        // Wraps by modulo, the counter keeps growing.
        lsc.advance();
        assert_eq!(lsc.num_steps(), 2);
        assert!((lsc.current_bias() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_bias_rejects_wrong_dimension() {
        let lsc = Curriculum::new(2, &params(0, 1), &embedding(3, 1.0)).unwrap();
        let err = lsc.apply_bias(&[0.0, 0.0]).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_disabled_is_identity() {
        let mut p = params(0, 1);
        p.enabled = false;
        p.initial = PerPosition::Uniform(0.5);
        let mut lsc = Curriculum::new(2, &p, &embedding(3, 4.0)).unwrap();

        // Any length passes through untouched.
        let action = vec![0.25, -1.5, 3.0, 7.0];
        assert_eq!(lsc.apply_bias(&action).unwrap(), action);
        assert_eq!(lsc.current_bias(), 0.0);
        assert_eq!(lsc.current_scale(), vec![INACTIVE_SCALE]);
        assert_eq!(lsc.inverse_scale(0.3), 0.0);

        lsc.advance();
        lsc.reset();
        assert_eq!(lsc.num_steps(), 0);
        assert_eq!(lsc.num_episodes(), 0);
    }

    #[test]
    fn test_frozen_holds_counters_but_answers_queries() {
        let mut lsc = Curriculum::new(2, &params(0, 1), &embedding(1, 1.0)).unwrap();
        lsc.advance();
        lsc.freeze();

        lsc.advance();
        lsc.reset();
        assert_eq!(lsc.num_steps(), 1);
        assert_eq!(lsc.num_episodes(), 0);
        assert!(lsc.apply_bias(&[0.0]).is_ok());

        lsc.unfreeze();
        lsc.reset();
        assert_eq!(lsc.num_steps(), 0);
        assert_eq!(lsc.num_episodes(), 1);
    }

    #[test]
    fn test_scale_and_inverse_scale() {
        let p = CurriculumParams {
            enabled: true,
            initial: PerPosition::Uniform(0.5),
            increment: PerPosition::Uniform(0.0),
            max: PerPosition::Uniform(2.0),
            shift_after: 0,
            shift_eps_freq: 1,
        };
        let lsc = Curriculum::new(1, &p, &embedding(1, 3.0)).unwrap();

        // 0.5 / 2.0 = 0.25 -> -0.5
        assert!((lsc.current_scale()[0] + 0.5).abs() < 1e-6);
        // (-0.5 + 1) / 2 * 2.0 * 3.0 = 1.5
        assert!((lsc.inverse_scale(-0.5) - 1.5).abs() < 1e-9);
    }
}
