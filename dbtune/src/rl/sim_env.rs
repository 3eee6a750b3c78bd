// src/rl/sim_env.rs
//
// Synthetic database environment.
//
// A seeded stand-in for the live database so the tuning loop can run end to
// end without Postgres:
// - the latent action maps to one value in [0, 1] per knob;
// - workload latency is a convex bowl around a per-seed optimum, plus
//   bounded multiplicative noise;
// - latencies above the timeout flag `did_anything_time_out`;
// - crossing knob thresholds emits index DDL and per-query hints.
//
// Given the same seed and actions, every run is identical.

use std::collections::{BTreeMap, BTreeSet};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::agent::ConfigDelta;
use crate::error::{Result, TuneError};
use crate::rl::env::{Environment, ResetOutcome, StepInfo, StepOutcome};
use crate::rl::target_reset::TrackedResetState;

/// Knob value a fresh database starts from.
pub const PRISTINE_KNOB: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct SimEnvConfig {
    /// Steps per episode before truncation.
    pub horizon: usize,
    /// Number of knobs; equals the latent action dimension.
    pub num_knobs: usize,
    /// Queries in the synthetic workload.
    pub num_queries: usize,
    /// Workload latency at the optimum, in ms.
    pub base_latency_ms: f64,
    /// Curvature of the latency bowl.
    pub sensitivity: f64,
    /// Relative latency noise amplitude; 0 disables noise.
    pub noise: f64,
    /// Workload latency above which the evaluation counts as timed out.
    pub timeout_ms: f64,
}

impl Default for SimEnvConfig {
    fn default() -> Self {
        Self {
            horizon: 5,
            num_knobs: 8,
            num_queries: 4,
            base_latency_ms: 100.0,
            sensitivity: 4.0,
            noise: 0.02,
            timeout_ms: 400.0,
        }
    }
}

impl SimEnvConfig {
    /// No noise (for deterministic tests).
    pub fn deterministic() -> Self {
        Self {
            noise: 0.0,
            ..Self::default()
        }
    }

    pub fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_num_knobs(mut self, num_knobs: usize) -> Self {
        self.num_knobs = num_knobs;
        self
    }
}

/// Configuration-state handle of the synthetic database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnobState {
    pub values: Vec<f64>,
}

impl KnobState {
    pub fn pristine(num_knobs: usize) -> Self {
        Self {
            values: vec![PRISTINE_KNOB; num_knobs],
        }
    }

    fn knob_name(i: usize) -> String {
        format!("knob_{}", i)
    }

    /// Knob values are persisted at this precision; deltas compare at it too.
    fn knob_value(v: f64) -> String {
        format!("{:.3}", v)
    }

    fn index_name(i: usize) -> String {
        format!("idx_k{}", i)
    }

    /// Knob 0 and every even knob after it gate a synthetic index.
    fn has_index(&self, i: usize) -> bool {
        i % 2 == 0 && self.values[i] > 0.5
    }

    /// Hints the odd knobs attach to query `q`.
    fn hints(&self, q: usize) -> Vec<String> {
        let mut hints = Vec::new();
        for (i, v) in self.values.iter().enumerate() {
            if i % 2 == 1 && (i / 2) % 2 == q % 2 && *v > 0.5 {
                hints.push(format!("SET (knob_{} on)", i));
            }
        }
        hints
    }

    /// Every knob as it appears in a delta.
    pub fn sysknobs(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (Self::knob_name(i), Self::knob_value(*v)))
            .collect()
    }

    /// Names of the synthetic indexes that currently exist.
    pub fn indexes(&self) -> BTreeSet<String> {
        (0..self.values.len())
            .filter(|i| self.has_index(*i))
            .map(Self::index_name)
            .collect()
    }

    /// Non-empty hint lists per query id.
    pub fn qknobs(&self, num_queries: usize) -> BTreeMap<String, Vec<String>> {
        (0..num_queries)
            .map(|q| (format!("Q{}", q + 1), self.hints(q)))
            .filter(|(_, hints)| !hints.is_empty())
            .collect()
    }

    /// Delta that takes `self` to `next`.
    pub fn delta_to(&self, next: &KnobState, num_queries: usize) -> ConfigDelta {
        let mut delta = ConfigDelta::default();
        for i in 0..self.values.len() {
            let value = Self::knob_value(next.values[i]);
            if Self::knob_value(self.values[i]) != value {
                delta.sysknobs.insert(Self::knob_name(i), value);
            }
            match (self.has_index(i), next.has_index(i)) {
                (false, true) => delta.indexes.push(format!(
                    "CREATE INDEX {} ON workload (c{})",
                    Self::index_name(i),
                    i
                )),
                (true, false) => delta
                    .indexes
                    .push(format!("DROP INDEX {}", Self::index_name(i))),
                _ => {}
            }
        }
        for q in 0..num_queries {
            let hints = next.hints(q);
            if hints != self.hints(q) {
                delta.qknobs.insert(format!("Q{}", q + 1), hints);
            }
        }
        delta
    }
}

pub struct SimTuningEnv {
    config: SimEnvConfig,
    optimum: Vec<f64>,
    query_weights: Vec<f64>,
    state: KnobState,
    baseline_latency: f64,
    t: usize,
    seed: u64,
    rng: ChaCha8Rng,
}

impl SimTuningEnv {
    pub fn new(config: SimEnvConfig, seed: u64) -> Result<Self> {
        if config.horizon == 0 || config.num_knobs == 0 || config.num_queries == 0 {
            return Err(TuneError::invalid_config(
                "sim_env",
                "horizon, num_knobs and num_queries must be > 0",
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let optimum = (0..config.num_knobs)
            .map(|_| rng.gen_range(0.15..0.85))
            .collect();
        let raw: Vec<f64> = (0..config.num_queries)
            .map(|_| rng.gen_range(0.5..1.5))
            .collect();
        let total: f64 = raw.iter().sum();
        let query_weights = raw.iter().map(|w| w / total).collect();

        let mut env = Self {
            state: KnobState::pristine(config.num_knobs),
            config,
            optimum,
            query_weights,
            baseline_latency: 0.0,
            t: 0,
            seed,
            rng,
        };
        env.baseline_latency = env.noiseless_latency(&env.state);
        Ok(env)
    }

    pub fn config(&self) -> &SimEnvConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn optimum(&self) -> &[f64] {
        &self.optimum
    }

    pub fn baseline_latency(&self) -> f64 {
        self.baseline_latency
    }

    pub fn tick(&self) -> usize {
        self.t
    }

    /// Map a latent action to knob values: `[-1, 1] -> [0, 1]`, clamped.
    pub fn decode_action(action: &[f32]) -> KnobState {
        KnobState {
            values: action
                .iter()
                .map(|a| ((*a as f64 + 1.0) / 2.0).clamp(0.0, 1.0))
                .collect(),
        }
    }

    fn noiseless_latency(&self, state: &KnobState) -> f64 {
        let dist: f64 = state
            .values
            .iter()
            .zip(&self.optimum)
            .map(|(v, o)| (v - o) * (v - o))
            .sum();
        self.config.base_latency_ms * (1.0 + self.config.sensitivity * dist)
    }

    fn measure(&mut self, state: &KnobState) -> (f64, BTreeMap<String, f64>) {
        let mut latency = self.noiseless_latency(state);
        if self.config.noise > 0.0 {
            latency *= 1.0 + self.rng.gen_range(-self.config.noise..self.config.noise);
        }
        let per_query = self
            .query_weights
            .iter()
            .enumerate()
            .map(|(q, w)| (format!("Q{}", q + 1), latency * w))
            .collect();
        (latency, per_query)
    }

    fn observation(&self, latency: f64) -> Vec<f32> {
        let mut obs: Vec<f32> = self.state.values.iter().map(|v| *v as f32).collect();
        obs.push((latency / self.baseline_latency) as f32);
        obs
    }
}

impl Environment for SimTuningEnv {
    type State = KnobState;

    fn reset(&mut self, target: Option<&TrackedResetState<KnobState>>) -> Result<ResetOutcome> {
        self.t = 0;
        let next = match target {
            Some(t) => {
                if t.config_state.values.len() != self.config.num_knobs {
                    return Err(TuneError::DimensionMismatch {
                        what: "reset target knobs",
                        expected: self.config.num_knobs,
                        actual: t.config_state.values.len(),
                    });
                }
                t.config_state.clone()
            }
            None => KnobState::pristine(self.config.num_knobs),
        };
        // Restoring a snapshot is itself a configuration change.
        let delta = self.state.delta_to(&next, self.config.num_queries);
        self.state = next;

        let state = self.state.clone();
        let (latency, per_query) = self.measure(&state);
        Ok(ResetOutcome {
            observation: self.observation(latency),
            info: StepInfo {
                metric: Some(latency),
                baseline_metric: Some(self.baseline_latency),
                query_metric_data: Some(per_query),
                config_delta: Some(delta),
                ..StepInfo::default()
            },
        })
    }

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome> {
        if action.len() != self.config.num_knobs {
            return Err(TuneError::DimensionMismatch {
                what: "sim action",
                expected: self.config.num_knobs,
                actual: action.len(),
            });
        }

        let next = Self::decode_action(action);
        let delta = self.state.delta_to(&next, self.config.num_queries);
        self.state = next;
        self.t += 1;

        let state = self.state.clone();
        let (latency, per_query) = self.measure(&state);
        let reward = (self.baseline_latency - latency) / self.baseline_latency;

        Ok(StepOutcome {
            observation: self.observation(latency),
            reward,
            terminated: false,
            truncated: self.t >= self.config.horizon,
            info: StepInfo {
                metric: Some(latency),
                did_anything_time_out: latency > self.config.timeout_ms,
                query_metric_data: Some(per_query),
                config_delta: Some(delta),
                ..StepInfo::default()
            },
        })
    }

    fn config_state(&self) -> Option<KnobState> {
        Some(self.state.clone())
    }

    fn observation_dim(&self) -> usize {
        self.config.num_knobs + 1
    }

    fn action_dim(&self) -> usize {
        self.config.num_knobs
    }
}
