// src/rl/env.rs
//
// Environment collaborator interface and the explicit stage pipeline.
//
// A base `Environment` (the live database, or the synthetic stand-in) is
// wrapped by an ordered list of `Stage`s. Stages are stored innermost first:
// - reset requests flow outer -> inner, so the outermost stage sees the
//   request first and may rewrite its target;
// - reset and step responses flow inner -> outer.
//
// The pipeline also owns auto-reset: when a step ends an episode, the true
// terminal observation is copied into `info.terminal_observation` and the
// observation handed back is the first one of the next episode. The reset's
// config delta is merged after the step's own, so folding step deltas in
// order always lands on the live configuration.

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::agent::ConfigDelta;
use crate::error::{Result, TuneError};
use crate::rl::target_reset::TrackedResetState;

/// Typed auxiliary info reported with every reset and step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInfo {
    /// Workload performance metric for this step.
    pub metric: Option<f64>,
    /// Metric of the untouched configuration; reported on fresh resets.
    pub baseline_metric: Option<f64>,
    /// Whether any query or the workload as a whole hit its timeout.
    pub did_anything_time_out: bool,
    /// True last observation of an episode that was auto-reset.
    pub terminal_observation: Option<Vec<f32>>,
    /// Per-query metric breakdown.
    pub query_metric_data: Option<BTreeMap<String, f64>>,
    /// Configuration change applied by this step or reset. After an
    /// auto-reset it also holds the jump to the next episode's start.
    pub config_delta: Option<ConfigDelta>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome {
    pub observation: Vec<f32>,
    pub info: StepInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub observation: Vec<f32>,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: StepInfo,
}

impl StepOutcome {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Gym-style environment.
///
/// `State` is the opaque configuration-state handle; it is what tracked
/// reset snapshots carry and what a targeted reset restores.
pub trait Environment {
    type State: Clone + 'static;

    fn reset(&mut self, target: Option<&TrackedResetState<Self::State>>) -> Result<ResetOutcome>;

    fn step(&mut self, action: &[f32]) -> Result<StepOutcome>;

    /// Current configuration-state handle, if the environment has one.
    fn config_state(&self) -> Option<Self::State>;

    fn observation_dim(&self) -> usize;

    fn action_dim(&self) -> usize;
}

/// Reset request travelling outer -> inner through the stages.
#[derive(Debug, Clone)]
pub struct ResetRequest<S> {
    /// Snapshot to resume from; `None` means a fresh reset.
    pub target: Option<TrackedResetState<S>>,
}

impl<S> Default for ResetRequest<S> {
    fn default() -> Self {
        Self { target: None }
    }
}

/// One behaviour-augmenting stage of the pipeline.
///
/// Every hook defaults to a pass-through. `state` is the base environment's
/// configuration-state handle at the time the response was produced.
pub trait Stage<S> {
    fn name(&self) -> &'static str;

    fn on_reset_request(&mut self, _request: &mut ResetRequest<S>) -> Result<()> {
        Ok(())
    }

    fn on_reset(&mut self, _outcome: &mut ResetOutcome, _state: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn on_step(&mut self, _outcome: &mut StepOutcome, _state: Option<&S>) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

/// Base environment plus its ordered stages.
pub struct Pipeline<E: Environment> {
    env: E,
    stages: Vec<Box<dyn Stage<E::State>>>,
}

impl<E: Environment> Pipeline<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            stages: Vec::new(),
        }
    }

    /// Push a stage outside all existing ones.
    pub fn with_stage(mut self, stage: impl Stage<E::State> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Stage names, innermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Typed read access to the first stage of type `T`.
    pub fn stage<T: 'static>(&self) -> Option<&T> {
        self.stages
            .iter()
            .find_map(|s| s.as_any().downcast_ref::<T>())
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    pub fn observation_dim(&self) -> usize {
        self.env.observation_dim()
    }

    pub fn action_dim(&self) -> usize {
        self.env.action_dim()
    }

    pub fn reset(&mut self) -> Result<ResetOutcome> {
        let mut request = ResetRequest::default();
        for stage in self.stages.iter_mut().rev() {
            stage.on_reset_request(&mut request)?;
        }

        let mut outcome = self.env.reset(request.target.as_ref())?;
        self.check_observation(&outcome.observation)?;

        let state = self.env.config_state();
        for stage in self.stages.iter_mut() {
            stage.on_reset(&mut outcome, state.as_ref())?;
        }
        Ok(outcome)
    }

    /// Step the base environment and run the step hooks.
    ///
    /// On episode end the pipeline resets itself; the returned observation is
    /// then the next episode's first one and the true terminal observation is
    /// in `info.terminal_observation`.
    pub fn step(&mut self, action: &[f32]) -> Result<StepOutcome> {
        if action.len() != self.env.action_dim() {
            return Err(TuneError::DimensionMismatch {
                what: "environment action",
                expected: self.env.action_dim(),
                actual: action.len(),
            });
        }

        let mut outcome = self.env.step(action)?;
        self.check_observation(&outcome.observation)?;

        let state = self.env.config_state();
        for stage in self.stages.iter_mut() {
            stage.on_step(&mut outcome, state.as_ref())?;
        }

        if outcome.done() {
            let first = self.reset()?;
            let terminal = std::mem::replace(&mut outcome.observation, first.observation);
            outcome.info.terminal_observation = Some(terminal);
            if let Some(reset_delta) = &first.info.config_delta {
                outcome
                    .info
                    .config_delta
                    .get_or_insert_with(ConfigDelta::default)
                    .merge(reset_delta);
            }
        }
        Ok(outcome)
    }

    fn check_observation(&self, observation: &[f32]) -> Result<()> {
        if observation.len() != self.env.observation_dim() {
            return Err(TuneError::DimensionMismatch {
                what: "environment observation",
                expected: self.env.observation_dim(),
                actual: observation.len(),
            });
        }
        Ok(())
    }
}

/// Running mean/variance observation normalizer (Welford).
///
/// Statistics are updated from every observation that passes through, then
/// the observation is standardized and clipped to `[-clip, clip]`.
#[derive(Debug, Clone)]
pub struct NormalizeObservation {
    count: f64,
    mean: Vec<f64>,
    m2: Vec<f64>,
    clip: f32,
    epsilon: f64,
}

impl NormalizeObservation {
    pub fn new(dim: usize) -> Self {
        Self::with_clip(dim, 10.0)
    }

    pub fn with_clip(dim: usize, clip: f32) -> Self {
        Self {
            count: 0.0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            clip,
            epsilon: 1e-8,
        }
    }

    pub fn count(&self) -> u64 {
        self.count as u64
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn variance(&self) -> Vec<f64> {
        if self.count < 2.0 {
            return vec![1.0; self.mean.len()];
        }
        self.m2.iter().map(|m| m / self.count).collect()
    }

    fn update(&mut self, observation: &[f32]) -> Result<()> {
        if observation.len() != self.mean.len() {
            return Err(TuneError::DimensionMismatch {
                what: "normalized observation",
                expected: self.mean.len(),
                actual: observation.len(),
            });
        }
        self.count += 1.0;
        for (i, x) in observation.iter().enumerate() {
            let x = *x as f64;
            let delta = x - self.mean[i];
            self.mean[i] += delta / self.count;
            self.m2[i] += delta * (x - self.mean[i]);
        }
        Ok(())
    }

    fn normalize(&self, observation: &mut [f32]) {
        let var = self.variance();
        for (i, x) in observation.iter_mut().enumerate() {
            let z = (*x as f64 - self.mean[i]) / (var[i] + self.epsilon).sqrt();
            *x = (z as f32).clamp(-self.clip, self.clip);
        }
    }
}

impl<S> Stage<S> for NormalizeObservation {
    fn name(&self) -> &'static str {
        "normalize_observation"
    }

    fn on_reset(&mut self, outcome: &mut ResetOutcome, _state: Option<&S>) -> Result<()> {
        self.update(&outcome.observation)?;
        self.normalize(&mut outcome.observation);
        Ok(())
    }

    fn on_step(&mut self, outcome: &mut StepOutcome, _state: Option<&S>) -> Result<()> {
        self.update(&outcome.observation)?;
        self.normalize(&mut outcome.observation);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
