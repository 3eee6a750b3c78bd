// src/config.rs
//
// Tuning parameters for one run of the online tuning loop.
//
// A params document fully defines the control loop of a run:
// - episode horizon
// - curriculum schedule (initial shift, increment, max, cadence)
// - embedding geometry (latent dimension, output scale)
// - off-policy agent settings (learning starts, train frequency, buffer)
// - exploration noise
// - target-reset tracking policy and objective
// - wall-clock tuning budget
//
// Parameters are loaded from YAML and validated before anything is built.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TuneError};
use crate::rl::rollout::{GradientSteps, TrainFreq};
use crate::rl::target_reset::{Objective, TrackingPolicy};

/// Env var overriding the tuning budget (hours).
pub const DURATION_ENV_VAR: &str = "DBTUNE_TUNE_DURATION_HOURS";

/// Upper bound on any tuning budget: one year.
pub const MAX_TUNE_DURATION_HOURS: f64 = 24.0 * 365.0;

/// Reject budgets that are not finite, not positive, or absurdly long.
pub fn check_duration_hours(field: &str, hours: f64) -> Result<f64> {
    if !hours.is_finite() || hours <= 0.0 || hours > MAX_TUNE_DURATION_HOURS {
        return Err(TuneError::invalid_config(
            field,
            format!(
                "expected a finite budget in (0, {}] hours, got {}",
                MAX_TUNE_DURATION_HOURS, hours
            ),
        ));
    }
    Ok(hours)
}

/// A per-position curriculum parameter: either one value broadcast across
/// the horizon, or an explicit value for every position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerPosition {
    Uniform(f64),
    Positions(Vec<f64>),
}

impl PerPosition {
    /// Expand to exactly `horizon` values.
    pub fn expand(&self, horizon: usize, field: &str) -> Result<Vec<f64>> {
        match self {
            PerPosition::Uniform(v) => Ok(vec![*v; horizon]),
            PerPosition::Positions(values) if values.len() == 1 => Ok(vec![values[0]; horizon]),
            PerPosition::Positions(values) => {
                if values.len() != horizon {
                    return Err(TuneError::invalid_config(
                        field,
                        format!(
                            "expected 1 or {} values (horizon), got {}",
                            horizon,
                            values.len()
                        ),
                    ));
                }
                Ok(values.clone())
            }
        }
    }
}

/// Latent space curriculum schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumParams {
    pub enabled: bool,
    /// Starting shift per horizon position.
    pub initial: PerPosition,
    /// Amount added to the shift on each widening.
    pub increment: PerPosition,
    /// Exclusive upper bound; shifts wrap modulo this.
    pub max: PerPosition,
    /// Episodes to wait before the first widening.
    pub shift_after: u64,
    /// Episodes between widenings once `shift_after` has passed.
    pub shift_eps_freq: u64,
}

impl Default for CurriculumParams {
    fn default() -> Self {
        Self {
            enabled: true,
            initial: PerPosition::Uniform(0.0),
            increment: PerPosition::Uniform(0.1),
            max: PerPosition::Uniform(1.0),
            shift_after: 3,
            shift_eps_freq: 1,
        }
    }
}

/// Geometry of the latent action space produced by the embedding trainer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingParams {
    pub latent_dim: usize,
    pub output_scale: f64,
}

impl Default for EmbeddingParams {
    fn default() -> Self {
        Self {
            latent_dim: 8,
            output_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentParams {
    pub learning_starts: u64,
    pub batch_size: usize,
    pub train_freq: TrainFreq,
    /// `-1` trains as many steps as were collected, `0` disables training.
    pub gradient_steps: i64,
    pub buffer_size: usize,
    pub seed: u64,
    /// Environment steps consumed by one tuning step.
    pub steps_per_tuning_step: u64,
}

impl Default for AgentParams {
    fn default() -> Self {
        Self {
            learning_starts: 100,
            batch_size: 256,
            train_freq: TrainFreq::steps(1),
            gradient_steps: 1,
            buffer_size: 1_000_000,
            seed: 0,
            steps_per_tuning_step: 1,
        }
    }
}

impl AgentParams {
    pub fn gradient_steps(&self) -> Result<GradientSteps> {
        GradientSteps::from_signed(self.gradient_steps)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseKind {
    None,
    #[default]
    Normal,
    Ou,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseParams {
    #[serde(rename = "type", default)]
    pub kind: NoiseKind,
    pub sigma: f64,
    /// Mean reversion rate (OU only).
    #[serde(default = "default_theta")]
    pub theta: f64,
    /// Time step (OU only).
    #[serde(default = "default_dt")]
    pub dt: f64,
}

fn default_theta() -> f64 {
    0.15
}

fn default_dt() -> f64 {
    1e-2
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            kind: NoiseKind::Normal,
            sigma: 0.1,
            theta: default_theta(),
            dt: default_dt(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetResetParams {
    #[serde(default)]
    pub tracking: TrackingPolicy,
}

/// Complete parameter document for a tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningParams {
    /// Steps per episode.
    pub horizon: usize,
    #[serde(default)]
    pub curriculum: CurriculumParams,
    #[serde(default)]
    pub embedding: EmbeddingParams,
    #[serde(default)]
    pub agent: AgentParams,
    #[serde(default)]
    pub noise: NoiseParams,
    #[serde(default)]
    pub target_reset: TargetResetParams,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub normalize_observation: bool,
    /// Let the learner see the curriculum scale as an extra observation entry.
    #[serde(default)]
    pub observe_curriculum_scale: bool,
    pub tune_duration_hours: f64,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            horizon: 5,
            curriculum: CurriculumParams::default(),
            embedding: EmbeddingParams::default(),
            agent: AgentParams::default(),
            noise: NoiseParams::default(),
            target_reset: TargetResetParams::default(),
            objective: Objective::default(),
            normalize_observation: false,
            observe_curriculum_scale: false,
            tune_duration_hours: 1.0,
        }
    }
}

impl TuningParams {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let params: TuningParams = serde_yaml::from_str(yaml)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(TuneError::invalid_config("horizon", "horizon must be > 0"));
        }

        let c = &self.curriculum;
        if c.shift_eps_freq == 0 {
            return Err(TuneError::invalid_config(
                "curriculum.shift_eps_freq",
                "shift_eps_freq must be >= 1",
            ));
        }
        c.initial.expand(self.horizon, "curriculum.initial")?;
        c.increment.expand(self.horizon, "curriculum.increment")?;
        let max = c.max.expand(self.horizon, "curriculum.max")?;
        if max.iter().any(|m| m.is_nan() || *m <= 0.0) {
            return Err(TuneError::invalid_config(
                "curriculum.max",
                "every max entry must be > 0",
            ));
        }

        if self.embedding.latent_dim == 0 {
            return Err(TuneError::invalid_config(
                "embedding.latent_dim",
                "latent_dim must be > 0",
            ));
        }

        let a = &self.agent;
        if a.train_freq.frequency == 0 {
            return Err(TuneError::invalid_config(
                "agent.train_freq.frequency",
                "should at least collect one step or episode",
            ));
        }
        if a.buffer_size == 0 {
            return Err(TuneError::invalid_config(
                "agent.buffer_size",
                "buffer_size must be > 0",
            ));
        }
        if a.batch_size == 0 {
            return Err(TuneError::invalid_config(
                "agent.batch_size",
                "batch_size must be > 0",
            ));
        }
        if a.steps_per_tuning_step == 0 {
            return Err(TuneError::invalid_config(
                "agent.steps_per_tuning_step",
                "steps_per_tuning_step must be > 0",
            ));
        }
        a.gradient_steps()?;

        if self.noise.kind != NoiseKind::None && self.noise.sigma < 0.0 {
            return Err(TuneError::invalid_config(
                "noise.sigma",
                "sigma must be >= 0",
            ));
        }

        check_duration_hours("tune_duration_hours", self.tune_duration_hours)?;

        Ok(())
    }
}

/// Where the effective tuning budget came from.
///
/// Precedence (highest to lowest): CLI flag, `DBTUNE_TUNE_DURATION_HOURS`,
/// params file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationSource {
    Cli,
    Env,
    Params,
}

impl DurationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationSource::Cli => "cli",
            DurationSource::Env => "env",
            DurationSource::Params => "params",
        }
    }

    /// Name reported when a value from this source is rejected.
    pub fn field(&self) -> &'static str {
        match self {
            DurationSource::Cli => "--duration-hours",
            DurationSource::Env => DURATION_ENV_VAR,
            DurationSource::Params => "tune_duration_hours",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EffectiveDuration {
    pub hours: f64,
    pub source: DurationSource,
}

impl EffectiveDuration {
    pub fn as_duration(&self) -> Result<std::time::Duration> {
        let hours = check_duration_hours(self.source.field(), self.hours)?;
        std::time::Duration::try_from_secs_f64(hours * 3600.0).map_err(|e| {
            TuneError::invalid_config(self.source.field(), e.to_string())
        })
    }

    pub fn log_startup(&self) {
        info!(
            hours = self.hours,
            source = self.source.as_str(),
            "effective tuning duration"
        );
    }
}

/// Parse a `DBTUNE_TUNE_DURATION_HOURS` value.
pub fn parse_duration_env(raw: &str) -> Result<f64> {
    let hours = raw.trim().parse::<f64>().map_err(|e| {
        TuneError::invalid_config(DURATION_ENV_VAR, format!("{:?}: {}", raw, e))
    })?;
    check_duration_hours(DURATION_ENV_VAR, hours)
}

/// Resolve the tuning budget. An override that is present but invalid is an
/// error, never silently skipped.
pub fn resolve_tune_duration(
    cli_hours: Option<f64>,
    params: &TuningParams,
) -> Result<EffectiveDuration> {
    if let Some(hours) = cli_hours {
        return Ok(EffectiveDuration {
            hours: check_duration_hours(DurationSource::Cli.field(), hours)?,
            source: DurationSource::Cli,
        });
    }

    if let Ok(raw) = std::env::var(DURATION_ENV_VAR) {
        if !raw.trim().is_empty() {
            return Ok(EffectiveDuration {
                hours: parse_duration_env(&raw)?,
                source: DurationSource::Env,
            });
        }
    }

    Ok(EffectiveDuration {
        hours: check_duration_hours(DurationSource::Params.field(), params.tune_duration_hours)?,
        source: DurationSource::Params,
    })
}
