// src/tune.rs
//
// Outer training loop: one tuning step = one `learn` call.
//
// Each step:
// - runs `learn(env, steps_per_tuning_step)`;
// - persists the merged config delta before anything else can fail, unless
//   collection was cancelled before a single env step ran;
// - records a stats row and a telemetry record.
// `run_tuning` repeats steps until the wall-clock budget is spent, rewriting
// the step-data table after each one.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::info;

use crate::agent::{ArtifactWriter, StepOutput, TuningAgent, TuningAgentMetadata};
use crate::config::TuningParams;
use crate::error::Result;
use crate::rl::buffer::ReplayBuffer;
use crate::rl::curriculum::{Curriculum, SCALE_DIM};
use crate::rl::env::{Environment, NormalizeObservation, Pipeline};
use crate::rl::noise::build_noise;
use crate::rl::policy::Learner;
use crate::rl::rollout::{OffPolicyAgent, TimeoutChecker};
use crate::rl::target_reset::TargetReset;
use crate::step_data::{StepDataTable, StepStats};
use crate::telemetry::TelemetrySink;

/// Build the standard stage order: target reset sees raw observations,
/// normalization (if enabled) sits outside it.
pub fn build_pipeline<E: Environment>(env: E, params: &TuningParams) -> Pipeline<E> {
    let obs_dim = env.observation_dim();
    let pipeline = Pipeline::new(env).with_stage(TargetReset::<E::State>::new(
        params.objective,
        params.target_reset.tracking,
        params.agent.seed,
    ));
    if params.normalize_observation {
        pipeline.with_stage(NormalizeObservation::new(obs_dim))
    } else {
        pipeline
    }
}

/// Observation width the learner and buffer must accept for an env whose
/// own observations are `env_obs_dim` wide.
pub fn policy_observation_dim(env_obs_dim: usize, params: &TuningParams) -> usize {
    if params.observe_curriculum_scale {
        env_obs_dim + SCALE_DIM
    } else {
        env_obs_dim
    }
}

pub struct TuningSession<E: Environment, L: Learner> {
    pipeline: Pipeline<E>,
    agent: OffPolicyAgent<L>,
    writer: ArtifactWriter,
    metadata: TuningAgentMetadata,
    telemetry: TelemetrySink,
    steps_per_tuning_step: u64,
    started: Instant,
}

impl<E: Environment, L: Learner> TuningSession<E, L> {
    /// Assemble a session from validated params.
    ///
    /// Writes `metadata.json` into `artifacts_dir` immediately.
    pub fn build(
        env: E,
        learner: L,
        params: &TuningParams,
        metadata: TuningAgentMetadata,
        artifacts_dir: impl Into<PathBuf>,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        params.validate()?;

        let pipeline = build_pipeline(env, params);
        let buffer = ReplayBuffer::new(
            params.agent.buffer_size,
            policy_observation_dim(pipeline.observation_dim(), params),
            pipeline.action_dim(),
            params.agent.seed,
        )?;
        let curriculum = Curriculum::new(params.horizon, &params.curriculum, &params.embedding)?;
        let noise = build_noise(&params.noise, pipeline.action_dim(), params.agent.seed)?;
        let agent = OffPolicyAgent::new(learner, buffer, curriculum, &params.agent)?
            .with_noise(noise)
            .with_scale_observation(params.observe_curriculum_scale);
        let writer = ArtifactWriter::create(artifacts_dir, &metadata, params)?;

        Ok(Self {
            pipeline,
            agent,
            writer,
            metadata,
            telemetry,
            steps_per_tuning_step: params.agent.steps_per_tuning_step,
            started: Instant::now(),
        })
    }

    /// Install the cooperative timeout polled during collection.
    pub fn with_timeout_checker(mut self, checker: impl TimeoutChecker + 'static) -> Self {
        self.agent.set_timeout_checker(Some(Box::new(checker)));
        self
    }

    pub fn pipeline(&self) -> &Pipeline<E> {
        &self.pipeline
    }

    pub fn agent(&self) -> &OffPolicyAgent<L> {
        &self.agent
    }

    pub fn artifacts_dir(&self) -> &Path {
        self.writer.dir()
    }

    pub fn target_reset(&self) -> Option<&TargetReset<E::State>> {
        self.pipeline.stage::<TargetReset<E::State>>()
    }
}

impl<E: Environment, L: Learner> TuningAgent for TuningSession<E, L> {
    fn metadata(&self) -> &TuningAgentMetadata {
        &self.metadata
    }

    fn step(&mut self) -> Result<Option<StepOutput>> {
        let report = self.agent.learn(&mut self.pipeline, self.steps_per_tuning_step)?;

        if report.steps == 0 && !report.continue_training && report.delta.is_empty() {
            info!(step = self.writer.next_step(), "cancelled before collecting; nothing to persist");
            return Ok(None);
        }

        // Persist first: a crash after this point loses nothing of this step.
        let step = self.writer.write_step(&report.delta)?;

        let (best_metric, real_best_metric) = match self.target_reset() {
            Some(tr) => (tr.best_metric(), tr.real_best_metric()),
            None => (None, None),
        };
        let curriculum = self.agent.curriculum();
        let stats = StepStats {
            step,
            elapsed_s: self.started.elapsed().as_secs_f64(),
            num_timesteps: self.agent.num_timesteps(),
            episodes: self.agent.episode_num(),
            reward_sum: report.reward_sum,
            last_metric: report.last_metric,
            best_metric,
            real_best_metric,
            curriculum_bias: curriculum.current_bias(),
            curriculum_episodes: curriculum.num_episodes(),
            timed_out: report.any_timed_out,
            continue_training: report.continue_training,
        };
        self.telemetry.log_step(&stats);

        info!(
            step,
            timesteps = stats.num_timesteps,
            reward_sum = stats.reward_sum,
            best = ?stats.best_metric,
            "tuning step complete"
        );

        Ok(Some(StepOutput {
            step,
            delta: report.delta,
            stats,
            continue_training: report.continue_training,
        }))
    }
}

/// Drive `agent` until `duration` elapses or collection is cancelled.
///
/// The step-data table at `step_data_path` is rewritten after every step and
/// once more at the end.
pub fn run_tuning<A: TuningAgent>(
    agent: &mut A,
    duration: Duration,
    step_data_path: &Path,
) -> Result<StepDataTable> {
    let start = Instant::now();
    let mut table = StepDataTable::new();

    while start.elapsed() < duration {
        let Some(out) = agent.step()? else {
            info!(steps = table.len(), "collection cancelled before the next step");
            break;
        };
        table.push(out.stats);
        table.write(step_data_path)?;

        if !out.continue_training {
            info!(step = out.step, "collection cancelled; stopping tuning");
            break;
        }
    }

    table.write(step_data_path)?;
    info!(
        steps = table.len(),
        path = %step_data_path.display(),
        "tuning finished"
    );
    Ok(table)
}
