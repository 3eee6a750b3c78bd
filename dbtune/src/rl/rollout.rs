// src/rl/rollout.rs
//
// Off-policy rollout collection and the learn loop.
//
// State machine per `learn` call:
//   COLLECTING -> TRAINING -> COLLECTING -> ... -> STOPPED
// with CANCELLED reachable from COLLECTING when the timeout checker fires.
//
// Collection per step:
// 1. learner proposes a latent action for the last observation
// 2. exploration noise is added
// 3. the curriculum bias is added to a copy, which is what the env executes
// 4. the pipeline steps (auto-resetting on episode end)
// 5. the transition is stored with the unbiased action, in the learner's own
//    space, and the true terminal observation on done
// 6. the curriculum step clock advances
// With scale observation on, every observation the learner sees gets the
// curriculum scale for the position it is acted on appended.
// On episode end the curriculum episode clock ticks and noise is reset.
//
// Timeouts are cooperative: the checker is polled once per iteration, never
// mid-step. Environment errors propagate unchanged and are never retried.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::ConfigDelta;
use crate::config::AgentParams;
use crate::error::{Result, TuneError};
use crate::rl::buffer::ReplayBuffer;
use crate::rl::curriculum::Curriculum;
use crate::rl::env::{Environment, Pipeline, StepInfo};
use crate::rl::noise::ActionNoise;
use crate::rl::policy::Learner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainFreqUnit {
    Step,
    Episode,
}

/// How much experience one rollout collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainFreq {
    pub frequency: u64,
    pub unit: TrainFreqUnit,
}

impl TrainFreq {
    pub fn steps(frequency: u64) -> Self {
        Self {
            frequency,
            unit: TrainFreqUnit::Step,
        }
    }

    pub fn episodes(frequency: u64) -> Self {
        Self {
            frequency,
            unit: TrainFreqUnit::Episode,
        }
    }
}

impl Default for TrainFreq {
    fn default() -> Self {
        Self::steps(1)
    }
}

pub fn should_collect_more_steps(
    train_freq: &TrainFreq,
    num_collected_steps: u64,
    num_collected_episodes: u64,
) -> bool {
    match train_freq.unit {
        TrainFreqUnit::Step => num_collected_steps < train_freq.frequency,
        TrainFreqUnit::Episode => num_collected_episodes < train_freq.frequency,
    }
}

/// Gradient updates to run after each rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientSteps {
    /// As many updates as environment steps were just collected.
    MatchCollected,
    /// A fixed count; zero disables training.
    Fixed(usize),
}

impl GradientSteps {
    /// Parse the signed config form: `-1` matches collected steps.
    pub fn from_signed(value: i64) -> Result<Self> {
        match value {
            -1 => Ok(GradientSteps::MatchCollected),
            n if n >= 0 => Ok(GradientSteps::Fixed(n as usize)),
            n => Err(TuneError::invalid_config(
                "agent.gradient_steps",
                format!("expected -1 or a non-negative count, got {}", n),
            )),
        }
    }

    pub fn for_rollout(&self, collected_steps: u64) -> usize {
        match self {
            GradientSteps::MatchCollected => collected_steps as usize,
            GradientSteps::Fixed(n) => *n,
        }
    }
}

/// Polled once per collection iteration.
pub trait TimeoutChecker {
    fn timed_out(&self) -> bool;
}

impl<F: Fn() -> bool> TimeoutChecker for F {
    fn timed_out(&self) -> bool {
        self()
    }
}

/// Wall-clock deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self::at(Instant::now() + budget)
    }

    pub fn at(end: Instant) -> Self {
        Self { end }
    }

    pub fn remaining(&self) -> Duration {
        self.end.saturating_duration_since(Instant::now())
    }
}

impl TimeoutChecker for Deadline {
    fn timed_out(&self) -> bool {
        Instant::now() >= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutReturn {
    pub episode_timesteps: u64,
    pub n_episodes: u64,
    pub continue_training: bool,
}

/// Everything one `learn` call produced, for persistence and stats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnReport {
    pub steps: u64,
    pub episodes: u64,
    pub reward_sum: f64,
    pub last_reward: Option<f64>,
    pub last_metric: Option<f64>,
    pub any_timed_out: bool,
    pub continue_training: bool,
    /// Deltas of every collected step, merged in order.
    pub delta: ConfigDelta,
    pub gradient_steps: u64,
}

impl LearnReport {
    fn record(&mut self, reward: f64, info: &StepInfo) {
        self.reward_sum += reward;
        self.last_reward = Some(reward);
        if info.metric.is_some() {
            self.last_metric = info.metric;
        }
        self.any_timed_out |= info.did_anything_time_out;
        self.record_delta(info);
    }

    fn record_delta(&mut self, info: &StepInfo) {
        if let Some(delta) = &info.config_delta {
            self.delta.merge(delta);
        }
    }
}

pub struct OffPolicyAgent<L: Learner> {
    learner: L,
    buffer: ReplayBuffer,
    curriculum: Curriculum,
    noise: Option<Box<dyn ActionNoise>>,
    timeout_checker: Option<Box<dyn TimeoutChecker>>,
    observe_scale: bool,

    learning_starts: u64,
    batch_size: usize,
    train_freq: TrainFreq,
    gradient_steps: GradientSteps,

    num_timesteps: u64,
    episode_num: u64,
    n_updates: u64,
    last_obs: Option<Vec<f32>>,
    report: LearnReport,
}

impl<L: Learner> OffPolicyAgent<L> {
    pub fn new(
        learner: L,
        buffer: ReplayBuffer,
        curriculum: Curriculum,
        params: &AgentParams,
    ) -> Result<Self> {
        if params.train_freq.frequency == 0 {
            return Err(TuneError::invalid_config(
                "agent.train_freq.frequency",
                "should at least collect one step or episode",
            ));
        }
        Ok(Self {
            learner,
            buffer,
            curriculum,
            noise: None,
            timeout_checker: None,
            observe_scale: false,
            learning_starts: params.learning_starts,
            batch_size: params.batch_size,
            train_freq: params.train_freq,
            gradient_steps: params.gradient_steps()?,
            num_timesteps: 0,
            episode_num: 0,
            n_updates: 0,
            last_obs: None,
            report: LearnReport::default(),
        })
    }

    pub fn with_noise(mut self, noise: Option<Box<dyn ActionNoise>>) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_timeout_checker(mut self, checker: impl TimeoutChecker + 'static) -> Self {
        self.timeout_checker = Some(Box::new(checker));
        self
    }

    /// Append [`Curriculum::current_scale`] to every observation the learner
    /// sees and the buffer stores. Both must then be sized for
    /// `env_obs_dim + SCALE_DIM`.
    pub fn with_scale_observation(mut self, enabled: bool) -> Self {
        self.observe_scale = enabled;
        self
    }

    pub fn set_timeout_checker(&mut self, checker: Option<Box<dyn TimeoutChecker>>) {
        self.timeout_checker = checker;
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub fn curriculum(&self) -> &Curriculum {
        &self.curriculum
    }

    pub fn curriculum_mut(&mut self) -> &mut Curriculum {
        &mut self.curriculum
    }

    pub fn num_timesteps(&self) -> u64 {
        self.num_timesteps
    }

    pub fn episode_num(&self) -> u64 {
        self.episode_num
    }

    pub fn n_updates(&self) -> u64 {
        self.n_updates
    }

    /// What the learner sees: the env observation, plus the curriculum scale
    /// when scale observation is on.
    fn observe(&self, observation: &[f32]) -> Vec<f32> {
        let mut obs = observation.to_vec();
        if self.observe_scale {
            obs.extend(self.curriculum.current_scale());
        }
        obs
    }

    fn timed_out(&self) -> bool {
        self.timeout_checker
            .as_ref()
            .map(|c| c.timed_out())
            .unwrap_or(false)
    }

    /// Collect one `train_freq` unit of experience into the buffer.
    pub fn collect_rollouts<E: Environment>(&mut self, env: &mut Pipeline<E>) -> Result<RolloutReturn> {
        self.learner.set_training_mode(false);

        let mut num_collected_steps = 0;
        let mut num_collected_episodes = 0;
        let mut continue_training = true;

        while should_collect_more_steps(&self.train_freq, num_collected_steps, num_collected_episodes) {
            if self.timed_out() {
                info!(
                    collected = num_collected_steps,
                    "timeout checker fired; stopping collection"
                );
                continue_training = false;
                break;
            }

            let raw_obs = match self.last_obs.take() {
                Some(obs) => obs,
                None => {
                    let reset = env.reset()?;
                    self.report.record_delta(&reset.info);
                    reset.observation
                }
            };
            let obs = self.observe(&raw_obs);

            let mut action = self.learner.predict(&obs)?;
            if let Some(noise) = self.noise.as_mut() {
                let eps = noise.sample();
                if eps.len() != action.len() {
                    return Err(TuneError::DimensionMismatch {
                        what: "action noise",
                        expected: action.len(),
                        actual: eps.len(),
                    });
                }
                action.iter_mut().zip(eps).for_each(|(a, e)| *a += e);
            }
            let executed = self.curriculum.apply_bias(&action)?;

            let outcome = env.step(&executed)?;
            self.num_timesteps += 1;
            num_collected_steps += 1;

            self.curriculum.advance();

            let done = outcome.done();
            let next_obs = if done {
                let terminal = outcome
                    .info
                    .terminal_observation
                    .as_deref()
                    .ok_or(TuneError::MissingInfo("terminal_observation"))?;
                self.observe(terminal)
            } else {
                self.observe(&outcome.observation)
            };

            self.report.record(outcome.reward, &outcome.info);
            self.buffer
                .add(&obs, &next_obs, &action, outcome.reward, done, outcome.info)?;
            self.last_obs = Some(outcome.observation);

            if done {
                num_collected_episodes += 1;
                self.episode_num += 1;
                self.curriculum.reset();
                if let Some(noise) = self.noise.as_mut() {
                    noise.reset();
                }
                debug!(episode = self.episode_num, "episode finished");
            }
        }

        Ok(RolloutReturn {
            episode_timesteps: num_collected_steps,
            n_episodes: num_collected_episodes,
            continue_training,
        })
    }

    /// Alternate collection and training for `total_timesteps` more steps.
    ///
    /// The environment is reset only on the very first call; later calls
    /// resume from the last observation.
    pub fn learn<E: Environment>(
        &mut self,
        env: &mut Pipeline<E>,
        total_timesteps: u64,
    ) -> Result<LearnReport> {
        self.report = LearnReport {
            continue_training: true,
            ..LearnReport::default()
        };
        if self.last_obs.is_none() {
            let reset = env.reset()?;
            self.report.record_delta(&reset.info);
            self.last_obs = Some(reset.observation);
        }
        let target = self.num_timesteps + total_timesteps;

        while self.num_timesteps < target {
            let rollout = self.collect_rollouts(env)?;
            self.report.steps += rollout.episode_timesteps;
            self.report.episodes += rollout.n_episodes;

            if !rollout.continue_training {
                self.report.continue_training = false;
                break;
            }

            if self.num_timesteps > 0 && self.num_timesteps >= self.learning_starts {
                let gradient_steps = self.gradient_steps.for_rollout(rollout.episode_timesteps);
                if gradient_steps > 0 {
                    self.learner.set_training_mode(true);
                    self.learner
                        .train(&mut self.buffer, gradient_steps, self.batch_size)?;
                    self.n_updates += gradient_steps as u64;
                    self.report.gradient_steps += gradient_steps as u64;
                }
            }
        }

        Ok(std::mem::take(&mut self.report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CurriculumParams, EmbeddingParams, PerPosition};
    use crate::rl::env::{ResetOutcome, StepOutcome};
    use crate::rl::policy::GreedyReplayLearner;
    use crate::rl::target_reset::TrackedResetState;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Endless episodes of length `episode_len`; metric falls every step.
    struct LineEnv {
        t: u64,
        episode_len: u64,
    }

    impl Environment for LineEnv {
        type State = u64;

        fn reset(&mut self, _target: Option<&TrackedResetState<u64>>) -> Result<ResetOutcome> {
            self.t = 0;
            Ok(ResetOutcome {
                observation: vec![0.0],
                info: StepInfo {
                    baseline_metric: Some(100.0),
                    ..StepInfo::default()
                },
            })
        }

        fn step(&mut self, _action: &[f32]) -> Result<StepOutcome> {
            self.t += 1;
            Ok(StepOutcome {
                observation: vec![self.t as f32],
                reward: 1.0,
                terminated: false,
                truncated: self.t >= self.episode_len,
                info: StepInfo {
                    metric: Some(100.0 - self.t as f64),
                    ..StepInfo::default()
                },
            })
        }

        fn config_state(&self) -> Option<u64> {
            Some(self.t)
        }

        fn observation_dim(&self) -> usize {
            1
        }

        fn action_dim(&self) -> usize {
            2
        }
    }

    /// Counts train calls and the gradient steps requested.
    struct CountingLearner {
        calls: Vec<usize>,
    }

    impl Learner for CountingLearner {
        fn version(&self) -> &str {
            "counting"
        }

        fn predict(&mut self, _observation: &[f32]) -> Result<Vec<f32>> {
            Ok(vec![0.0, 0.0])
        }

        fn train(&mut self, _buffer: &mut ReplayBuffer, gradient_steps: usize, _batch_size: usize) -> Result<()> {
            self.calls.push(gradient_steps);
            Ok(())
        }

        fn set_training_mode(&mut self, _training: bool) {}
    }

    fn agent<L: Learner>(learner: L, params: &AgentParams, episode_shift_after: u64) -> OffPolicyAgent<L> {
        let curriculum = Curriculum::new(
            3,
            &CurriculumParams {
                shift_after: episode_shift_after,
                ..CurriculumParams::default()
            },
            &EmbeddingParams {
                latent_dim: 2,
                output_scale: 1.0,
            },
        )
        .unwrap();
        let buffer = ReplayBuffer::new(64, 1, 2, 0).unwrap();
        OffPolicyAgent::new(learner, buffer, curriculum, params).unwrap()
    }

    fn params(train_freq: TrainFreq, gradient_steps: i64, learning_starts: u64) -> AgentParams {
        AgentParams {
            learning_starts,
            batch_size: 4,
            train_freq,
            gradient_steps,
            ..AgentParams::default()
        }
    }

    /// Rewards rise every step; records every action it executes.
    struct RecordingEnv {
        t: u64,
        executed: Vec<Vec<f32>>,
    }

    impl Environment for RecordingEnv {
        type State = u64;

        fn reset(&mut self, _target: Option<&TrackedResetState<u64>>) -> Result<ResetOutcome> {
            Ok(ResetOutcome {
                observation: vec![0.0],
                info: StepInfo {
                    baseline_metric: Some(0.0),
                    ..StepInfo::default()
                },
            })
        }

        fn step(&mut self, action: &[f32]) -> Result<StepOutcome> {
            self.t += 1;
            self.executed.push(action.to_vec());
            Ok(StepOutcome {
                observation: vec![self.t as f32],
                reward: self.t as f64,
                terminated: false,
                truncated: false,
                info: StepInfo {
                    metric: Some(self.t as f64),
                    ..StepInfo::default()
                },
            })
        }

        fn config_state(&self) -> Option<u64> {
            Some(self.t)
        }

        fn observation_dim(&self) -> usize {
            1
        }

        fn action_dim(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_bias_is_applied_once_per_step() {
        let curriculum = Curriculum::new(
            3,
            &CurriculumParams {
                initial: PerPosition::Uniform(0.2),
                shift_after: 1_000,
                ..CurriculumParams::default()
            },
            &EmbeddingParams {
                latent_dim: 2,
                output_scale: 1.0,
            },
        )
        .unwrap();
        let buffer = ReplayBuffer::new(64, 1, 2, 0).unwrap();
        let mut agent = OffPolicyAgent::new(
            GreedyReplayLearner::new(1, 2),
            buffer,
            curriculum,
            &params(TrainFreq::steps(1), 1, 0),
        )
        .unwrap();
        let mut env = Pipeline::new(RecordingEnv { t: 0, executed: vec![] });

        for _ in 0..6 {
            agent.learn(&mut env, 1).unwrap();
        }

        // The learner keeps proposing what it stored; the env sees that plus
        // exactly one bias, never an accumulation.
        let executed = &env.env().executed;
        assert_eq!(executed.len(), 6);
        for action in executed {
            for a in action {
                assert!((a - 0.2).abs() < 1e-6, "{:?}", executed);
            }
        }
        assert!((agent.curriculum().current_bias() - 0.2).abs() < 1e-12);
        assert!(agent
            .buffer()
            .iter()
            .all(|t| t.action.iter().all(|a| a.abs() < 1e-6)));
    }

    #[test]
    fn test_scale_observation_tracks_curriculum_position() {
        let curriculum = Curriculum::new(
            2,
            &CurriculumParams {
                initial: PerPosition::Positions(vec![0.0, 0.5]),
                shift_after: 1_000,
                ..CurriculumParams::default()
            },
            &EmbeddingParams {
                latent_dim: 2,
                output_scale: 1.0,
            },
        )
        .unwrap();
        let buffer = ReplayBuffer::new(16, 2, 2, 0).unwrap();
        let mut agent = OffPolicyAgent::new(
            GreedyReplayLearner::new(2, 2),
            buffer,
            curriculum,
            &params(TrainFreq::steps(3), 0, 0),
        )
        .unwrap()
        .with_scale_observation(true);
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });

        agent.collect_rollouts(&mut env).unwrap();

        // shift/max per position: 0.0 -> -1, 0.5 -> 0.
        let seen: Vec<(f32, f32)> = agent
            .buffer()
            .iter()
            .map(|t| (t.observation[1], t.next_observation[1]))
            .collect();
        assert_eq!(seen, vec![(-1.0, 0.0), (0.0, -1.0), (-1.0, 0.0)]);
        assert_eq!(agent.curriculum().inverse_scale(0.0), 0.5);
    }

    #[test]
    fn test_collects_exactly_train_freq_steps() {
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let mut agent = agent(GreedyReplayLearner::new(1, 2), &params(TrainFreq::steps(5), 1, 0), 0);

        let rollout = agent.collect_rollouts(&mut env).unwrap();
        assert_eq!(rollout.episode_timesteps, 5);
        assert_eq!(rollout.n_episodes, 0);
        assert!(rollout.continue_training);
        assert_eq!(agent.buffer().len(), 5);
        assert_eq!(agent.curriculum().num_steps(), 5);
    }

    #[test]
    fn test_timeout_stops_after_three_steps() {
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let polls = Rc::new(Cell::new(0u32));
        let counter = polls.clone();
        let mut agent = agent(GreedyReplayLearner::new(1, 2), &params(TrainFreq::steps(5), 1, 0), 0)
            .with_timeout_checker(move || {
                let n = counter.get();
                counter.set(n + 1);
                n >= 3
            });

        let rollout = agent.collect_rollouts(&mut env).unwrap();
        assert_eq!(rollout.episode_timesteps, 3);
        assert!(!rollout.continue_training);
        assert_eq!(agent.num_timesteps(), 3);
    }

    #[test]
    fn test_episode_collection_and_terminal_observation() {
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 3 });
        let mut agent = agent(GreedyReplayLearner::new(1, 2), &params(TrainFreq::episodes(2), 1, 0), 0);

        let rollout = agent.collect_rollouts(&mut env).unwrap();
        assert_eq!(rollout.episode_timesteps, 6);
        assert_eq!(rollout.n_episodes, 2);
        assert_eq!(agent.curriculum().num_episodes(), 2);
        assert_eq!(agent.curriculum().num_steps(), 0);

        // Terminal transitions point at the true last state, not the reset one.
        let terminal: Vec<_> = agent.buffer().iter().filter(|t| t.done).collect();
        assert_eq!(terminal.len(), 2);
        assert!(terminal.iter().all(|t| t.next_observation == vec![3.0]));
    }

    #[test]
    fn test_gradient_step_selection() {
        assert_eq!(GradientSteps::from_signed(-1).unwrap(), GradientSteps::MatchCollected);
        assert_eq!(GradientSteps::from_signed(0).unwrap(), GradientSteps::Fixed(0));
        assert!(GradientSteps::from_signed(-3).is_err());
        assert_eq!(GradientSteps::MatchCollected.for_rollout(7), 7);
        assert_eq!(GradientSteps::Fixed(2).for_rollout(7), 2);

        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let mut matching = agent(CountingLearner { calls: vec![] }, &params(TrainFreq::steps(4), -1, 0), 0);
        matching.learn(&mut env, 8).unwrap();
        assert_eq!(matching.learner().calls, vec![4, 4]);

        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let mut disabled = agent(CountingLearner { calls: vec![] }, &params(TrainFreq::steps(4), 0, 0), 0);
        disabled.learn(&mut env, 8).unwrap();
        assert!(disabled.learner().calls.is_empty());
    }

    #[test]
    fn test_training_waits_for_learning_starts() {
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let mut agent = agent(CountingLearner { calls: vec![] }, &params(TrainFreq::steps(2), 1, 4), 0);

        agent.learn(&mut env, 2).unwrap();
        assert!(agent.learner().calls.is_empty());

        // 4 >= learning_starts.
        agent.learn(&mut env, 2).unwrap();
        assert_eq!(agent.learner().calls, vec![1]);
        assert_eq!(agent.n_updates(), 1);
    }

    #[test]
    fn test_learn_resumes_without_reset() {
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let mut agent = agent(GreedyReplayLearner::new(1, 2), &params(TrainFreq::steps(1), 1, 0), 0);

        let first = agent.learn(&mut env, 3).unwrap();
        assert_eq!(first.steps, 3);
        assert_eq!(first.last_metric, Some(97.0));
        assert!((first.reward_sum - 3.0).abs() < 1e-12);

        let second = agent.learn(&mut env, 2).unwrap();
        assert_eq!(second.steps, 2);
        assert_eq!(second.last_metric, Some(95.0));
        assert!(second.continue_training);
    }

    #[test]
    fn test_learn_stops_when_collection_cancelled() {
        let mut env = Pipeline::new(LineEnv { t: 0, episode_len: 100 });
        let mut agent = agent(GreedyReplayLearner::new(1, 2), &params(TrainFreq::steps(1), 1, 0), 0)
            .with_timeout_checker(|| true);

        let report = agent.learn(&mut env, 10).unwrap();
        assert_eq!(report.steps, 0);
        assert!(!report.continue_training);
    }
}
