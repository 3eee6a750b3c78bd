// src/rl/mod.rs
//
// Online RL control loop for configuration tuning.
//
// Key components:
// - Curriculum: latent space curriculum biasing every proposed action
// - TargetReset: pipeline stage choosing which tracked state episodes resume from
// - ReplayBuffer: fixed-capacity ring of transitions
// - Pipeline / Stage: explicit, ordered environment wrappers
// - OffPolicyAgent: rollout collection + gradient-step scheduling
// - SimTuningEnv: seeded synthetic database for runs without Postgres

pub mod buffer;
pub mod curriculum;
pub mod env;
pub mod noise;
pub mod policy;
pub mod rollout;
pub mod sim_env;
pub mod target_reset;

// Re-exports for convenience
pub use buffer::{Batch, ReplayBuffer, Transition};
pub use curriculum::{Curriculum, INACTIVE_SCALE, SCALE_DIM};
pub use env::{
    Environment, NormalizeObservation, Pipeline, ResetOutcome, ResetRequest, Stage, StepInfo,
    StepOutcome,
};
pub use noise::{build_noise, ActionNoise, NormalNoise, OrnsteinUhlenbeckNoise};
pub use policy::{GreedyReplayLearner, Learner, GREEDY_LEARNER_VERSION};
pub use rollout::{
    should_collect_more_steps, Deadline, GradientSteps, LearnReport, OffPolicyAgent,
    RolloutReturn, TimeoutChecker, TrainFreq, TrainFreqUnit,
};
pub use sim_env::{KnobState, SimEnvConfig, SimTuningEnv};
pub use target_reset::{MetricOrder, Objective, TargetReset, TrackedResetState, TrackingPolicy};
