//! dbtune core library.
//!
//! Online reinforcement-learning control loop for database configuration
//! tuning. An agent observes database state, proposes a configuration delta
//! (indexes, system knobs, per-query hints), the delta is applied and the
//! workload measured, and the agent learns from the resulting reward.
//!
//! # Layout
//!
//! - **rl**: the control loop proper. Curriculum, target reset, replay
//!   buffer, environment pipeline, rollout collection, synthetic env.
//! - **tune**: outer training loop driving one tuning step at a time.
//! - **agent**: tuning-agent surface plus replayable artifacts
//!   (`metadata.json`, `step{n}_delta.json`).
//! - **step_data**: per-step statistics table, rewritten in full each step.
//! - **lease**: best-effort cross-process resource leasing (ports).
//! - **config**: YAML tuning parameters and budget precedence.
//! - **telemetry**: env-driven JSONL sink.
//!
//! The whole loop runs on a single thread of control per tuning run; the
//! only cross-process coordination is [`lease`].

pub mod agent;
pub mod config;
pub mod error;
pub mod lease;
pub mod rl;
pub mod step_data;
pub mod telemetry;
pub mod tune;

// --- Re-exports for ergonomic external use ---------------------------------

pub use agent::{
    ArtifactWriter, ArtifactsReader, ConfigDelta, ReplayedConfig, StepOutput, TuningAgent,
    TuningAgentMetadata,
};
pub use config::{resolve_tune_duration, DurationSource, EffectiveDuration, TuningParams};
pub use error::{Result, TuneError};
pub use lease::{acquire_port, ResourceLease};
pub use step_data::{StepDataTable, StepStats};
pub use telemetry::{TelemetryConfig, TelemetryMode, TelemetrySink};
pub use tune::{build_pipeline, policy_observation_dim, run_tuning, TuningSession};
