// src/rl/target_reset.rs
//
// Target reset: resume episodes from the best configuration states seen so
// far instead of the pristine database.
//
// The stage never touches rewards. It only watches reported metrics on the
// way out and rewrites the reset request on the way in.

use std::any::Any;
use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TuneError};
use crate::rl::env::{ResetOutcome, ResetRequest, Stage, StepOutcome};

/// Strict "is better" ordering over workload metrics.
pub trait MetricOrder {
    fn is_better(&self, candidate: f64, incumbent: f64) -> bool;
}

/// Which direction of the workload metric counts as an improvement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Lower is better.
    #[default]
    Latency,
    /// Higher is better.
    Throughput,
}

impl MetricOrder for Objective {
    fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Objective::Latency => candidate < incumbent,
            Objective::Throughput => candidate > incumbent,
        }
    }
}

/// How improvements are folded into the tracked reset states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingPolicy {
    /// Only the baseline from the first reset is ever tracked.
    BaselineOnly,
    /// One slot, replaced by every strict improvement.
    #[default]
    LatestBest,
    /// Two slots: slot 0 pinned to the first tracked state, slot 1 the
    /// newest improvement.
    PinFirst,
}

/// Snapshot an episode can be resumed from.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedResetState<S> {
    pub metric: f64,
    pub observation: Vec<f32>,
    pub config_state: S,
    pub query_metric_data: Option<BTreeMap<String, f64>>,
}

pub struct TargetReset<S, O = Objective> {
    order: O,
    policy: TrackingPolicy,
    best_metric: Option<f64>,
    real_best_metric: Option<f64>,
    tracked_states: Vec<TrackedResetState<S>>,
    rng: ChaCha8Rng,
}

impl<S: Clone> TargetReset<S, Objective> {
    pub fn new(objective: Objective, policy: TrackingPolicy, seed: u64) -> Self {
        Self::with_order(objective, policy, seed)
    }
}

impl<S: Clone, O: MetricOrder> TargetReset<S, O> {
    pub fn with_order(order: O, policy: TrackingPolicy, seed: u64) -> Self {
        Self {
            order,
            policy,
            best_metric: None,
            real_best_metric: None,
            tracked_states: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn policy(&self) -> TrackingPolicy {
        self.policy
    }

    /// Best metric seen, including timed-out evaluations.
    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    /// Best metric among evaluations that did not time out.
    pub fn real_best_metric(&self) -> Option<f64> {
        self.real_best_metric
    }

    pub fn tracked_states(&self) -> &[TrackedResetState<S>] {
        &self.tracked_states
    }

    fn track(&mut self, snapshot: TrackedResetState<S>) {
        match self.policy {
            TrackingPolicy::BaselineOnly => {}
            TrackingPolicy::LatestBest => {
                self.tracked_states = vec![snapshot];
            }
            TrackingPolicy::PinFirst => {
                self.tracked_states.truncate(1);
                self.tracked_states.push(snapshot);
            }
        }
    }
}

impl<S, O> Stage<S> for TargetReset<S, O>
where
    S: Clone + 'static,
    O: MetricOrder + 'static,
{
    fn name(&self) -> &'static str {
        "target_reset"
    }

    fn on_reset_request(&mut self, request: &mut ResetRequest<S>) -> Result<()> {
        // First reset is always fresh so the baseline can be measured.
        if let Some(choice) = self.tracked_states.choose(&mut self.rng) {
            debug!(metric = choice.metric, "resetting to tracked state");
            request.target = Some(choice.clone());
        }
        Ok(())
    }

    fn on_reset(&mut self, outcome: &mut ResetOutcome, state: Option<&S>) -> Result<()> {
        if !self.tracked_states.is_empty() {
            return Ok(());
        }

        let baseline = outcome
            .info
            .baseline_metric
            .ok_or(TuneError::MissingInfo("baseline_metric"))?;
        let config_state = state.cloned().ok_or(TuneError::MissingInfo("config_state"))?;

        self.best_metric = Some(baseline);
        self.real_best_metric = Some(baseline);
        self.tracked_states = vec![TrackedResetState {
            metric: baseline,
            observation: outcome.observation.clone(),
            config_state,
            query_metric_data: outcome.info.query_metric_data.clone(),
        }];
        info!(baseline, "target reset seeded from baseline");
        Ok(())
    }

    fn on_step(&mut self, outcome: &mut StepOutcome, state: Option<&S>) -> Result<()> {
        let incumbent = self
            .best_metric
            .ok_or(TuneError::MissingInfo("baseline_metric"))?;
        let metric = outcome.info.metric.ok_or(TuneError::MissingInfo("metric"))?;

        if !self.order.is_better(metric, incumbent) {
            return Ok(());
        }

        self.best_metric = Some(metric);
        if !outcome.info.did_anything_time_out {
            self.real_best_metric = Some(metric);
        }

        if self.policy == TrackingPolicy::BaselineOnly {
            return Ok(());
        }

        let config_state = state.cloned().ok_or(TuneError::MissingInfo("config_state"))?;
        info!(
            metric,
            timed_out = outcome.info.did_anything_time_out,
            "found new maximal state"
        );
        self.track(TrackedResetState {
            metric,
            observation: outcome.observation.clone(),
            config_state,
            query_metric_data: outcome.info.query_metric_data.clone(),
        });
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rl::env::StepInfo;

    fn reset_outcome(baseline: Option<f64>) -> ResetOutcome {
        ResetOutcome {
            observation: vec![0.5, 0.5],
            info: StepInfo {
                baseline_metric: baseline,
                ..StepInfo::default()
            },
        }
    }

    fn step_outcome(metric: f64, timed_out: bool) -> StepOutcome {
        StepOutcome {
            observation: vec![metric as f32, 0.0],
            reward: 0.0,
            terminated: false,
            truncated: false,
            info: StepInfo {
                metric: Some(metric),
                did_anything_time_out: timed_out,
                ..StepInfo::default()
            },
        }
    }

    fn seeded(policy: TrackingPolicy) -> TargetReset<u32> {
        let mut tr = TargetReset::new(Objective::Latency, policy, 3);
        let mut request = ResetRequest::default();
        tr.on_reset_request(&mut request).unwrap();
        assert!(request.target.is_none());
        tr.on_reset(&mut reset_outcome(Some(100.0)), Some(&0)).unwrap();
        tr
    }

    #[test]
    fn test_first_reset_tracks_baseline() {
        let tr = seeded(TrackingPolicy::LatestBest);
        assert_eq!(tr.tracked_states().len(), 1);
        assert_eq!(tr.tracked_states()[0].metric, 100.0);
        assert_eq!(tr.best_metric(), Some(100.0));
        assert_eq!(tr.real_best_metric(), Some(100.0));
    }

    #[test]
    fn test_missing_baseline_is_fatal() {
        let mut tr: TargetReset<u32> = TargetReset::new(Objective::Latency, TrackingPolicy::LatestBest, 0);
        let err = tr.on_reset(&mut reset_outcome(None), Some(&0)).unwrap_err();
        assert!(matches!(err, TuneError::MissingInfo("baseline_metric")));
    }

    #[test]
    fn test_step_before_reset_is_fatal() {
        let mut tr: TargetReset<u32> = TargetReset::new(Objective::Latency, TrackingPolicy::LatestBest, 0);
        let err = tr.on_step(&mut step_outcome(1.0, false), Some(&0)).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_no_improvement_leaves_tracking_unchanged() {
        let mut tr = seeded(TrackingPolicy::LatestBest);
        let before = tr.tracked_states().to_vec();

        // Equal is not strictly better.
        tr.on_step(&mut step_outcome(100.0, false), Some(&1)).unwrap();
        tr.on_step(&mut step_outcome(150.0, false), Some(&2)).unwrap();

        assert_eq!(tr.tracked_states(), before.as_slice());
        assert_eq!(tr.best_metric(), Some(100.0));
    }

    #[test]
    fn test_timed_out_improvement_skips_real_best() {
        let mut tr = seeded(TrackingPolicy::LatestBest);

        tr.on_step(&mut step_outcome(80.0, true), Some(&1)).unwrap();
        assert_eq!(tr.best_metric(), Some(80.0));
        assert_eq!(tr.real_best_metric(), Some(100.0));
        assert_eq!(tr.tracked_states()[0].metric, 80.0);
        assert_eq!(tr.tracked_states()[0].config_state, 1);

        tr.on_step(&mut step_outcome(70.0, false), Some(&2)).unwrap();
        assert_eq!(tr.real_best_metric(), Some(70.0));
    }

    #[test]
    fn test_pin_first_keeps_start_state() {
        let mut tr = seeded(TrackingPolicy::PinFirst);
        tr.on_step(&mut step_outcome(90.0, false), Some(&1)).unwrap();
        tr.on_step(&mut step_outcome(80.0, false), Some(&2)).unwrap();

        let metrics: Vec<f64> = tr.tracked_states().iter().map(|s| s.metric).collect();
        assert_eq!(metrics, vec![100.0, 80.0]);
    }

    #[test]
    fn test_baseline_only_never_replaces() {
        let mut tr = seeded(TrackingPolicy::BaselineOnly);
        tr.on_step(&mut step_outcome(10.0, false), Some(&1)).unwrap();
        assert_eq!(tr.tracked_states().len(), 1);
        assert_eq!(tr.tracked_states()[0].metric, 100.0);
        assert_eq!(tr.best_metric(), Some(10.0));
    }

    #[test]
    fn test_later_resets_target_a_tracked_state() {
        let mut tr = seeded(TrackingPolicy::PinFirst);
        tr.on_step(&mut step_outcome(50.0, false), Some(&7)).unwrap();

        for _ in 0..20 {
            let mut request = ResetRequest::default();
            tr.on_reset_request(&mut request).unwrap();
            let target = request.target.unwrap();
            assert!(target.config_state == 0 || target.config_state == 7);
        }
    }

    #[test]
    fn test_throughput_prefers_higher() {
        assert!(Objective::Throughput.is_better(2.0, 1.0));
        assert!(!Objective::Throughput.is_better(1.0, 1.0));
        assert!(Objective::Latency.is_better(1.0, 2.0));
    }
}
