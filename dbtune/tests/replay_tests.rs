// tests/replay_tests.rs
//
// Artifacts written during a tuning run replay to the live configuration:
// - folding step deltas from pristine matches the env after every step,
//   across episode resets to tracked states;
// - params travel with the artifacts;
// - same seed, same run.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Duration;

use dbtune::rl::{Environment, GreedyReplayLearner, KnobState, SimEnvConfig, SimTuningEnv, TrackingPolicy};
use dbtune::telemetry::TelemetryConfig;
use dbtune::{
    run_tuning, ArtifactsReader, ConfigDelta, ReplayedConfig, StepDataTable, TelemetrySink,
    TuningAgent, TuningAgentMetadata, TuningParams, TuningSession,
};

const KNOBS: usize = 4;

fn params(seed: u64, horizon: usize) -> TuningParams {
    let mut params = TuningParams::default();
    params.horizon = horizon;
    params.embedding.latent_dim = KNOBS;
    params.agent.seed = seed;
    params.agent.learning_starts = 2;
    params.agent.batch_size = 8;
    params.agent.buffer_size = 64;
    params.agent.steps_per_tuning_step = 2;
    params.noise.sigma = 0.5;
    params.target_reset.tracking = TrackingPolicy::LatestBest;
    params
}

fn metadata() -> TuningAgentMetadata {
    TuningAgentMetadata::new("/data/workload", "/data/pristine", "/data/dbdata", "/usr/pgbin").unwrap()
}

fn session(
    dir: &std::path::Path,
    p: &TuningParams,
) -> TuningSession<SimTuningEnv, GreedyReplayLearner> {
    let env = SimTuningEnv::new(
        SimEnvConfig::default().with_horizon(p.horizon).with_num_knobs(KNOBS),
        p.agent.seed,
    )
    .unwrap();
    TuningSession::build(
        env,
        GreedyReplayLearner::new(KNOBS + 1, KNOBS),
        p,
        metadata(),
        dir,
        TelemetrySink::from_config(TelemetryConfig::off()),
    )
    .unwrap()
}

/// Index names left standing after running `statements` in order.
fn live_indexes(statements: &[String]) -> BTreeSet<String> {
    let mut live = BTreeSet::new();
    for stmt in statements {
        let name = stmt.split_whitespace().nth(2).unwrap_or_default().to_string();
        if stmt.starts_with("CREATE INDEX") {
            live.insert(name);
        } else if stmt.starts_with("DROP INDEX") {
            live.remove(&name);
        }
    }
    live
}

#[test]
fn test_folded_deltas_match_live_config_across_resets() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = params(9, 2);
    p.agent.steps_per_tuning_step = 1;
    let mut s = session(dir.path(), &p);
    let num_queries = s.pipeline().env().config().num_queries;

    let mut replayed = ReplayedConfig {
        sysknobs: KnobState::pristine(KNOBS).sysknobs(),
        ..ReplayedConfig::default()
    };
    for _ in 0..40 {
        let out = s.step().unwrap().unwrap();
        let reader = ArtifactsReader::open(dir.path()).unwrap();
        replayed.apply(&reader.step_delta(out.step).unwrap());

        let live = s.pipeline().env().config_state().unwrap();
        assert_eq!(replayed.sysknobs, live.sysknobs(), "step {}", out.step);
        assert_eq!(live_indexes(&replayed.index_statements), live.indexes(), "step {}", out.step);
        assert_eq!(replayed.qknobs, live.qknobs(num_queries), "step {}", out.step);
    }

    // Every other step ended an episode and reset to a tracked state.
    assert_eq!(s.agent().episode_num(), 20);
}

#[test]
fn test_replay_reconstructs_every_delta() {
    let dir = tempfile::tempdir().unwrap();
    let p = params(11, 3);
    let mut s = session(dir.path(), &p);

    let produced: Vec<ConfigDelta> = (0..6).map(|_| s.step().unwrap().unwrap().delta).collect();

    let reader = ArtifactsReader::open(dir.path()).unwrap();
    assert_eq!(reader.num_steps(), 6);
    assert_eq!(reader.metadata().unwrap(), metadata());
    assert_eq!(reader.all_deltas().unwrap(), produced);
    // The very first step moves knobs away from pristine.
    assert!(!produced[0].sysknobs.is_empty());

    let restored = reader.params().unwrap();
    assert_eq!(restored.horizon, 3);
    assert_eq!(restored.agent.seed, 11);
    assert_eq!(restored.embedding.latent_dim, KNOBS);
    assert_eq!(restored.target_reset.tracking, TrackingPolicy::LatestBest);
}

#[test]
fn test_same_seed_same_run() {
    let a_dir = tempfile::tempdir().unwrap();
    let b_dir = tempfile::tempdir().unwrap();
    let p = params(3, 3);
    let mut a = session(a_dir.path(), &p);
    let mut b = session(b_dir.path(), &p);

    for _ in 0..5 {
        let sa = a.step().unwrap().unwrap();
        let sb = b.step().unwrap().unwrap();
        assert_eq!(sa.delta, sb.delta);
        assert_eq!(sa.stats.reward_sum, sb.stats.reward_sum);
        assert_eq!(sa.stats.best_metric, sb.stats.best_metric);
    }
}

#[test]
fn test_run_tuning_writes_table_matching_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = dir.path().join("artifacts");
    let polls = Rc::new(Cell::new(0u32));
    let counter = polls.clone();

    // Cancels collection on the 10th poll: 4 full steps, then one env step
    // of the 5th.
    let mut s = session(&artifacts, &params(5, 3)).with_timeout_checker(move || {
        let n = counter.get();
        counter.set(n + 1);
        n >= 9
    });
    let path = dir.path().join("step_data.csv");
    let table = run_tuning(&mut s, Duration::from_secs(3600), &path).unwrap();

    assert_eq!(table.len(), 5);
    let rows = StepDataTable::read(&path).unwrap();
    assert_eq!(rows.rows(), table.rows());
    assert!(!rows.rows()[4].continue_training);
    assert_eq!(rows.rows()[4].num_timesteps, 9);
    assert_eq!(ArtifactsReader::open(&artifacts).unwrap().num_steps(), 5);
}
