// src/main.rs
//
// CLI entrypoint: run a tuning session against the synthetic database.
//
// Constraints:
// - Tuning budget precedence:
//     --duration-hours overrides env;
//     else DBTUNE_TUNE_DURATION_HOURS;
//     else tune_duration_hours from the params file.
// - Deterministic runs via --seed (overrides agent.seed).
// - Print a concise run header (params source, horizon, budget, seed).
// - One delta file per step in --artifacts-dir; step table at --step-data.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use dbtune::config::{resolve_tune_duration, TuningParams};
use dbtune::rl::{Deadline, Environment, GreedyReplayLearner, SimEnvConfig, SimTuningEnv};
use dbtune::{
    policy_observation_dim, run_tuning, TelemetrySink, TuningAgentMetadata, TuningSession,
};

#[derive(Debug, Parser)]
#[command(
    name = "dbtune",
    about = "Online RL database tuning loop (synthetic environment)",
    version
)]
struct Args {
    /// Tuning params YAML. Defaults are used when omitted.
    #[arg(long)]
    params: Option<PathBuf>,

    /// Directory receiving metadata.json and step{n}_delta.json.
    #[arg(long, default_value = "tuning_artifacts")]
    artifacts_dir: PathBuf,

    /// Step-data CSV, rewritten after every step.
    #[arg(long, default_value = "step_data.csv")]
    step_data: PathBuf,

    /// Tuning budget in hours (overrides env and params).
    #[arg(long)]
    duration_hours: Option<f64>,

    /// Deterministic seed (overrides agent.seed).
    #[arg(long)]
    seed: Option<u64>,

    /// Workload description recorded in metadata.
    #[arg(long, default_value = "workload")]
    workload_path: PathBuf,

    /// Pristine data snapshot recorded in metadata.
    #[arg(long, default_value = "pristine_dbdata.tgz")]
    pristine_snapshot_path: PathBuf,

    /// Parent directory of database instances recorded in metadata.
    #[arg(long, default_value = "dbdata")]
    dbdata_parent_path: PathBuf,

    /// Database binaries directory recorded in metadata.
    #[arg(long, default_value = "pgbin")]
    pgbin_path: PathBuf,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("reading current directory")?;
    Ok(cwd.join(path))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut params = match &args.params {
        Some(path) => TuningParams::from_yaml_file(path)
            .with_context(|| format!("loading params from {}", path.display()))?,
        None => TuningParams::default(),
    };
    if let Some(seed) = args.seed {
        params.agent.seed = seed;
    }

    let effective =
        resolve_tune_duration(args.duration_hours, &params).context("resolving tuning budget")?;
    effective.log_startup();

    println!(
        "dbtune | params={} | horizon={} | latent_dim={} | budget={:.3}h ({}) | seed={}",
        args.params
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "default".to_string()),
        params.horizon,
        params.embedding.latent_dim,
        effective.hours,
        effective.source.as_str(),
        params.agent.seed,
    );

    let metadata = TuningAgentMetadata::new(
        absolute(&args.workload_path)?,
        absolute(&args.pristine_snapshot_path)?,
        absolute(&args.dbdata_parent_path)?,
        absolute(&args.pgbin_path)?,
    )
    .context("building tuning metadata")?;

    let env_config = SimEnvConfig::default()
        .with_horizon(params.horizon)
        .with_num_knobs(params.embedding.latent_dim);
    let env = SimTuningEnv::new(env_config, params.agent.seed).context("building sim env")?;
    let obs_dim = policy_observation_dim(env.observation_dim(), &params);
    let learner = GreedyReplayLearner::new(obs_dim, params.embedding.latent_dim);

    let budget = effective.as_duration()?;
    let mut session = TuningSession::build(
        env,
        learner,
        &params,
        metadata,
        absolute(&args.artifacts_dir)?,
        TelemetrySink::from_env(),
    )
    .context("building tuning session")?
    .with_timeout_checker(Deadline::after(budget));

    let table = run_tuning(&mut session, budget, &args.step_data).context("tuning run failed")?;

    let last = table.rows().last();
    println!(
        "dbtune | steps={} | timesteps={} | best={} | real_best={} | artifacts={}",
        table.len(),
        last.map(|r| r.num_timesteps).unwrap_or(0),
        fmt_metric(last.and_then(|r| r.best_metric)),
        fmt_metric(last.and_then(|r| r.real_best_metric)),
        session.artifacts_dir().display(),
    );
    Ok(())
}

fn fmt_metric(metric: Option<f64>) -> String {
    metric
        .map(|m| format!("{:.3}", m))
        .unwrap_or_else(|| "none".to_string())
}
