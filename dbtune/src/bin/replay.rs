// src/bin/replay.rs
//
// Print the configuration deltas recorded by a tuning run, in step order.
// With --final, print the configuration the run ended on instead.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use dbtune::agent::ArtifactsReader;
use dbtune::telemetry::ensure_schema_v1;

struct ReplayArgs {
    artifacts_dir: PathBuf,
    step: Option<usize>,
    jsonl: bool,
    final_config: bool,
}

fn parse_args() -> Result<ReplayArgs, String> {
    let mut args = env::args().skip(1);
    let mut artifacts_dir: Option<PathBuf> = None;
    let mut step = None;
    let mut jsonl = false;
    let mut final_config = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--artifacts-dir" => {
                let val = args.next().ok_or("Missing value for --artifacts-dir")?;
                artifacts_dir = Some(PathBuf::from(val));
            }
            "--step" => {
                let val = args.next().ok_or("Missing value for --step")?;
                step = Some(
                    val.parse::<usize>()
                        .map_err(|e| format!("Invalid --step {val}: {e}"))?,
                );
            }
            "--jsonl" => jsonl = true,
            "--final" => final_config = true,
            "--help" | "-h" => {
                println!("USAGE: replay --artifacts-dir <PATH> [--step <N>] [--jsonl] [--final]");
                std::process::exit(0);
            }
            _ => return Err(format!("Unknown argument: {arg}")),
        }
    }
    Ok(ReplayArgs {
        artifacts_dir: artifacts_dir.ok_or("Missing required --artifacts-dir <PATH>")?,
        step,
        jsonl,
        final_config,
    })
}

fn main() -> Result<()> {
    let args = parse_args().map_err(anyhow::Error::msg)?;

    let reader = ArtifactsReader::open(&args.artifacts_dir)
        .with_context(|| format!("opening {}", args.artifacts_dir.display()))?;
    let metadata = reader.metadata().context("reading metadata.json")?;
    let params = reader.params().context("reading params.yaml")?;

    if args.final_config {
        let Some(last) = reader.num_steps().checked_sub(1) else {
            println!("replay | no steps recorded");
            return Ok(());
        };
        let config = reader.replay_through(args.step.unwrap_or(last))?;
        println!("replay | configuration after step {}", args.step.unwrap_or(last));
        for stmt in &config.index_statements {
            println!("    {}", stmt);
        }
        for (knob, value) in &config.sysknobs {
            println!("    SET {} = {}", knob, value);
        }
        for (query, hints) in &config.qknobs {
            println!("    {}: {}", query, hints.join(" "));
        }
        return Ok(());
    }

    let steps: Vec<usize> = match args.step {
        Some(step) => vec![step],
        None => (0..reader.num_steps()).collect(),
    };

    if !args.jsonl {
        println!(
            "replay | workload={} | snapshot={} | horizon={} | objective={:?} | steps={}",
            metadata.workload_path.display(),
            metadata.pristine_dbdata_snapshot_path.display(),
            params.horizon,
            params.objective,
            reader.num_steps()
        );
    }

    for step in steps {
        let delta = reader.step_delta(step)?;
        if args.jsonl {
            let mut record = serde_json::json!({ "step": step, "delta": delta });
            ensure_schema_v1(&mut record);
            println!("{}", serde_json::to_string(&record)?);
            continue;
        }

        println!(
            "step {:>4} | indexes={} sysknobs={} qknobs={}",
            step,
            delta.indexes.len(),
            delta.sysknobs.len(),
            delta.qknobs.len()
        );
        for stmt in &delta.indexes {
            println!("    {}", stmt);
        }
        for (knob, value) in &delta.sysknobs {
            println!("    SET {} = {}", knob, value);
        }
        for (query, hints) in &delta.qknobs {
            println!("    {}: {}", query, hints.join(" "));
        }
    }
    Ok(())
}
