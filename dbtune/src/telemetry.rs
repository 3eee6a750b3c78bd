//! telemetry.rs
//!
//! JSONL telemetry sink for tuning runs: one JSON object per tuning step.
//!
//! # Environment variables
//!
//! - `DBTUNE_TELEMETRY_MODE`: `"off"` (default) disables telemetry,
//!   `"jsonl"` writes JSONL to `DBTUNE_TELEMETRY_PATH`.
//! - `DBTUNE_TELEMETRY_PATH`: Path to the JSONL file. Required when mode is
//!   `"jsonl"`.
//! - `DBTUNE_TELEMETRY_APPEND`: Optional. When set to `"1"`/`"true"`/`"yes"`,
//!   appends to existing files instead of truncating. Default is truncate.
//!
//! # Schema Version Contract
//!
//! The sink is a generic JSONL writer and does not inject `schema_version`.
//! [`step_record`] builds records that already carry it; ad-hoc producers
//! should pass their records through [`ensure_schema_v1`].
//!
//! Telemetry never fails the tuning loop: I/O problems switch the sink off
//! for the rest of the process.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde_json::{json, Value as JsonValue};
use tracing::warn;

use crate::step_data::StepStats;

pub const MODE_ENV_VAR: &str = "DBTUNE_TELEMETRY_MODE";
pub const PATH_ENV_VAR: &str = "DBTUNE_TELEMETRY_PATH";
pub const APPEND_ENV_VAR: &str = "DBTUNE_TELEMETRY_APPEND";

/// Current telemetry schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Insert `schema_version: 1` into an object record if it is missing.
pub fn ensure_schema_v1(record: &mut JsonValue) {
    match record {
        JsonValue::Object(map) => {
            map.entry("schema_version")
                .or_insert_with(|| JsonValue::Number(SCHEMA_VERSION.into()));
        }
        _ => {
            debug_assert!(
                false,
                "ensure_schema_v1: telemetry records should be JSON objects, got {:?}",
                record
            );
        }
    }
}

/// Telemetry record for one completed tuning step.
pub fn step_record(stats: &StepStats) -> JsonValue {
    json!({
        "schema_version": SCHEMA_VERSION,
        "step": stats.step,
        "elapsed_s": stats.elapsed_s,
        "num_timesteps": stats.num_timesteps,
        "episodes": stats.episodes,
        "reward_sum": stats.reward_sum,
        "last_metric": stats.last_metric,
        "best_metric": stats.best_metric,
        "real_best_metric": stats.real_best_metric,
        "curriculum_bias": stats.curriculum_bias,
        "curriculum_episodes": stats.curriculum_episodes,
        "timed_out": stats.timed_out,
        "continue_training": stats.continue_training,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Off,
    Jsonl,
}

impl TelemetryMode {
    /// Parse mode from environment. Defaults to Off.
    pub fn from_env() -> Self {
        match env::var(MODE_ENV_VAR) {
            Ok(s) => Self::parse(&s),
            Err(_) => TelemetryMode::Off,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "jsonl" => TelemetryMode::Jsonl,
            // Unknown values mean off.
            _ => TelemetryMode::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub path: Option<PathBuf>,
    pub append: bool,
}

impl TelemetryConfig {
    pub fn off() -> Self {
        Self {
            mode: TelemetryMode::Off,
            path: None,
            append: false,
        }
    }

    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: TelemetryMode::Jsonl,
            path: Some(path.into()),
            append: false,
        }
    }

    pub fn from_env() -> Self {
        let mode = TelemetryMode::from_env();
        let path = if mode == TelemetryMode::Jsonl {
            env::var(PATH_ENV_VAR).ok().map(PathBuf::from)
        } else {
            None
        };
        TelemetryConfig {
            mode,
            path,
            append: Self::append_from_env(),
        }
    }

    pub fn append_from_env() -> bool {
        env::var(APPEND_ENV_VAR)
            .ok()
            .map(|value| matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

/// When mode == Off every method is a no-op. When mode == Jsonl the file is
/// opened lazily on first use.
pub struct TelemetrySink {
    mode: TelemetryMode,
    path: Option<PathBuf>,
    append: bool,
    writer: Option<BufWriter<File>>,
}

impl TelemetrySink {
    pub fn from_env() -> Self {
        Self::from_config(TelemetryConfig::from_env())
    }

    pub fn from_config(cfg: TelemetryConfig) -> Self {
        TelemetrySink {
            mode: cfg.mode,
            path: cfg.path,
            append: cfg.append,
            writer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == TelemetryMode::Jsonl
    }

    fn disable(&mut self, reason: &str) {
        warn!(reason, "telemetry disabled");
        self.mode = TelemetryMode::Off;
        self.writer = None;
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.mode != TelemetryMode::Jsonl {
            return None;
        }

        if self.writer.is_none() {
            let path = match &self.path {
                Some(p) => p.clone(),
                None => {
                    self.disable("jsonl mode without a path");
                    return None;
                }
            };

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            let mut options = OpenOptions::new();
            options.create(true).write(true);
            if self.append {
                options.append(true);
            } else {
                options.truncate(true);
            }

            match options.open(&path) {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(_) => {
                    self.disable("cannot open telemetry file");
                    return None;
                }
            }
        }

        self.writer.as_mut()
    }

    /// Log a JSON value as a single line.
    pub fn log_json(&mut self, value: &JsonValue) {
        if self.mode != TelemetryMode::Jsonl {
            return;
        }

        let line = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(_) => return,
        };

        let failed = match self.ensure_writer() {
            Some(w) => writeln!(w, "{}", line).is_err(),
            None => return,
        };
        if failed {
            self.disable("write failed");
        }
    }

    pub fn log_step(&mut self, stats: &StepStats) {
        self.log_json(&step_record(stats));
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}
