// src/agent.rs
//
// Tuning agent surface and its replayable artifacts.
//
// Layout of an artifacts directory:
// - metadata.json          written once when the writer is created
// - params.yaml            the effective tuning params, written alongside
// - step{n}_delta.json     one per completed tuning step, n = 0, 1, 2, ...
//
// Deltas are write-once. Replaying a run means reading metadata and params
// plus the contiguous run of step files starting at 0. Folding the deltas in
// order from the pristine configuration yields the live configuration after
// the last step, episode resets included.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TuningParams;
use crate::error::{Result, TuneError};
use crate::step_data::StepStats;

pub const METADATA_FILE: &str = "metadata.json";
pub const PARAMS_FILE: &str = "params.yaml";

pub fn step_delta_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("step{}_delta.json", step))
}

pub fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

pub fn params_path(dir: &Path) -> PathBuf {
    dir.join(PARAMS_FILE)
}

/// Change to the database configuration made by one tuning step.
///
/// `indexes` holds index DDL (drops included); `qknobs` maps a query id to
/// hints prepended to that query, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDelta {
    pub indexes: Vec<String>,
    pub sysknobs: BTreeMap<String, String>,
    pub qknobs: BTreeMap<String, Vec<String>>,
}

impl ConfigDelta {
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty() && self.sysknobs.is_empty() && self.qknobs.is_empty()
    }

    /// Fold a later delta into this one: index statements append, knob
    /// values from `later` win.
    pub fn merge(&mut self, later: &ConfigDelta) {
        self.indexes.extend(later.indexes.iter().cloned());
        for (k, v) in &later.sysknobs {
            self.sysknobs.insert(k.clone(), v.clone());
        }
        for (q, hints) in &later.qknobs {
            self.qknobs.insert(q.clone(), hints.clone());
        }
    }
}

/// Configuration reached by applying deltas in order to the pristine one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayedConfig {
    /// Every index statement, in application order.
    pub index_statements: Vec<String>,
    pub sysknobs: BTreeMap<String, String>,
    /// Queries with at least one hint; an empty list clears a query.
    pub qknobs: BTreeMap<String, Vec<String>>,
}

impl ReplayedConfig {
    pub fn apply(&mut self, delta: &ConfigDelta) {
        self.index_statements.extend(delta.indexes.iter().cloned());
        for (k, v) in &delta.sysknobs {
            self.sysknobs.insert(k.clone(), v.clone());
        }
        for (q, hints) in &delta.qknobs {
            if hints.is_empty() {
                self.qknobs.remove(q);
            } else {
                self.qknobs.insert(q.clone(), hints.clone());
            }
        }
    }
}

/// Identifies what a run tuned, so it can be replayed later.
///
/// Every path must already be absolute; artifacts outlive the working
/// directory they were produced from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningAgentMetadata {
    pub workload_path: PathBuf,
    pub pristine_dbdata_snapshot_path: PathBuf,
    pub dbdata_parent_path: PathBuf,
    pub pgbin_path: PathBuf,
}

impl TuningAgentMetadata {
    pub fn new(
        workload_path: impl Into<PathBuf>,
        pristine_dbdata_snapshot_path: impl Into<PathBuf>,
        dbdata_parent_path: impl Into<PathBuf>,
        pgbin_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let metadata = Self {
            workload_path: workload_path.into(),
            pristine_dbdata_snapshot_path: pristine_dbdata_snapshot_path.into(),
            dbdata_parent_path: dbdata_parent_path.into(),
            pgbin_path: pgbin_path.into(),
        };
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn validate(&self) -> Result<()> {
        let fields: [(&'static str, &Path); 4] = [
            ("workload_path", self.workload_path.as_path()),
            (
                "pristine_dbdata_snapshot_path",
                self.pristine_dbdata_snapshot_path.as_path(),
            ),
            ("dbdata_parent_path", self.dbdata_parent_path.as_path()),
            ("pgbin_path", self.pgbin_path.as_path()),
        ];
        for (field, path) in fields {
            if !path.is_absolute() {
                return Err(TuneError::NotResolved {
                    field,
                    path: path.to_path_buf(),
                });
            }
        }
        Ok(())
    }
}

/// Result of one completed tuning step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step: usize,
    pub delta: ConfigDelta,
    pub stats: StepStats,
    /// False once the timeout checker cancelled collection.
    pub continue_training: bool,
}

pub trait TuningAgent {
    fn metadata(&self) -> &TuningAgentMetadata;

    /// Run one tuning step and persist its delta before returning.
    ///
    /// `None` means collection was cancelled before anything ran and the
    /// configuration is unchanged; nothing was persisted for it.
    fn step(&mut self) -> Result<Option<StepOutput>>;
}

/// Writes metadata once, then one delta file per step.
#[derive(Debug)]
pub struct ArtifactWriter {
    dir: PathBuf,
    next_step: usize,
}

impl ArtifactWriter {
    pub fn create(
        dir: impl Into<PathBuf>,
        metadata: &TuningAgentMetadata,
        params: &TuningParams,
    ) -> Result<Self> {
        metadata.validate()?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(metadata_path(&dir), json)?;
        // Replaying requires the params that produced the deltas.
        fs::write(params_path(&dir), serde_yaml::to_string(params)?)?;

        Ok(Self { dir, next_step: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn next_step(&self) -> usize {
        self.next_step
    }

    /// Persist `delta` as the next step and return its number.
    pub fn write_step(&mut self, delta: &ConfigDelta) -> Result<usize> {
        let step = self.next_step;
        let path = step_delta_path(&self.dir, step);
        fs::write(&path, serde_json::to_string(delta)?)?;
        self.next_step += 1;
        debug!(step, path = %path.display(), "persisted step delta");
        Ok(step)
    }
}

/// Reads back an artifacts directory for replay.
#[derive(Debug)]
pub struct ArtifactsReader {
    dir: PathBuf,
    num_steps: usize,
}

impl ArtifactsReader {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut num_steps = 0;
        while step_delta_path(&dir, num_steps).exists() {
            num_steps += 1;
        }
        Ok(Self { dir, num_steps })
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn metadata(&self) -> Result<TuningAgentMetadata> {
        let raw = fs::read_to_string(metadata_path(&self.dir))?;
        let metadata: TuningAgentMetadata = serde_json::from_str(&raw)?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn params(&self) -> Result<TuningParams> {
        TuningParams::from_yaml_file(params_path(&self.dir))
    }

    pub fn step_delta(&self, step: usize) -> Result<ConfigDelta> {
        if step >= self.num_steps {
            return Err(TuneError::StepOutOfRange {
                step,
                num_steps: self.num_steps,
            });
        }
        let raw = fs::read_to_string(step_delta_path(&self.dir, step))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn all_deltas(&self) -> Result<Vec<ConfigDelta>> {
        (0..self.num_steps).map(|s| self.step_delta(s)).collect()
    }

    /// Configuration after steps `0..=step`.
    pub fn replay_through(&self, step: usize) -> Result<ReplayedConfig> {
        let mut config = ReplayedConfig::default();
        for s in 0..=step {
            config.apply(&self.step_delta(s)?);
        }
        Ok(config)
    }

}
