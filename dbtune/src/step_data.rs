// src/step_data.rs
//
// Cumulative per-step statistics table (CSV).
//
// The table lives in memory and is rewritten in full after every step: the
// rows go to a sibling temp file that is then renamed over the target, so a
// crash mid-write leaves the previous complete table in place.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One row of the step-data table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub step: usize,
    pub elapsed_s: f64,
    pub num_timesteps: u64,
    pub episodes: u64,
    pub reward_sum: f64,
    pub last_metric: Option<f64>,
    pub best_metric: Option<f64>,
    pub real_best_metric: Option<f64>,
    pub curriculum_bias: f64,
    pub curriculum_episodes: u64,
    pub timed_out: bool,
    pub continue_training: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StepDataTable {
    rows: Vec<StepStats>,
}

impl StepDataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: StepStats) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[StepStats] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replace `path` with the full table.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = tmp_path(path);
        {
            let mut wtr = csv::Writer::from_path(&tmp)?;
            for row in &self.rows {
                wtr.serialize(row)?;
            }
            wtr.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let rows = rdr
            .deserialize()
            .collect::<std::result::Result<Vec<StepStats>, csv::Error>>()?;
        Ok(Self { rows })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
