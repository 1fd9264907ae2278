//! Failure report schema and writer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::{EnvMap, Phase, Step};

pub const REPORT_FORMAT_VERSION: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub name: String,
    pub environment: String,
    pub workspace: String,
    pub install_prefix: String,
    pub destdir: Option<String>,
    pub env: EnvMap,
}

impl From<&Phase> for PhaseSnapshot {
    fn from(p: &Phase) -> Self {
        Self {
            name: p.name.clone(),
            environment: p.environment.as_str().to_string(),
            workspace: p.workspace.clone(),
            install_prefix: p.install_prefix.clone(),
            destdir: p.destdir.clone(),
            env: p.env.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub name: String,
    pub strategy: String,
    pub workdir: String,
    pub install_prefix: Option<String>,
    pub destdir: Option<String>,
    pub env: EnvMap,
    pub effective_env: EnvMap,
    pub configure_flags: Vec<String>,
    pub patches: Vec<String>,
}

impl StepSnapshot {
    pub fn new(step: &Step, effective_env: EnvMap) -> Self {
        Self {
            name: step.name.clone(),
            strategy: step.strategy.as_tag().to_string(),
            workdir: step.workdir.clone(),
            install_prefix: step.install_prefix.clone(),
            destdir: step.destdir.clone(),
            env: step.env.clone(),
            effective_env,
            configure_flags: step.configure_flags.clone(),
            patches: step.patches.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub format_version: i64,
    pub occurred_at: DateTime<Utc>,
    pub phase: PhaseSnapshot,
    pub step: StepSnapshot,
    pub command: Option<Vec<String>>,
    pub exit_code: Option<i32>,
    pub error: String,
}

impl FailureReport {
    /// Writes the report to
    /// `<report_dir>/<timestamp>-<phase>-<step>-<rand>.json` and returns the
    /// path.
    pub fn write(&self, report_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(report_dir)
            .with_context(|| format!("creating report dir {}", report_dir.display()))?;

        let rand_suffix: u32 = rand::thread_rng().gen();
        let filename = format!(
            "{}-{}-{}-{:08x}.json",
            self.occurred_at.format("%Y%m%dT%H%M%SZ"),
            self.phase.name,
            self.step.name,
            rand_suffix,
        );
        let path = report_dir.join(filename);
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, bytes)
            .with_context(|| format!("writing failure report {}", path.display()))?;
        Ok(path)
    }
}
