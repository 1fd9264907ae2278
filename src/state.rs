//! The build-state JSON shape and the small "bookmark" type the resume
//! engine and executor drive it through: the one piece of cross-subsystem
//! mutable state, confined behind `mark_success`/`mark_failure`/
//! `completed`/`reconcile_inputs`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_FORMAT_VERSION: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub phase: String,
    pub step: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRef {
    pub phase: String,
    pub step: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub format_version: i64,
    pub rootfs_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub plan_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides_path: Option<PathBuf>,
    pub plan_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidation_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub completed_steps: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<StepRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureRef>,
}

impl BuildState {
    pub fn new(rootfs_id: String, plan_path: PathBuf, plan_digest: String, now: DateTime<Utc>) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            rootfs_id,
            created_at: now,
            updated_at: now,
            plan_path,
            overrides_path: None,
            plan_digest,
            overrides_digest: None,
            report_dir: None,
            invalidation_reason: None,
            current_phase: None,
            completed_steps: BTreeMap::new(),
            last_success: None,
            last_failure: None,
        }
    }

    pub fn is_step_complete(&self, phase: &str, step: &str) -> bool {
        self.completed_steps
            .get(phase)
            .map(|v| v.iter().any(|s| s == step))
            .unwrap_or(false)
    }
}

/// Load/save + digest-reconciliation wrapper around [`BuildState`]. All
/// executor and resume-engine interaction with the state file goes through
/// this type rather than touching the JSON directly.
#[derive(Debug)]
pub struct Bookmark {
    path: PathBuf,
    state: BuildState,
}

impl Bookmark {
    pub fn load_or_init(
        path: &Path,
        rootfs_id_if_new: impl FnOnce() -> String,
        plan_path: &Path,
        plan_digest: String,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading state file {}", path.display()))?;
            let state: BuildState = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing state file {}", path.display()))?;
            Ok(Self { path: path.to_path_buf(), state })
        } else {
            let state = BuildState::new(rootfs_id_if_new(), plan_path.to_path_buf(), plan_digest, now);
            Ok(Self { path: path.to_path_buf(), state })
        }
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    /// Re-checks the plan/overrides digests against what's recorded; if
    /// either differs, clears all progress and records the invalidation
    /// reason exactly once.
    pub fn reconcile_inputs(&mut self, plan_digest: &str, overrides_digest: Option<&str>) {
        let plan_changed = self.state.plan_digest != plan_digest;
        let overrides_changed = self.state.overrides_digest.as_deref() != overrides_digest;
        if plan_changed || overrides_changed {
            self.state.completed_steps.clear();
            self.state.last_success = None;
            self.state.last_failure = None;
            self.state.invalidation_reason = Some(if plan_changed {
                "plan digest changed since state was recorded".to_string()
            } else {
                "overrides digest changed since state was recorded".to_string()
            });
            self.state.plan_digest = plan_digest.to_string();
            self.state.overrides_digest = overrides_digest.map(str::to_string);
        }
    }

    pub fn completed(&self, phase: &str, step: &str) -> bool {
        self.state.is_step_complete(phase, step)
    }

    pub fn mark_success(&mut self, phase: &str, step: &str, now: DateTime<Utc>) -> Result<()> {
        self.state
            .completed_steps
            .entry(phase.to_string())
            .or_default()
            .push(step.to_string());
        self.state.last_success = Some(StepRef {
            phase: phase.to_string(),
            step: step.to_string(),
        });
        self.state.current_phase = Some(phase.to_string());
        self.state.updated_at = now;
        self.persist()
    }

    pub fn mark_failure(
        &mut self,
        phase: &str,
        step: &str,
        error: String,
        exit_code: Option<i32>,
        report_path: Option<PathBuf>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.state.last_failure = Some(FailureRef {
            phase: phase.to_string(),
            step: step.to_string(),
            error,
            exit_code,
            report_path,
        });
        self.state.current_phase = Some(phase.to_string());
        self.state.updated_at = now;
        self.persist()
    }

    /// True when the last recorded failure refers to exactly this step;
    /// used to suppress a clean-build wipe on an in-place retry.
    pub fn last_failure_was(&self, phase: &str, step: &str) -> bool {
        self.state
            .last_failure
            .as_ref()
            .map(|f| f.phase == phase && f.step == step)
            .unwrap_or(false)
    }

    fn persist(&self) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)
            .with_context(|| format!("writing state file {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn mark_success_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let mut bm = Bookmark::load_or_init(&state_path, || "abc123".into(), Path::new("/plan.json"), "deadbeef".into(), now()).unwrap();
        assert!(!bm.completed("x", "a"));
        bm.mark_success("x", "a", now()).unwrap();
        assert!(bm.completed("x", "a"));
        bm.mark_success("x", "b", now()).unwrap();
        assert!(bm.completed("x", "a"));
        assert!(bm.completed("x", "b"));
    }

    #[test]
    fn reconcile_clears_on_digest_change() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let mut bm = Bookmark::load_or_init(&state_path, || "abc123".into(), Path::new("/plan.json"), "deadbeef".into(), now()).unwrap();
        bm.mark_success("x", "a", now()).unwrap();
        bm.reconcile_inputs("deadbeef", None);
        assert!(bm.completed("x", "a"), "unchanged digest must not clear progress");
        bm.reconcile_inputs("feedface", None);
        assert!(!bm.completed("x", "a"));
        assert!(bm.state().invalidation_reason.is_some());
    }
}
