//! Plan executor: phase/package/resume filtering, environment inheritance,
//! and the step execution loop.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{CommandError, ValidationError};
use crate::model::{EnvMap, Phase, Plan, Step};
use crate::report::{FailureReport, PhaseSnapshot, StepSnapshot, REPORT_FORMAT_VERSION};
use crate::state::Bookmark;

use super::strategy::{self, HostSetupCallbacks, StrategyContext};

pub const ROOTFS_MARKER_NAME: &str = ".bq2-rootfs";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub phase: Option<String>,
    pub packages: Option<Vec<String>>,
    pub report_dir: PathBuf,
    pub dry_run: bool,
    pub resume: bool,
    pub allow_outside_rootfs: bool,
    /// Root of the workspace's rootfs tree; `<rootfs_root>/.bq2-rootfs` is
    /// the marker the executor consults.
    pub rootfs_root: PathBuf,
    /// `BQ2_ROOTFS` forces marker semantics on or off regardless of the
    /// on-disk file.
    pub marker_override: Option<bool>,
}

impl ExecutorConfig {
    pub fn marker_present(&self) -> bool {
        self.marker_override
            .unwrap_or_else(|| self.rootfs_root.join(ROOTFS_MARKER_NAME).is_file())
    }
}

/// Selects which phase names will run, honoring the `"all"` sentinel and
/// the rootfs-marker default.
pub fn select_phases(plan: &Plan, phase_arg: Option<&str>, marker_present: bool) -> Result<Vec<String>, ValidationError> {
    match phase_arg {
        Some("all") => Ok(plan.phases.iter().map(|p| p.name.clone()).collect()),
        Some(name) => {
            if plan.phase(name).is_some() {
                Ok(vec![name.to_string()])
            } else {
                Err(ValidationError::UnknownPhase(name.to_string()))
            }
        }
        None => {
            if marker_present {
                plan.phases
                    .iter()
                    .find(|p| p.environment.is_rootfs())
                    .map(|p| vec![p.name.clone()])
                    .ok_or(ValidationError::EmptyPlan)
            } else {
                plan.phases
                    .first()
                    .map(|p| vec![p.name.clone()])
                    .ok_or(ValidationError::EmptyPlan)
            }
        }
    }
}

/// Rewrites `phase.steps` to the matching subset of `packages`, preserving
/// the caller-specified order. Unknown names raise with the full unmatched
/// list.
pub fn filter_packages(phase: &mut Phase, packages: &[String]) -> Result<(), ValidationError> {
    let available: BTreeSet<&str> = phase.steps.iter().map(|s| s.name.as_str()).collect();
    let unmatched: Vec<String> = packages.iter().filter(|p| !available.contains(p.as_str())).cloned().collect();
    if !unmatched.is_empty() {
        return Err(ValidationError::UnknownPackages(unmatched));
    }
    let mut by_name: std::collections::HashMap<String, Step> =
        phase.steps.drain(..).map(|s| (s.name.clone(), s)).collect();
    phase.steps = packages
        .iter()
        .filter_map(|p| by_name.remove(p))
        .collect();
    Ok(())
}

/// Drops steps already recorded complete in `bookmark` for this phase
///. Returns `true` if the phase is now empty and
/// should be removed entirely.
pub fn filter_resume(phase: &mut Phase, bookmark: &Bookmark) -> bool {
    phase.steps.retain(|s| !bookmark.completed(&phase.name, &s.name));
    phase.steps.is_empty()
}

/// Computes the effective environment for one step: `phase.env ∪ step.env`
/// with step keys winning, then (when the rootfs marker is present) the
/// hardcoded native overlay, then `LD_LIBRARY_PATH` augmentation.
pub fn effective_env(phase: &Phase, step: &Step, rootfs_active: bool, install_prefix: &str) -> EnvMap {
    let mut env = phase.env.clone();
    for (k, v) in &step.env {
        env.insert(k.clone(), v.clone());
    }

    if rootfs_active {
        let path = env.get("PATH").cloned().unwrap_or_else(|| "/usr/bin:/bin".to_string());
        let mut parts: Vec<&str> = path.split(':').collect();
        if let Some(pos) = parts.iter().position(|p| *p == "/usr/bin") {
            parts.remove(pos);
        }
        parts.insert(0, "/usr/bin");
        env.insert("PATH".to_string(), parts.join(":"));
        env.entry("CC".to_string()).or_insert_with(|| "clang".to_string());
        env.entry("CXX".to_string()).or_insert_with(|| "clang++".to_string());
    }

    if let Some(path) = env.get("PATH").cloned() {
        if path.split(':').any(|p| p == install_prefix || p.starts_with(&format!("{}/", install_prefix))) {
            let lib_dir = format!("{}/lib", install_prefix.trim_end_matches('/'));
            let already_present = env
                .get("LD_LIBRARY_PATH")
                .map(|v| v.split(':').any(|p| p == lib_dir))
                .unwrap_or(false);
            if !already_present {
                let mut ld = env.get("LD_LIBRARY_PATH").cloned().unwrap_or_default();
                if ld.is_empty() {
                    ld = lib_dir;
                } else {
                    ld = format!("{}:{}", lib_dir, ld);
                }
                env.insert("LD_LIBRARY_PATH".to_string(), ld);
            }
        }
    }

    env
}

/// Runs every selected, filtered step of `phase` in order, updating
/// `bookmark` after each outcome.
pub fn run_phase(
    phase: &Phase,
    cfg: &ExecutorConfig,
    bookmark: &mut Bookmark,
    hooks: &mut dyn HostSetupCallbacks,
) -> Result<()> {
    let rootfs_active = phase.environment.is_rootfs();
    let cpus = crate::process::cpu_count();

    for step in &phase.steps {
        if cfg.resume && bookmark.completed(&phase.name, &step.name) {
            continue;
        }

        let rootfs_label = if rootfs_active { "workspace" } else { "seed" };
        info!(
            "Building {} in {} (phase={}, rootfs={})",
            step.name, step.workdir, phase.name, rootfs_label
        );

        let install_prefix = step.install_prefix.clone().unwrap_or_else(|| phase.install_prefix.clone());
        let destdir = step.destdir.clone().or_else(|| phase.destdir.clone());
        let env = effective_env(phase, step, rootfs_active, &install_prefix);
        let suppress_clean_build = bookmark.last_failure_was(&phase.name, &step.name);

        if cfg.dry_run {
            debug!("dry-run: skipping execution of {}", step.name);
            bookmark.mark_success(&phase.name, &step.name, Utc::now())?;
            continue;
        }

        let ctx = StrategyContext {
            step,
            phase,
            effective_env: &env,
            install_prefix,
            destdir,
            cpus,
            suppress_clean_build,
        };

        let outcome = strategy::apply_patches(&ctx).and_then(|_| strategy::run(&ctx, hooks));

        match outcome {
            Ok(()) => {
                bookmark.mark_success(&phase.name, &step.name, Utc::now())?;
            }
            Err(err) => {
                let (command, exit_code) = command_failure(&err);
                let report = FailureReport {
                    format_version: REPORT_FORMAT_VERSION,
                    occurred_at: Utc::now(),
                    phase: PhaseSnapshot::from(phase),
                    step: StepSnapshot::new(step, env.clone()),
                    command,
                    exit_code,
                    error: err.to_string(),
                };
                let report_path = report.write(&cfg.report_dir).ok();
                bookmark.mark_failure(&phase.name, &step.name, err.to_string(), exit_code, report_path, Utc::now())?;
                return Err(err).with_context(|| format!("step {} in phase {} failed", step.name, phase.name));
            }
        }
    }

    Ok(())
}

/// Recovers the argv/exit code of the command that actually failed, walking
/// the error's source chain for the `CommandError` strategy functions attach
/// underneath their `anyhow::Context` prefix.
fn command_failure(err: &anyhow::Error) -> (Option<Vec<String>>, Option<i32>) {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CommandError>())
        .map(|cmd_err| match cmd_err {
            CommandError::Failed { argv, exit_code, .. } => (Some(argv.clone()), *exit_code),
            CommandError::PatchFailed { argv, exit_code, .. } => (Some(argv.clone()), Some(*exit_code)),
        })
        .unwrap_or((None, None))
}

/// True when `phase` may only run with the rootfs marker present or the
/// caller's explicit opt-in.
pub fn is_rootfs_only(phase: &Phase) -> bool {
    phase.environment.as_str().starts_with("rootfs-")
}

pub fn rootfs_gate_satisfied(phase: &Phase, cfg: &ExecutorConfig) -> bool {
    !is_rootfs_only(phase) || cfg.marker_present() || cfg.allow_outside_rootfs
}

pub fn workspace_rootfs_needs_entry(cfg: &ExecutorConfig) -> bool {
    cfg.rootfs_root.is_dir() && !cfg.marker_present()
}

pub fn marker_path(rootfs_root: &Path) -> PathBuf {
    rootfs_root.join(ROOTFS_MARKER_NAME)
}
