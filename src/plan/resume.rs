//! Resume engine: decides which orchestrator stage to (re)start at.

use std::path::{Path, PathBuf};

use crate::digest::hex_sha256;
use crate::model::Plan;
use crate::state::BuildState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    DownloadSources,
    PlanWrite,
    SysrootRunner,
    RootfsTarball,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ResumeDecision {
    pub stage: Stage,
    pub reason: String,
    pub resume_phase: Option<String>,
    pub resume_step: Option<String>,
    pub plan_path: PathBuf,
    pub state_path: PathBuf,
}

pub struct ResumeInputs<'a> {
    pub plan_path: PathBuf,
    pub state_path: PathBuf,
    pub rootfs_tarball_path: PathBuf,
    pub expected_source_basenames: &'a [String],
    pub cache_dir: &'a Path,
}

/// Implements the four-step resume decision procedure.
pub fn decide(inputs: &ResumeInputs) -> ResumeDecision {
    for basename in inputs.expected_source_basenames {
        if !inputs.cache_dir.join(basename).is_file() {
            return ResumeDecision {
                stage: Stage::DownloadSources,
                reason: format!("source archive {} is missing from the cache", basename),
                resume_phase: None,
                resume_step: None,
                plan_path: inputs.plan_path.clone(),
                state_path: inputs.state_path.clone(),
            };
        }
    }

    if !inputs.plan_path.is_file() {
        return ResumeDecision {
            stage: Stage::PlanWrite,
            reason: "no plan file exists yet".to_string(),
            resume_phase: None,
            resume_step: None,
            plan_path: inputs.plan_path.clone(),
            state_path: inputs.state_path.clone(),
        };
    }

    let plan_bytes = match std::fs::read(&inputs.plan_path) {
        Ok(b) => b,
        Err(e) => {
            return ResumeDecision {
                stage: Stage::SysrootRunner,
                reason: format!("plan file could not be read ({}); starting without resume", e),
                resume_phase: None,
                resume_step: None,
                plan_path: inputs.plan_path.clone(),
                state_path: inputs.state_path.clone(),
            }
        }
    };
    let plan: Option<Plan> = serde_json::from_slice(&plan_bytes).ok();
    let plan_digest = hex_sha256(&plan_bytes);

    if !inputs.state_path.is_file() {
        return ResumeDecision {
            stage: Stage::SysrootRunner,
            reason: "plan exists but no state file has been recorded yet".to_string(),
            resume_phase: None,
            resume_step: None,
            plan_path: inputs.plan_path.clone(),
            state_path: inputs.state_path.clone(),
        };
    }

    let state_bytes = match std::fs::read(&inputs.state_path) {
        Ok(b) => b,
        Err(e) => {
            return ResumeDecision {
                stage: Stage::SysrootRunner,
                reason: format!("state file could not be read ({}); starting without resume", e),
                resume_phase: None,
                resume_step: None,
                plan_path: inputs.plan_path.clone(),
                state_path: inputs.state_path.clone(),
            }
        }
    };
    let state: BuildState = match serde_json::from_slice(&state_bytes) {
        Ok(s) => s,
        Err(e) => {
            return ResumeDecision {
                stage: Stage::SysrootRunner,
                reason: format!("state file is not valid JSON ({}); starting without resume", e),
                resume_phase: None,
                resume_step: None,
                plan_path: inputs.plan_path.clone(),
                state_path: inputs.state_path.clone(),
            }
        }
    };

    if state.plan_digest != plan_digest {
        return ResumeDecision {
            stage: Stage::SysrootRunner,
            reason: "recorded state does not match the current plan digest; resuming from scratch".to_string(),
            resume_phase: None,
            resume_step: None,
            plan_path: inputs.plan_path.clone(),
            state_path: inputs.state_path.clone(),
        };
    }

    let Some(plan) = plan else {
        return ResumeDecision {
            stage: Stage::SysrootRunner,
            reason: "plan file is not valid JSON; resuming from scratch".to_string(),
            resume_phase: None,
            resume_step: None,
            plan_path: inputs.plan_path.clone(),
            state_path: inputs.state_path.clone(),
        };
    };

    for phase in &plan.phases {
        for step in &phase.steps {
            if !state.is_step_complete(&phase.name, &step.name) {
                return ResumeDecision {
                    stage: Stage::SysrootRunner,
                    reason: format!("resuming at phase {} step {}", phase.name, step.name),
                    resume_phase: Some(phase.name.clone()),
                    resume_step: Some(step.name.clone()),
                    plan_path: inputs.plan_path.clone(),
                    state_path: inputs.state_path.clone(),
                };
            }
        }
    }

    if !inputs.rootfs_tarball_path.is_file() {
        return ResumeDecision {
            stage: Stage::RootfsTarball,
            reason: "all steps are complete but the output tarball is missing".to_string(),
            resume_phase: None,
            resume_step: None,
            plan_path: inputs.plan_path.clone(),
            state_path: inputs.state_path.clone(),
        };
    }

    ResumeDecision {
        stage: Stage::Complete,
        reason: "all phases and steps are complete".to_string(),
        resume_phase: None,
        resume_step: None,
        plan_path: inputs.plan_path.clone(),
        state_path: inputs.state_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvMap, EnvironmentTag, Phase, Step, Strategy};
    use chrono::{TimeZone, Utc};

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            strategy: Strategy::Autotools,
            workdir: "/workspace/x".into(),
            configure_flags: vec![],
            patches: vec![],
            build_dir: None,
            install_prefix: None,
            destdir: None,
            env: EnvMap::new(),
            clean_build: false,
            sources: None,
            extract_sources: None,
            packages: None,
            content: None,
        }
    }

    fn sample_plan() -> Plan {
        Plan {
            format_version: 2,
            phases: vec![Phase {
                name: "host-setup".into(),
                description: "d".into(),
                workspace: "/workspace".into(),
                environment: EnvironmentTag::HostSetup,
                install_prefix: "/opt/sysroot".into(),
                destdir: None,
                env: EnvMap::new(),
                steps: vec![step("a"), step("b")],
            }],
        }
    }

    #[test]
    fn missing_source_archive_wins_over_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = ResumeInputs {
            plan_path: dir.path().join("plan.json"),
            state_path: dir.path().join("state.json"),
            rootfs_tarball_path: dir.path().join("rootfs.tar.gz"),
            expected_source_basenames: &["m4-1.4.19.tar.xz".to_string()],
            cache_dir: dir.path(),
        };
        let decision = decide(&inputs);
        assert_eq!(decision.stage, Stage::DownloadSources);
    }

    #[test]
    fn missing_plan_file_is_plan_write() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = ResumeInputs {
            plan_path: dir.path().join("plan.json"),
            state_path: dir.path().join("state.json"),
            rootfs_tarball_path: dir.path().join("rootfs.tar.gz"),
            expected_source_basenames: &[],
            cache_dir: dir.path(),
        };
        let decision = decide(&inputs);
        assert_eq!(decision.stage, Stage::PlanWrite);
    }

    #[test]
    fn plan_without_state_resumes_without_bookmark() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        std::fs::write(&plan_path, serde_json::to_vec(&sample_plan()).unwrap()).unwrap();
        let inputs = ResumeInputs {
            plan_path,
            state_path: dir.path().join("state.json"),
            rootfs_tarball_path: dir.path().join("rootfs.tar.gz"),
            expected_source_basenames: &[],
            cache_dir: dir.path(),
        };
        let decision = decide(&inputs);
        assert_eq!(decision.stage, Stage::SysrootRunner);
        assert!(decision.resume_phase.is_none());
    }

    #[test]
    fn digest_mismatch_discards_state() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        let plan_bytes = serde_json::to_vec(&sample_plan()).unwrap();
        std::fs::write(&plan_path, &plan_bytes).unwrap();

        let state_path = dir.path().join("state.json");
        let mut state = BuildState::new("r1".into(), plan_path.clone(), "stale-digest".into(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        state.completed_steps.insert("host-setup".into(), vec!["a".into()]);
        std::fs::write(&state_path, serde_json::to_vec(&state).unwrap()).unwrap();

        let inputs = ResumeInputs {
            plan_path,
            state_path,
            rootfs_tarball_path: dir.path().join("rootfs.tar.gz"),
            expected_source_basenames: &[],
            cache_dir: dir.path(),
        };
        let decision = decide(&inputs);
        assert_eq!(decision.stage, Stage::SysrootRunner);
        assert!(decision.resume_phase.is_none());
    }

    #[test]
    fn finds_first_incomplete_step_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        let plan_bytes = serde_json::to_vec(&sample_plan()).unwrap();
        std::fs::write(&plan_path, &plan_bytes).unwrap();
        let digest = hex_sha256(&plan_bytes);

        let state_path = dir.path().join("state.json");
        let mut state = BuildState::new("r1".into(), plan_path.clone(), digest, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        state.completed_steps.insert("host-setup".into(), vec!["a".into()]);
        std::fs::write(&state_path, serde_json::to_vec(&state).unwrap()).unwrap();

        let inputs = ResumeInputs {
            plan_path,
            state_path,
            rootfs_tarball_path: dir.path().join("rootfs.tar.gz"),
            expected_source_basenames: &[],
            cache_dir: dir.path(),
        };
        let decision = decide(&inputs);
        assert_eq!(decision.stage, Stage::SysrootRunner);
        assert_eq!(decision.resume_step.as_deref(), Some("b"));
    }

    #[test]
    fn all_complete_but_no_tarball_is_rootfs_tarball_stage() {
        let dir = tempfile::tempdir().unwrap();
        let plan_path = dir.path().join("plan.json");
        let plan_bytes = serde_json::to_vec(&sample_plan()).unwrap();
        std::fs::write(&plan_path, &plan_bytes).unwrap();
        let digest = hex_sha256(&plan_bytes);

        let state_path = dir.path().join("state.json");
        let mut state = BuildState::new("r1".into(), plan_path.clone(), digest, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        state.completed_steps.insert("host-setup".into(), vec!["a".into(), "b".into()]);
        std::fs::write(&state_path, serde_json::to_vec(&state).unwrap()).unwrap();

        let inputs = ResumeInputs {
            plan_path,
            state_path,
            rootfs_tarball_path: dir.path().join("rootfs.tar.gz"),
            expected_source_basenames: &[],
            cache_dir: dir.path(),
        };
        let decision = decide(&inputs);
        assert_eq!(decision.stage, Stage::RootfsTarball);
    }
}
