//! Top-level `sysroot` state machine: drives
//! `[download-sources, plan-write, sysroot-runner, rootfs-tarball]`,
//! starting wherever the resume engine says to, and owns the host-setup
//! callbacks the executor invokes for the strategies that aren't plain
//! subprocesses.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::cache;
use crate::config::Config;
use crate::http::Client;
use crate::model::{Plan, Step};
use crate::namespace::{self, EntryOptions};
use crate::plan::builder::{build_plan, PhaseSpec};
use crate::plan::catalog;
use crate::plan::executor::{self, ExecutorConfig};
use crate::plan::resume::{self, ResumeInputs, Stage};
use crate::plan::strategy::HostSetupCallbacks;
use crate::state::Bookmark;

pub const PLAN_PATH: &str = "var/lib/sysroot-build-plan.json";
pub const OVERRIDES_PATH: &str = "var/lib/sysroot-build-overrides.json";
pub const STATE_PATH: &str = "var/lib/sysroot-build-state.json";
pub const REPORTS_DIR: &str = "var/lib/sysroot-build-reports";
pub const ROOTFS_MARKER: &str = ".bq2-rootfs";

#[derive(Debug, Clone)]
pub struct OrchestratorArgs {
    pub resume: bool,
    pub arch: String,
    pub branch: String,
    pub base_version: String,
    pub base_rootfs: Option<PathBuf>,
    pub repo_root: PathBuf,
}

pub struct Orchestrator {
    args: OrchestratorArgs,
    config: Config,
    client: Client,
}

impl Orchestrator {
    pub fn new(args: OrchestratorArgs, config: Config) -> Self {
        Self { args, config, client: Client::new() }
    }

    pub fn rootfs_root(&self) -> PathBuf {
        self.args.repo_root.join("workspace/rootfs")
    }

    fn cache_dir(&self) -> PathBuf {
        self.args.repo_root.join("sources")
    }

    pub fn plan_path(&self) -> PathBuf {
        self.rootfs_root().join(PLAN_PATH)
    }

    fn state_path(&self) -> PathBuf {
        self.rootfs_root().join(STATE_PATH)
    }

    fn rootfs_tarball_path(&self) -> PathBuf {
        self.cache_dir().join(format!("bq2-rootfs-{}.tar.gz", self.args.base_version))
    }

    /// Runs the full workflow, starting wherever [`resume::decide`] says
    /// to.
    pub fn run(&mut self) -> Result<()> {
        let expected_basenames: Vec<String> = catalog::CATALOG
            .iter()
            .map(|p| format!("{}-{}", p.name, p.url.rsplit('/').next().unwrap_or(p.url)))
            .collect();

        let decision = resume::decide(&ResumeInputs {
            plan_path: self.plan_path(),
            state_path: self.state_path(),
            rootfs_tarball_path: self.rootfs_tarball_path(),
            expected_source_basenames: &expected_basenames,
            cache_dir: &self.cache_dir(),
        });
        info!("resume decision: stage={:?} reason={}", decision.stage, decision.reason);

        let mut stage = decision.stage;
        loop {
            let start = Instant::now();
            match stage {
                Stage::DownloadSources => {
                    self.run_download_sources()?;
                    info!("download-sources finished in {:?}", start.elapsed());
                    stage = Stage::PlanWrite;
                }
                Stage::PlanWrite => {
                    self.run_plan_write()?;
                    info!("plan-write finished in {:?}", start.elapsed());
                    stage = Stage::SysrootRunner;
                }
                Stage::SysrootRunner => {
                    self.run_sysroot_runner(self.args.resume)?;
                    info!("sysroot-runner finished in {:?}", start.elapsed());
                    stage = Stage::RootfsTarball;
                }
                Stage::RootfsTarball => {
                    self.run_rootfs_tarball()?;
                    info!("rootfs-tarball finished in {:?}", start.elapsed());
                    stage = Stage::Complete;
                }
                Stage::Complete => {
                    info!("sysroot workflow complete");
                    return Ok(());
                }
            }
        }
    }

    fn run_download_sources(&self) -> Result<()> {
        std::fs::create_dir_all(self.cache_dir())?;
        for package in catalog::CATALOG {
            cache::ensure_cached(
                &self.client,
                &self.cache_dir(),
                package.name,
                package.url,
                package.sha256,
                package.checksum_sidecar_url,
            )
            .with_context(|| format!("fetching source for {}", package.name))?;
        }
        Ok(())
    }

    fn run_plan_write(&self) -> Result<()> {
        let specs = default_phase_specs(&self.rootfs_root().to_string_lossy());
        let plan = build_plan(&specs).context("building plan")?;
        let path = self.plan_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_vec_pretty(&plan)?)
            .with_context(|| format!("writing plan to {}", path.display()))?;
        Ok(())
    }

    fn run_sysroot_runner(&self, resume: bool) -> Result<()> {
        let cfg = ExecutorConfig {
            phase: None,
            packages: None,
            report_dir: self.rootfs_root().join(REPORTS_DIR),
            dry_run: false,
            resume,
            allow_outside_rootfs: false,
            rootfs_root: self.rootfs_root(),
            marker_override: self.config.rootfs_forced(),
        };
        self.run_sysroot_runner_with(cfg, None)
    }

    /// Runs the sysroot-runner stage with a caller-supplied [`ExecutorConfig`]
    /// and an optional overrides document, for CLI callers that expose the
    /// full `sysroot-runner` flag surface rather than the default
    /// workflow invoked from [`Orchestrator::run`].
    pub fn run_sysroot_runner_with(&self, cfg: ExecutorConfig, overrides: Option<&crate::overrides_model::Overrides>) -> Result<()> {
        let plan_bytes = std::fs::read(self.plan_path())?;
        let mut plan: Plan = serde_json::from_slice(&plan_bytes).context("parsing plan")?;
        if plan.format_version != catalog::CURRENT_FORMAT_VERSION {
            anyhow::bail!(crate::error::ValidationError::UnsupportedFormatVersion { found: plan.format_version });
        }
        if plan.phases.is_empty() {
            anyhow::bail!(crate::error::ValidationError::EmptyPlan);
        }

        if let Some(overrides) = overrides {
            plan = crate::plan::overrides::apply(&plan, overrides).context("applying overrides")?;
        }

        let phase_names = executor::select_phases(&plan, cfg.phase.as_deref(), cfg.marker_present())?;

        let mut bookmark = Bookmark::load_or_init(
            &self.state_path(),
            || format!("{}-{}", self.args.arch, self.args.base_version),
            &self.plan_path(),
            crate::digest::hex_sha256(&plan_bytes),
            Utc::now(),
        )?;
        bookmark.reconcile_inputs(&crate::digest::hex_sha256(&plan_bytes), None);

        let mut hooks = Callbacks { orchestrator: self };

        for phase_name in phase_names {
            let phase = plan.phase(&phase_name).expect("select_phases returned a real phase name");

            if !executor::rootfs_gate_satisfied(phase, &cfg) {
                anyhow::bail!(
                    "phase {} requires the rootfs marker (or --allow-outside-rootfs)",
                    phase_name
                );
            }

            if executor::is_rootfs_only(phase) && !cfg.marker_present() && executor::workspace_rootfs_needs_entry(&cfg) {
                self.enter_rootfs_namespace()?;
            }

            let mut owned_phase = phase.clone();
            if let Some(packages) = &cfg.packages {
                executor::filter_packages(&mut owned_phase, packages)?;
            }
            if cfg.resume {
                executor::filter_resume(&mut owned_phase, &bookmark);
            }
            if owned_phase.steps.is_empty() {
                continue;
            }

            executor::run_phase(&owned_phase, &cfg, &mut bookmark, &mut hooks)?;
        }

        Ok(())
    }

    fn run_rootfs_tarball(&self) -> Result<()> {
        let rootfs = self.rootfs_root();
        let output = self.rootfs_tarball_path();
        crate::tar::write_tar_gz(&rootfs, &output)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("writing rootfs tarball to {}", output.display()))?;
        info!("wrote rootfs tarball to {}", output.display());
        Ok(())
    }

    /// Enters the workspace rootfs via the namespace module before running
    /// a rootfs-tagged phase outside an already-entered namespace.
    fn enter_rootfs_namespace(&self) -> Result<()> {
        let exe = self_executable()?;
        let mut opts = EntryOptions::new(self.rootfs_root());
        opts.extra_binds.push(namespace::BindMount {
            source: self.args.repo_root.join("workspace"),
            target: PathBuf::from("/workspace"),
        });
        namespace::entry::enter(&opts).map_err(|e| anyhow::anyhow!(e)).context("entering rootfs namespace")?;
        info!("entered namespace via {}", exe.display());
        Ok(())
    }
}

/// Locates this process's own executable so it can be re-invoked after
/// `unshare`/`pivot_root` (the `bootc`-style re-exec pattern).
pub fn self_executable() -> Result<PathBuf> {
    std::env::current_exe().context("locating own executable for re-exec into namespace")
}

struct Callbacks<'a> {
    orchestrator: &'a Orchestrator,
}

impl<'a> HostSetupCallbacks for Callbacks<'a> {
    fn download_sources(&mut self, _step: &Step) -> Result<()> {
        self.orchestrator.run_download_sources()
    }

    fn populate_seed(&mut self, _step: &Step) -> Result<()> {
        let seed_dir = self.orchestrator.rootfs_root();
        std::fs::create_dir_all(&seed_dir)?;
        for package in catalog::CATALOG {
            let basename = package.url.rsplit('/').next().unwrap_or(package.url);
            let cached = self.orchestrator.cache_dir().join(format!("{}-{}", package.name, basename));
            if !cached.is_file() {
                anyhow::bail!("populate-seed: {} is not yet cached", cached.display());
            }
        }
        Ok(())
    }

    fn extract_sources(&mut self, _step: &Step) -> Result<()> {
        let workspace = self.orchestrator.rootfs_root();
        std::fs::create_dir_all(&workspace)?;
        for package in catalog::CATALOG {
            let basename = package.url.rsplit('/').next().unwrap_or(package.url);
            let archive = self.orchestrator.cache_dir().join(format!("{}-{}", package.name, basename));
            if !archive.is_file() {
                continue;
            }
            extract_one(&archive, &workspace)?;
        }
        Ok(())
    }
}

fn extract_one(archive: &Path, dest: &Path) -> Result<()> {
    let opts = crate::tar::ExtractOptions::default();
    crate::tar::extract_archive(archive, dest, &opts)
        .with_context(|| format!("extracting {}", archive.display()))
}

/// The fixed phase specifications for a default sysroot build. Workspace
/// and prefix choices here are this builder's own policy, not part of the
/// plan format.
pub fn default_phase_specs(workspace: &str) -> Vec<PhaseSpec> {
    use crate::model::EnvironmentTag;

    vec![
        PhaseSpec::new("host-setup", EnvironmentTag::HostSetup, workspace, "/"),
        PhaseSpec::new("sysroot-from-alpine", EnvironmentTag::AlpineSeed, workspace, "/opt/sysroot"),
        PhaseSpec::new("rootfs-from-sysroot", EnvironmentTag::RootfsSystem, workspace, "/"),
        PhaseSpec::new("system-from-sysroot", EnvironmentTag::RootfsSystem, workspace, "/usr"),
        PhaseSpec::new("tools-from-system", EnvironmentTag::RootfsSystem, workspace, "/usr"),
        PhaseSpec::new("finalize-rootfs", EnvironmentTag::RootfsFinalize, workspace, "/"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phase_specs_follow_the_fixed_order() {
        let specs = default_phase_specs("/workspace");
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "host-setup",
                "sysroot-from-alpine",
                "rootfs-from-sysroot",
                "system-from-sysroot",
                "tools-from-system",
                "finalize-rootfs",
            ]
        );
    }
}
