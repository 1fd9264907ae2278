//! `sysroot-runner`: runs one phase (or `all`) of an already-written plan
//! against the workspace rootfs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use bq2::config::Config;
use bq2::orchestrator::{Orchestrator, OrchestratorArgs};
use bq2::overrides_model::Overrides;
use bq2::plan::executor::ExecutorConfig;

#[derive(Parser)]
#[command(name = "sysroot-runner", about = "Run a phase of a build plan against the workspace rootfs")]
struct Cli {
    /// Phase name to run, or "all". Defaults to the rootfs-marker rule.
    #[arg(long)]
    phase: Option<String>,
    /// Comma-separated package (step) names to restrict the phase to.
    #[arg(long, value_delimiter = ',')]
    packages: Option<Vec<String>>,
    #[arg(long)]
    overrides: Option<PathBuf>,
    #[arg(long)]
    no_overrides: bool,
    #[arg(long)]
    report_dir: Option<PathBuf>,
    #[arg(long)]
    no_report: bool,
    #[arg(long)]
    no_resume: bool,
    #[arg(long)]
    allow_outside_rootfs: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
}

fn main() -> Result<()> {
    bq2::logging::init();
    let cli = Cli::parse();
    let config = Config::from_env();

    if cli.overrides.is_some() && cli.no_overrides {
        anyhow::bail!("--overrides and --no-overrides are mutually exclusive");
    }

    let marker_override = config.rootfs_forced();
    let args = OrchestratorArgs {
        resume: !cli.no_resume,
        arch: config.arch.clone().unwrap_or_else(|| "x86_64".to_string()),
        branch: config.branch.clone().unwrap_or_else(|| "main".to_string()),
        base_version: config.base_version.clone().unwrap_or_else(|| "0".to_string()),
        base_rootfs: config.base_rootfs_path.clone(),
        repo_root: cli.repo_root,
    };
    let orchestrator = Orchestrator::new(args, config);

    let overrides = match &cli.overrides {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading overrides {}", path.display()))?;
            Some(serde_json::from_slice::<Overrides>(&bytes).context("parsing overrides")?)
        }
        None => None,
    };

    let report_dir = if cli.no_report {
        orchestrator.rootfs_root().join("var/lib/sysroot-build-reports-disabled")
    } else {
        cli.report_dir.unwrap_or_else(|| orchestrator.rootfs_root().join("var/lib/sysroot-build-reports"))
    };

    let exec_cfg = ExecutorConfig {
        phase: cli.phase,
        packages: cli.packages,
        report_dir,
        dry_run: cli.dry_run,
        resume: !cli.no_resume,
        allow_outside_rootfs: cli.allow_outside_rootfs,
        rootfs_root: orchestrator.rootfs_root(),
        marker_override,
    };

    match orchestrator.run_sysroot_runner_with(exec_cfg, overrides.as_ref()) {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}
