//! `sysroot`: drives the full download-sources -> plan-write ->
//! sysroot-runner -> rootfs-tarball workflow.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use bq2::config::Config;
use bq2::orchestrator::{Orchestrator, OrchestratorArgs};

#[derive(Parser)]
#[command(name = "sysroot", about = "Build a self-hosting sysroot and rootfs")]
struct Cli {
    /// Resume from previously recorded progress (default).
    #[arg(long, action = clap::ArgAction::SetTrue, overrides_with = "no_resume")]
    resume: bool,
    /// Start over, ignoring any previously recorded progress.
    #[arg(long, action = clap::ArgAction::SetTrue, overrides_with = "resume")]
    no_resume: bool,
    #[arg(long)]
    arch: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    base_version: Option<String>,
    #[arg(long)]
    base_rootfs: Option<PathBuf>,
    #[arg(long, default_value = ".")]
    repo_root: PathBuf,
}

fn main() -> Result<()> {
    bq2::logging::init();
    let cli = Cli::parse();
    let config = Config::from_env();

    let args = OrchestratorArgs {
        resume: !cli.no_resume,
        arch: cli.arch.or(config.arch.clone()).unwrap_or_else(|| "x86_64".to_string()),
        branch: cli.branch.or(config.branch.clone()).unwrap_or_else(|| "main".to_string()),
        base_version: cli.base_version.or(config.base_version.clone()).unwrap_or_else(|| "0".to_string()),
        base_rootfs: cli.base_rootfs.or(config.base_rootfs_path.clone()),
        repo_root: cli.repo_root,
    };

    let mut orchestrator = Orchestrator::new(args, config);
    match orchestrator.run() {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}
