//! `sysroot-plan-write`: emits a fresh plan, or an overrides diff against a
//! previous plan.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use bq2::orchestrator::default_phase_specs;
use bq2::plan::builder::build_plan;
use bq2::plan::overrides::from_diff;

#[derive(Parser)]
#[command(name = "sysroot-plan-write", about = "Emit a build plan, or an overrides diff")]
struct Cli {
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    force: bool,
    /// Emit an overrides diff against the plan at this path instead of a fresh plan.
    #[arg(long)]
    r#override: Option<PathBuf>,
    #[arg(long, default_value = "/workspace")]
    workspace_root: PathBuf,
}

fn main() -> Result<()> {
    bq2::logging::init();
    let cli = Cli::parse();

    let specs = default_phase_specs(&cli.workspace_root.to_string_lossy());
    let fresh = build_plan(&specs).context("building plan")?;

    let document = match &cli.r#override {
        Some(base_path) => {
            let base_bytes = std::fs::read(base_path)
                .with_context(|| format!("reading base plan {}", base_path.display()))?;
            let base = serde_json::from_slice(&base_bytes).context("parsing base plan")?;
            let overrides = from_diff(&base, &fresh).context("computing overrides diff")?;
            serde_json::to_vec_pretty(&overrides)?
        }
        None => serde_json::to_vec_pretty(&fresh)?,
    };

    match &cli.output {
        Some(path) => {
            if path.exists() && !cli.force {
                anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &document).with_context(|| format!("writing {}", path.display()))?;
        }
        None => {
            use std::io::Write;
            std::io::stdout().write_all(&document)?;
        }
    }

    Ok(())
}
