//! `sysroot-namespace`: enters an unprivileged user/mount namespace rooted
//! at a rootfs tree, then execs the given command inside it.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use bq2::namespace::{entry, BindMount, EntryOptions};

#[derive(Parser)]
#[command(name = "sysroot-namespace", about = "Enter a rootfs namespace and run a command in it")]
struct Cli {
    #[arg(long, default_value = "workspace/rootfs")]
    rootfs: PathBuf,
    /// `SRC:DST` pairs, may be repeated.
    #[arg(long = "bind")]
    binds: Vec<String>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    cmd: Vec<String>,
}

fn main() -> Result<()> {
    bq2::logging::init();
    let cli = Cli::parse();

    let mut opts = EntryOptions::new(cli.rootfs);
    for bind in &cli.binds {
        let (src, dst) = bind
            .split_once(':')
            .with_context(|| format!("--bind {bind:?} is not in SRC:DST form"))?;
        opts.extra_binds.push(BindMount { source: PathBuf::from(src), target: PathBuf::from(dst) });
    }

    entry::enter(&opts).map_err(|e| anyhow::anyhow!(e)).context("entering rootfs namespace")?;

    let mut argv = cli.cmd.into_iter();
    let program = argv.next().unwrap_or_else(|| "/bin/sh".to_string());
    let err = std::process::Command::new(&program).args(argv).exec();
    Err(anyhow::anyhow!(err)).with_context(|| format!("exec {program} failed"))
}
