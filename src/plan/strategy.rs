//! Strategy synthesis: turns one [`Step`] into the command sequence the
//! executor runs for it.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::error::CommandError;
use crate::model::{EnvMap, Phase, Step, Strategy};
use crate::process::Cmd;

/// Host-setup strategies (`download-sources`, `populate-seed`,
/// `extract-sources`) call back into the orchestrator instead of spawning
/// subprocesses.
pub trait HostSetupCallbacks {
    fn download_sources(&mut self, step: &Step) -> Result<()>;
    fn populate_seed(&mut self, step: &Step) -> Result<()>;
    fn extract_sources(&mut self, step: &Step) -> Result<()>;
}

pub struct StrategyContext<'a> {
    pub step: &'a Step,
    pub phase: &'a Phase,
    pub effective_env: &'a EnvMap,
    pub install_prefix: String,
    pub destdir: Option<String>,
    pub cpus: usize,
    /// The last recorded failure refers to this exact step: disable
    /// clean-build for strategies that would otherwise wipe the build dir.
    pub suppress_clean_build: bool,
}

pub fn run(ctx: &StrategyContext, hooks: &mut dyn HostSetupCallbacks) -> Result<()> {
    let workdir = Path::new(&ctx.step.workdir);
    match &ctx.step.strategy {
        Strategy::Autotools => autotools(ctx, workdir),
        Strategy::Cmake => cmake_bootstrap(ctx, workdir),
        Strategy::CmakeProject => cmake_project(ctx, workdir),
        Strategy::Busybox => busybox(ctx, workdir),
        Strategy::LinuxHeaders => linux_headers(ctx, workdir),
        Strategy::CrystalCompiler => crystal_compiler(ctx, workdir),
        Strategy::CrystalBuild => crystal_build(ctx, workdir),
        Strategy::Crystal => crystal(ctx, workdir),
        Strategy::CopyTree => copy_tree(ctx, workdir),
        Strategy::RemoveTree => remove_tree(ctx),
        Strategy::WriteFile => write_file(ctx),
        Strategy::PrepareRootfs => prepare_rootfs(ctx),
        Strategy::Symlink => symlink(ctx),
        Strategy::Tarball => tarball(ctx, workdir),
        Strategy::DownloadSources => hooks.download_sources(ctx.step),
        Strategy::PopulateSeed => hooks.populate_seed(ctx.step),
        Strategy::ExtractSources => hooks.extract_sources(ctx.step),
        Strategy::AlpineSetup => alpine_setup(ctx),
        Strategy::MakefileClassic => makefile_classic(ctx, workdir),
    }
}

fn cmd(ctx: &StrategyContext, program: &str) -> Cmd {
    Cmd::new(program).envs(ctx.effective_env.clone())
}

fn install_env(ctx: &StrategyContext) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = ctx.effective_env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    if let Some(destdir) = &ctx.destdir {
        env.push(("DESTDIR".to_string(), destdir.clone()));
    }
    env
}

fn autotools(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    if workdir.join("configure.ac").is_file() {
        normalize_autoreconf_timestamps(workdir)?;
        cmd(ctx, "./configure")
            .dir(workdir)
            .arg(format!("--prefix={}", ctx.install_prefix))
            .args(&ctx.step.configure_flags)
            .error_msg(format!("configure failed for {}", ctx.step.name))
            .run_interactive()?;
    } else if workdir.join("CMakeLists.txt").is_file() {
        cmd(ctx, "cmake")
            .dir(workdir)
            .args(["-S", ".", "-B", "build"])
            .arg(format!("-DCMAKE_INSTALL_PREFIX={}", ctx.install_prefix))
            .args(&ctx.step.configure_flags)
            .error_msg(format!("cmake configure failed for {}", ctx.step.name))
            .run_interactive()?;
        cmd(ctx, "cmake")
            .args(["--build", "build", "-j", &ctx.cpus.to_string()])
            .dir(workdir)
            .error_msg(format!("build failed for {}", ctx.step.name))
            .run_interactive()?;
        cmd(ctx, "cmake")
            .envs(install_env(ctx))
            .args(["--install", "build"])
            .dir(workdir)
            .error_msg(format!("install failed for {}", ctx.step.name))
            .run_interactive()?;
        return Ok(());
    } else {
        bail!("{}: neither configure.ac nor CMakeLists.txt present", ctx.step.name);
    }

    cmd(ctx, "make")
        .dir(workdir)
        .arg(format!("-j{}", ctx.cpus))
        .error_msg(format!("build failed for {}", ctx.step.name))
        .run_interactive()?;

    cmd(ctx, "make")
        .envs(install_env(ctx))
        .dir(workdir)
        .arg("install")
        .error_msg(format!("install failed for {}", ctx.step.name))
        .run_interactive()?;

    Ok(())
}

/// Touches the generated autotools files so they are strictly newer than
/// `configure.ac` and autoreconf does not try to regenerate them.
fn normalize_autoreconf_timestamps(workdir: &Path) -> Result<()> {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    let reference = std::fs::metadata(workdir.join("configure.ac"))
        .and_then(|m| m.modified())
        .unwrap_or_else(|_| SystemTime::now());
    let newer_secs = (reference + Duration::from_secs(1))
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let candidates = ["configure", "aclocal.m4", "config.h.in"];
    for name in candidates {
        let path = workdir.join(name);
        if path.is_file() {
            touch_mtime(&path, newer_secs);
        }
    }
    if let Ok(entries) = std::fs::read_dir(workdir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("Makefile.in") {
                touch_mtime(&path, newer_secs);
            }
        }
    }
    Ok(())
}

fn touch_mtime(path: &Path, epoch_secs: i64) {
    let times = [
        libc::timespec { tv_sec: epoch_secs, tv_nsec: 0 },
        libc::timespec { tv_sec: epoch_secs, tv_nsec: 0 },
    ];
    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) else {
        return;
    };
    unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
}

fn cmake_bootstrap(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let build_dir = ctx.step.build_dir.as_ref().map(PathBuf::from).unwrap_or_else(|| workdir.to_path_buf());
    std::fs::create_dir_all(&build_dir).ok();

    let previous_cache = build_dir.join("CMakeCache.txt").is_file() || build_dir.join("Makefile").is_file();

    let mut bootstrap = cmd(ctx, &workdir.join("bootstrap").to_string_lossy())
        .dir(&build_dir)
        .arg(format!("--prefix={}", ctx.install_prefix));
    if !ctx.step.configure_flags.is_empty() {
        bootstrap = bootstrap.arg("--").args(&ctx.step.configure_flags);
    }
    bootstrap
        .error_msg(format!("bootstrap failed for {}", ctx.step.name))
        .run_interactive()?;

    if (previous_cache || ctx.step.clean_build) && !ctx.suppress_clean_build {
        cmd(ctx, "make").dir(&build_dir).arg("clean").allow_fail().run_interactive()?;
    }

    cmd(ctx, "make")
        .dir(&build_dir)
        .arg(format!("-j{}", ctx.cpus))
        .error_msg(format!("build failed for {}", ctx.step.name))
        .run_interactive()?;

    cmd(ctx, "make")
        .envs(install_env(ctx))
        .dir(&build_dir)
        .arg("install")
        .error_msg(format!("install failed for {}", ctx.step.name))
        .run_interactive()?;

    Ok(())
}

fn cmake_project(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let build_dir = ctx.step.build_dir.clone().unwrap_or_else(|| "build".to_string());

    cmd(ctx, "cmake")
        .dir(workdir)
        .args(["-S", "."])
        .arg("-B")
        .arg(&build_dir)
        .arg(format!("-DCMAKE_INSTALL_PREFIX={}", ctx.install_prefix))
        .args(&ctx.step.configure_flags)
        .error_msg(format!("cmake configure failed for {}", ctx.step.name))
        .run_interactive()?;

    cmd(ctx, "cmake")
        .dir(workdir)
        .arg("--build")
        .arg(&build_dir)
        .arg("-j")
        .arg(ctx.cpus.to_string())
        .error_msg(format!("build failed for {}", ctx.step.name))
        .run_interactive()?;

    cmd(ctx, "cmake")
        .envs(install_env(ctx))
        .dir(workdir)
        .arg("--install")
        .arg(&build_dir)
        .error_msg(format!("install failed for {}", ctx.step.name))
        .run_interactive()?;

    Ok(())
}

fn busybox(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    cmd(ctx, "make").dir(workdir).arg("defconfig").error_msg("busybox defconfig failed").run_interactive()?;
    cmd(ctx, "make")
        .dir(workdir)
        .arg(format!("-j{}", ctx.cpus))
        .error_msg("busybox build failed")
        .run_interactive()?;

    let prefix = ctx.destdir.clone().unwrap_or_else(|| ctx.install_prefix.clone());
    cmd(ctx, "make")
        .dir(workdir)
        .arg(format!("CONFIG_PREFIX={}", prefix))
        .arg("install")
        .error_msg("busybox install failed")
        .run_interactive()?;
    Ok(())
}

fn linux_headers(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    cmd(ctx, "make")
        .dir(workdir)
        .args(&ctx.step.configure_flags)
        .arg("headers")
        .error_msg("linux headers build failed")
        .run_interactive()?;

    let dest = ctx.destdir.clone().unwrap_or_default();
    let include_dest = PathBuf::from(dest).join(ctx.install_prefix.trim_start_matches('/')).join("include");
    std::fs::create_dir_all(&include_dest)
        .with_context(|| format!("creating {}", include_dest.display()))?;
    copy_dir_contents(&workdir.join("usr/include"), &include_dest)?;
    Ok(())
}

fn crystal_compiler(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let build_marker = workdir.join(".build");
    if build_marker.exists() {
        std::fs::remove_dir_all(&build_marker).ok();
    }

    cmd(ctx, "make")
        .dir(workdir)
        .arg(format!("-j{}", ctx.cpus))
        .arg("crystal")
        .error_msg("crystal compiler build failed")
        .run_interactive()?;

    let mut install = cmd(ctx, "make").dir(workdir).arg("install").arg(format!("PREFIX={}", ctx.install_prefix));
    if let Some(destdir) = &ctx.destdir {
        install = install.envs([("DESTDIR", destdir.as_str())]);
    }
    install.error_msg("crystal compiler install failed").run_interactive()?;
    Ok(())
}

fn crystal_build(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let skip_shards = ctx.effective_env.get("BQ2_SKIP_SHARDS_INSTALL").map(String::as_str) == Some("1");
    if workdir.join("shard.yml").is_file() && !skip_shards {
        cmd(ctx, "shards").dir(workdir).arg("install").error_msg("shards install failed").run_interactive()?;
    }

    cmd(ctx, "crystal")
        .dir(workdir)
        .arg("build")
        .args(&ctx.step.configure_flags)
        .error_msg(format!("crystal build failed for {}", ctx.step.name))
        .run_interactive()?;

    install_bin_dir(ctx, workdir)
}

fn crystal(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    cmd(ctx, "shards").dir(workdir).arg("build").error_msg("shards build failed").run_interactive()?;
    install_bin_dir(ctx, workdir)
}

fn install_bin_dir(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let dest_root = ctx.destdir.clone().unwrap_or_default();
    let bin_dest = PathBuf::from(dest_root).join(ctx.install_prefix.trim_start_matches('/')).join("bin");
    std::fs::create_dir_all(&bin_dest).with_context(|| format!("creating {}", bin_dest.display()))?;

    let bin_src = workdir.join("bin");
    if !bin_src.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&bin_src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let dest = bin_dest.join(entry.file_name());
        std::fs::copy(entry.path(), &dest)?;
        set_executable(&dest)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

fn copy_tree(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let target = PathBuf::from(&ctx.install_prefix);
    copy_dir_contents(workdir, &target)
}

fn copy_dir_contents(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap();
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            let _ = std::fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_tree(ctx: &StrategyContext) -> Result<()> {
    let target = Path::new(&ctx.install_prefix);
    if target.as_os_str().is_empty() || target == Path::new("/") {
        bail!("remove-tree refuses to operate on `/` or an empty path");
    }
    if target.exists() {
        std::fs::remove_dir_all(target)
            .with_context(|| format!("removing {}", target.display()))?;
    }
    Ok(())
}

fn write_file(ctx: &StrategyContext) -> Result<()> {
    let content = ctx.step.content.clone().unwrap_or_default();
    let target = Path::new(&ctx.install_prefix);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, content).with_context(|| format!("writing {}", target.display()))?;
    Ok(())
}

fn prepare_rootfs(ctx: &StrategyContext) -> Result<()> {
    let mut n = 0;
    loop {
        let path_key = format!("FILE_{}_PATH", n);
        let content_key = format!("FILE_{}_CONTENT", n);
        let (Some(path), Some(content)) = (ctx.effective_env.get(&path_key), ctx.effective_env.get(&content_key)) else {
            break;
        };
        let target = Path::new(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, content).with_context(|| format!("writing {}", target.display()))?;
        n += 1;
    }
    Ok(())
}

fn symlink(ctx: &StrategyContext) -> Result<()> {
    let mut n = 0;
    loop {
        let src_key = format!("LINK_{}_SRC", n);
        let dest_key = format!("LINK_{}_DEST", n);
        let (Some(src), Some(dest)) = (ctx.effective_env.get(&src_key), ctx.effective_env.get(&dest_key)) else {
            break;
        };
        let dest_path = Path::new(dest);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest_path.exists() || dest_path.symlink_metadata().is_ok() {
            std::fs::remove_file(dest_path).ok();
        }
        std::os::unix::fs::symlink(src, dest_path)
            .with_context(|| format!("symlinking {} -> {}", dest_path.display(), src))?;
        n += 1;
    }
    Ok(())
}

fn tarball(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    let source_root = match &ctx.destdir {
        Some(destdir) => PathBuf::from(destdir).join(workdir.strip_prefix("/").unwrap_or(workdir)),
        None => workdir.to_path_buf(),
    };
    crate::tar::write_tar_gz(&source_root, Path::new(&ctx.install_prefix))
        .map_err(|e| anyhow!(e))
        .with_context(|| format!("writing tarball for {}", ctx.step.name))
}

fn alpine_setup(ctx: &StrategyContext) -> Result<()> {
    let packages = ctx.step.packages.clone().unwrap_or_default();
    if packages.is_empty() {
        return Ok(());
    }
    cmd(ctx, "apk")
        .args(["add", "--no-cache"])
        .args(&packages)
        .error_msg("apk add failed")
        .run_interactive()?;
    Ok(())
}

fn makefile_classic(ctx: &StrategyContext, workdir: &Path) -> Result<()> {
    cmd(ctx, "make")
        .dir(workdir)
        .arg(format!("-j{}", ctx.cpus))
        .error_msg(format!("build failed for {}", ctx.step.name))
        .run_interactive()?;
    cmd(ctx, "make")
        .envs(install_env(ctx))
        .dir(workdir)
        .arg("install")
        .error_msg(format!("install failed for {}", ctx.step.name))
        .run_interactive()?;
    Ok(())
}

/// Applies each patch in order.
pub fn apply_patches(ctx: &StrategyContext) -> Result<()> {
    let workdir = Path::new(&ctx.step.workdir);
    for patch in &ctx.step.patches {
        apply_one_patch(ctx, workdir, patch)?;
    }
    Ok(())
}

fn apply_one_patch(ctx: &StrategyContext, workdir: &Path, patch: &str) -> Result<()> {
    let dry_run = Cmd::new("patch")
        .envs(ctx.effective_env.clone())
        .dir(workdir)
        .args(["-p1", "--forward", "-N", "--dry-run", "-i", patch])
        .allow_fail()
        .run()?;

    if dry_run.success() {
        Cmd::new("patch")
            .envs(ctx.effective_env.clone())
            .dir(workdir)
            .args(["-p1", "--forward", "-N", "-i", patch])
            .error_msg(format!("applying patch {}", patch))
            .run()?;
        return Ok(());
    }

    let reverse_dry_run = Cmd::new("patch")
        .envs(ctx.effective_env.clone())
        .dir(workdir)
        .args(["-p1", "-R", "--forward", "-N", "--dry-run", "-i", patch])
        .allow_fail()
        .run()?;

    if reverse_dry_run.success() {
        tracing::debug!(patch, "already applied");
        return Ok(());
    }

    Err(CommandError::PatchFailed {
        path: PathBuf::from(patch),
        argv: vec!["patch".into(), "-p1".into(), "--forward".into(), "-N".into(), "-i".into(), patch.to_string()],
        exit_code: dry_run.code(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnvironmentTag;

    fn phase() -> Phase {
        Phase {
            name: "x".into(),
            description: "d".into(),
            workspace: "/workspace".into(),
            environment: EnvironmentTag::AlpineSeed,
            install_prefix: "/opt/sysroot".into(),
            destdir: None,
            env: EnvMap::new(),
            steps: vec![],
        }
    }

    fn step() -> Step {
        Step {
            name: "remove-me".into(),
            strategy: Strategy::RemoveTree,
            workdir: "/tmp/unused".into(),
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

    #[test]
    fn remove_tree_refuses_root() {
        let p = phase();
        let s = step();
        let ctx = StrategyContext {
            step: &s,
            phase: &p,
            effective_env: &EnvMap::new(),
            install_prefix: "/".to_string(),
            destdir: None,
            cpus: 1,
            suppress_clean_build: false,
        };
        let err = remove_tree(&ctx).unwrap_err();
        assert!(err.to_string().contains("refuses"));
    }

    #[test]
    fn write_file_strategy_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let p = phase();
        let mut s = step();
        s.content = Some("hello".into());
        let ctx = StrategyContext {
            step: &s,
            phase: &p,
            effective_env: &EnvMap::new(),
            install_prefix: target.to_string_lossy().into_owned(),
            destdir: None,
            cpus: 1,
            suppress_clean_build: false,
        };
        write_file(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
    }

    #[test]
    fn prepare_rootfs_writes_indexed_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("etc/hostname");
        let p = phase();
        let s = step();
        let mut env = EnvMap::new();
        env.insert("FILE_0_PATH".into(), target.to_string_lossy().into_owned());
        env.insert("FILE_0_CONTENT".into(), "bq2".into());
        let ctx = StrategyContext {
            step: &s,
            phase: &p,
            effective_env: &env,
            install_prefix: "/opt/sysroot".to_string(),
            destdir: None,
            cpus: 1,
            suppress_clean_build: false,
        };
        prepare_rootfs(&ctx).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "bq2");
    }
}
