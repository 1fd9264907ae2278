//! User/mount namespace entry, grounded on the sibling example
//! `ConaryLabs-Conary`'s `container::mod` `unshare`/mount-private sequence
//! and `BindMount` shape. Conary chroots ("simpler and more portable");
//! this spec requires the stronger `pivot_root` primitive, so that part is
//! implemented directly against `nix` rather than following Conary's
//! shortcut.

use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{chdir, getgid, getuid, pivot_root};

use crate::error::NamespaceError;
use super::probe::has_cap_sys_admin;

#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EntryOptions {
    pub rootfs: PathBuf,
    pub extra_binds: Vec<BindMount>,
    /// Bind-mount the host's `/dev` recursively rather than a curated tmpfs.
    pub bind_host_dev: bool,
    /// Detach and remove the old root after pivoting.
    pub remove_old_root: bool,
}

impl EntryOptions {
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            extra_binds: Vec::new(),
            bind_host_dev: true,
            remove_old_root: true,
        }
    }
}

fn syscall_err(syscall: &'static str, errno: nix::Error) -> NamespaceError {
    if errno == nix::Error::EPERM && syscall == "unshare" {
        return NamespaceError::UnprivilegedUserNsDisabled { syscall };
    }
    NamespaceError::Syscall {
        syscall,
        errno: errno as i32,
        description: errno.to_string(),
    }
}

/// Runs the full unshare/bind-mount/pivot_root entry sequence. Must be
/// called from a process that is willing to have its mount namespace
/// changed permanently (typically right after a re-exec via
/// [`crate::orchestrator::self_executable`]).
pub fn enter(opts: &EntryOptions) -> Result<(), NamespaceError> {
    if has_cap_sys_admin() {
        unshare(CloneFlags::CLONE_NEWNS).map_err(|e| syscall_err("unshare", e))?;
    } else {
        let uid = getuid();
        let gid = getgid();
        unshare(CloneFlags::CLONE_NEWUSER).map_err(|e| syscall_err("unshare", e))?;
        write_setgroups_deny();
        write_id_map("/proc/self/uid_map", uid.as_raw())?;
        write_id_map("/proc/self/gid_map", gid.as_raw())?;
        unshare(CloneFlags::CLONE_NEWNS).map_err(|e| syscall_err("unshare", e))?;
    }

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| syscall_err("mount(/, MS_PRIVATE|MS_REC)", e))?;

    mount(
        Some(&opts.rootfs),
        &opts.rootfs,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| syscall_err("mount(rootfs onto itself)", e))?;

    for bind in &opts.extra_binds {
        let target = opts.rootfs.join(bind.target.strip_prefix("/").unwrap_or(&bind.target));
        fs::create_dir_all(&target).ok();
        mount(Some(&bind.source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .map_err(|e| syscall_err("mount(extra bind)", e))?;
    }

    mount_virtual_filesystems(opts)?;

    let pivot_dir = opts.rootfs.join(".pivot_root");
    fs::create_dir_all(&pivot_dir).map_err(|_| NamespaceError::Syscall {
        syscall: "mkdir(.pivot_root)",
        errno: 0,
        description: "could not create pivot_root staging directory".to_string(),
    })?;

    pivot_root(&opts.rootfs, &pivot_dir).map_err(|e| syscall_err("pivot_root", e))?;
    chdir("/").map_err(|e| syscall_err("chdir", e))?;

    if opts.remove_old_root {
        let old_root = Path::new("/.pivot_root");
        let _ = umount2(old_root, MntFlags::MNT_DETACH);
        let _ = fs::remove_dir(old_root);
    }

    Ok(())
}

fn mount_virtual_filesystems(opts: &EntryOptions) -> Result<(), NamespaceError> {
    let rootfs = &opts.rootfs;

    let proc_target = rootfs.join("proc");
    fs::create_dir_all(&proc_target).ok();
    mount(Some("/proc"), &proc_target, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)
        .map_err(|e| syscall_err("mount(/proc bind)", e))?;
    mount(
        None::<&str>,
        &proc_target,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| syscall_err("mount(/proc remount)", e))?;

    let sys_target = rootfs.join("sys");
    fs::create_dir_all(&sys_target).ok();
    mount(Some("/sys"), &sys_target, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)
        .map_err(|e| syscall_err("mount(/sys bind)", e))?;

    let dev_target = rootfs.join("dev");
    fs::create_dir_all(&dev_target).ok();
    if opts.bind_host_dev {
        mount(Some("/dev"), &dev_target, None::<&str>, MsFlags::MS_BIND | MsFlags::MS_REC, None::<&str>)
            .map_err(|e| syscall_err("mount(/dev bind)", e))?;
    } else {
        mount(Some("tmpfs"), &dev_target, Some("tmpfs"), MsFlags::empty(), None::<&str>)
            .map_err(|e| syscall_err("mount(/dev tmpfs)", e))?;
        create_curated_dev_nodes(&dev_target)?;

        let shm_target = dev_target.join("shm");
        fs::create_dir_all(&shm_target).ok();
        mount(Some("tmpfs"), &shm_target, Some("tmpfs"), MsFlags::empty(), None::<&str>)
            .map_err(|e| syscall_err("mount(/dev/shm tmpfs)", e))?;
    }

    let tmp_target = rootfs.join("tmp");
    fs::create_dir_all(&tmp_target).ok();
    mount(Some("tmpfs"), &tmp_target, Some("tmpfs"), MsFlags::empty(), None::<&str>)
        .map_err(|e| syscall_err("mount(/tmp tmpfs)", e))?;

    Ok(())
}

/// Curated device nodes when not binding the host's `/dev`: null, zero,
/// random, urandom, tty, plus `/dev/fd` -> `/proc/self/fd`.
fn create_curated_dev_nodes(dev_target: &Path) -> Result<(), NamespaceError> {
    use nix::sys::stat::{mknod, Mode, SFlag};

    let nodes: &[(&str, u64, u64)] = &[
        ("null", 1, 3),
        ("zero", 1, 5),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("tty", 5, 0),
    ];
    for (name, major, minor) in nodes {
        let path = dev_target.join(name);
        let dev = nix::sys::stat::makedev(*major, *minor);
        let _ = mknod(&path, SFlag::S_IFCHR, Mode::from_bits_truncate(0o666), dev);
    }
    let _ = std::os::unix::fs::symlink("/proc/self/fd", dev_target.join("fd"));
    Ok(())
}

fn write_setgroups_deny() {
    // EACCES here is tolerated (e.g. running as uid 0 where the kernel
    // refuses the write because setgroups is already permitted).
    let _ = fs::write("/proc/self/setgroups", b"deny");
}

fn write_id_map(path: &str, id: u32) -> Result<(), NamespaceError> {
    fs::write(path, format!("0 {} 1", id)).map_err(|e| NamespaceError::Syscall {
        syscall: "write(id_map)",
        errno: e.raw_os_error().unwrap_or(0),
        description: e.to_string(),
    })
}
