//! Environment-variable driven configuration, read once at orchestrator
//! startup: read `env::var`, fall back to a documented default, never
//! panic on a missing var.

use std::env;

/// Runtime configuration assembled from the `BQ2_*` environment variables
/// recognized by the core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Forces rootfs-marker behavior regardless of `/.bq2-rootfs` presence.
    pub rootfs_override: Option<bool>,
    pub arch: Option<String>,
    pub branch: Option<String>,
    pub base_version: Option<String>,
    pub base_rootfs_path: Option<std::path::PathBuf>,
    pub use_system_tar_sources: bool,
    pub use_system_tar_rootfs: bool,
    pub preserve_ownership_sources: bool,
    pub preserve_ownership_rootfs: bool,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub skip_shards_install: bool,
    pub sudo_user: Option<String>,
}

fn bool_env(name: &str) -> bool {
    matches!(
        env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

fn u32_env(name: &str) -> Option<u32> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            rootfs_override: env::var("BQ2_ROOTFS").ok().map(|v| v == "1" || v == "true"),
            arch: env::var("BQ2_ARCH").ok(),
            branch: env::var("BQ2_BRANCH").ok(),
            base_version: env::var("BQ2_BASE_VERSION").ok(),
            base_rootfs_path: env::var("BQ2_BASE_ROOTFS_PATH").ok().map(Into::into),
            use_system_tar_sources: bool_env("BQ2_USE_SYSTEM_TAR_SOURCES"),
            use_system_tar_rootfs: bool_env("BQ2_USE_SYSTEM_TAR_ROOTFS"),
            preserve_ownership_sources: bool_env("BQ2_PRESERVE_OWNERSHIP_SOURCES"),
            preserve_ownership_rootfs: bool_env("BQ2_PRESERVE_OWNERSHIP_ROOTFS"),
            owner_uid: u32_env("BQ2_OWNER_UID"),
            owner_gid: u32_env("BQ2_OWNER_GID"),
            skip_shards_install: bool_env("BQ2_SKIP_SHARDS_INSTALL"),
            sudo_user: env::var("SUDO_USER").ok(),
        }
    }

    /// Whether the caller has forced rootfs-marker semantics on or off via
    /// `BQ2_ROOTFS`, independent of the on-disk marker file.
    pub fn rootfs_forced(&self) -> Option<bool> {
        self.rootfs_override
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        // Without any BQ2_* vars set, booleans default false and options default None.
        // We can't easily sandbox env vars across parallel tests, so only assert shape.
        let cfg = Config::from_env();
        let _ = cfg.rootfs_forced();
    }

    #[test]
    fn bool_env_accepts_common_truthy_values() {
        env::set_var("BQ2_SKIP_SHARDS_INSTALL", "1");
        assert!(bool_env("BQ2_SKIP_SHARDS_INSTALL"));
        env::remove_var("BQ2_SKIP_SHARDS_INSTALL");
    }
}
