//! The typed, JSON-serializable plan data model.
//!
//! `Plan` is the on-disk contract. Every field here round-trips through
//! `serde_json` byte-for-byte in the shape documented in the plan JSON
//! example; `format_version` gates compatibility (only `2` is accepted,
//! see [`crate::plan::catalog::CURRENT_FORMAT_VERSION`]).

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

pub type EnvMap = BTreeMap<String, String>;

/// One upstream source package, as compiled into the static catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: &'static str,
    pub version: &'static str,
    pub url: &'static str,
    pub sha256: Option<&'static str>,
    pub checksum_sidecar_url: Option<&'static str>,
    /// Phases this package participates in. `None` means "sysroot-from-alpine" only.
    pub phases: Option<&'static [&'static str]>,
    pub strategy: Strategy,
    pub configure_flags: &'static [&'static str],
    pub patches: &'static [&'static str],
    pub build_directory: Option<&'static str>,
    pub out_of_tree_build_dir: Option<&'static str>,
}

/// The closed set of build strategies: one variant per strategy tag,
/// dispatched exhaustively rather than by matching on a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Autotools,
    Cmake,
    CmakeProject,
    Busybox,
    LinuxHeaders,
    CrystalCompiler,
    CrystalBuild,
    Crystal,
    CopyTree,
    RemoveTree,
    WriteFile,
    PrepareRootfs,
    Symlink,
    Tarball,
    DownloadSources,
    PopulateSeed,
    ExtractSources,
    AlpineSetup,
    MakefileClassic,
}

impl Strategy {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Strategy::Autotools => "autotools",
            Strategy::Cmake => "cmake",
            Strategy::CmakeProject => "cmake-project",
            Strategy::Busybox => "busybox",
            Strategy::LinuxHeaders => "linux-headers",
            Strategy::CrystalCompiler => "crystal-compiler",
            Strategy::CrystalBuild => "crystal-build",
            Strategy::Crystal => "crystal",
            Strategy::CopyTree => "copy-tree",
            Strategy::RemoveTree => "remove-tree",
            Strategy::WriteFile => "write-file",
            Strategy::PrepareRootfs => "prepare-rootfs",
            Strategy::Symlink => "symlink",
            Strategy::Tarball => "tarball",
            Strategy::DownloadSources => "download-sources",
            Strategy::PopulateSeed => "populate-seed",
            Strategy::ExtractSources => "extract-sources",
            Strategy::AlpineSetup => "alpine-setup",
            Strategy::MakefileClassic => "makefile-classic",
        }
    }
}

/// One build phase's declared environment tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentTag {
    HostSetup,
    AlpineSeed,
    SysrootToolchain,
    RootfsSystem,
    RootfsFinalize,
}

impl EnvironmentTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentTag::HostSetup => "host-setup",
            EnvironmentTag::AlpineSeed => "alpine-seed",
            EnvironmentTag::SysrootToolchain => "sysroot-toolchain",
            EnvironmentTag::RootfsSystem => "rootfs-system",
            EnvironmentTag::RootfsFinalize => "rootfs-finalize",
        }
    }

    pub fn is_rootfs(&self) -> bool {
        matches!(self, EnvironmentTag::RootfsSystem | EnvironmentTag::RootfsFinalize)
    }
}

/// A single build step, owned by exactly one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub strategy: Strategy,
    pub workdir: String,
    #[serde(default)]
    pub configure_flags: Vec<String>,
    #[serde(default)]
    pub patches: Vec<String>,
    #[serde(default)]
    pub build_dir: Option<String>,
    #[serde(default)]
    pub install_prefix: Option<String>,
    #[serde(default)]
    pub destdir: Option<String>,
    #[serde(default)]
    pub env: EnvMap,
    #[serde(default)]
    pub clean_build: bool,
    /// Source archive basenames expected in the cache before this step runs
    /// (only meaningful for `download-sources`/`extract-sources` steps).
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub extract_sources: Option<bool>,
    /// Package names, for steps like `alpine-setup` that install a package set.
    #[serde(default)]
    pub packages: Option<Vec<String>>,
    /// Payload for `write-file`.
    #[serde(default)]
    pub content: Option<String>,
}

/// A named group of steps sharing environment and install defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub description: String,
    pub workspace: String,
    pub environment: EnvironmentTag,
    pub install_prefix: String,
    #[serde(default)]
    pub destdir: Option<String>,
    #[serde(default)]
    pub env: EnvMap,
    pub steps: Vec<Step>,
}

/// The ordered list of phases produced by the builder and replayed by the
/// executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub format_version: i64,
    pub phases: Vec<Phase>,
}

impl Plan {
    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.name == name)
    }
}

/// The fixed phase ordering the builder must produce and the executor must
/// preserve.
pub const PHASE_ORDER: &[&str] = &[
    "host-setup",
    "sysroot-from-alpine",
    "rootfs-from-sysroot",
    "system-from-sysroot",
    "tools-from-system",
    "finalize-rootfs",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trips_through_json() {
        let s = Strategy::CmakeProject;
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"cmake-project\"");
        let back: Strategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn plan_round_trips_structurally() {
        let plan = Plan {
            format_version: 2,
            phases: vec![Phase {
                name: "x".into(),
                description: "desc".into(),
                workspace: "/workspace".into(),
                environment: EnvironmentTag::AlpineSeed,
                install_prefix: "/opt/sysroot".into(),
                destdir: None,
                env: EnvMap::new(),
                steps: vec![Step {
                    name: "m4".into(),
                    strategy: Strategy::Autotools,
                    workdir: "/workspace/m4-1.4.19".into(),
                    configure_flags: vec!["--disable-static".into()],
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
                }],
            }],
        };
        let json = serde_json::to_string_pretty(&plan).unwrap();
        let parsed: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, plan);
    }
}
