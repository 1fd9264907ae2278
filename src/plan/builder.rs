//! Plan builder: static catalog + phase specifications -> a [`Plan`].

use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::model::{EnvMap, EnvironmentTag, Package, Phase, Plan, Step, Strategy, PHASE_ORDER};

use super::catalog::{self, CURRENT_FORMAT_VERSION};

const ARCHIVE_SUFFIXES: &[&str] = &[".tar.gz", ".tar.xz", ".tar.bz2", ".tgz", ".tbz2", ".zip", ".tar"];

/// One phase's build instructions, as authored by the caller (not on disk;
/// phase specs are compiled alongside the catalog or constructed by the
/// orchestrator for host-setup/rootfs/finalize phases that have no
/// catalog packages at all).
#[derive(Debug, Clone, Default)]
pub struct PhaseSpec {
    pub name: String,
    pub description: String,
    pub workspace: String,
    pub environment: EnvironmentTag,
    pub install_prefix: String,
    pub destdir: Option<String>,
    pub env: EnvMap,
    /// Strict package subset; `None` means "filter the catalog by phase membership".
    pub allowlist: Option<Vec<String>>,
    pub configure_overrides: BTreeMap<String, Vec<String>>,
    pub patch_overrides: BTreeMap<String, Vec<String>>,
    pub env_overrides: BTreeMap<String, EnvMap>,
    /// Non-catalog steps prepended before the catalog-derived steps.
    pub pre_steps: Vec<Step>,
    /// Non-catalog steps appended after the catalog-derived steps.
    pub post_steps: Vec<Step>,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, environment: EnvironmentTag, workspace: impl Into<String>, install_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment,
            workspace: workspace.into(),
            install_prefix: install_prefix.into(),
            ..Default::default()
        }
    }
}

pub fn build_plan(specs: &[PhaseSpec]) -> Result<Plan, ValidationError> {
    let mut phases = Vec::with_capacity(specs.len());
    for spec in specs {
        phases.push(build_phase(spec)?);
    }
    phases.sort_by_key(|p: &Phase| {
        PHASE_ORDER.iter().position(|n| *n == p.name).unwrap_or(usize::MAX)
    });
    Ok(Plan { format_version: CURRENT_FORMAT_VERSION, phases })
}

fn build_phase(spec: &PhaseSpec) -> Result<Phase, ValidationError> {
    let selected: Vec<&'static Package> = match &spec.allowlist {
        Some(names) => {
            let mut out = Vec::with_capacity(names.len());
            let mut unknown = Vec::new();
            for name in names {
                match catalog::find(name) {
                    Some(p) => out.push(p),
                    None => unknown.push(name.clone()),
                }
            }
            if !unknown.is_empty() {
                return Err(ValidationError::UnknownPackages(unknown));
            }
            out
        }
        None => catalog::CATALOG
            .iter()
            .filter(|p| {
                p.phases
                    .map(|phases| phases.contains(&spec.name.as_str()))
                    .unwrap_or(spec.name == "sysroot-from-alpine")
            })
            .collect(),
    };

    let mut steps = spec.pre_steps.clone();
    for package in selected {
        steps.extend(build_steps_for(package, spec));
    }
    steps.extend(spec.post_steps.clone());

    Ok(Phase {
        name: spec.name.clone(),
        description: spec.description.clone(),
        workspace: spec.workspace.clone(),
        environment: spec.environment,
        install_prefix: spec.install_prefix.clone(),
        destdir: spec.destdir.clone(),
        env: spec.env.clone(),
        steps,
    })
}

/// Maps one catalog package to its build step(s). Returns two
/// steps for `llvm-project` (stage1/stage2); one step otherwise.
pub fn build_steps_for(package: &'static Package, spec: &PhaseSpec) -> Vec<Step> {
    let base_dir = derive_workdir(package);
    let configure_flags = merged(package.configure_flags, spec.configure_overrides.get(package.name));
    let patches = merged(package.patches, spec.patch_overrides.get(package.name));
    let env = spec.env_overrides.get(package.name).cloned().unwrap_or_default();
    let clean_build = is_clean_build_package(package.name, &spec.name);

    if package.name == "llvm-project" {
        return build_llvm_stages(package, spec, &base_dir, &configure_flags, &patches, &env);
    }

    vec![Step {
        name: package.name.to_string(),
        strategy: package.strategy.clone(),
        workdir: format!("{}/{}", spec.workspace, base_dir),
        configure_flags,
        patches,
        build_dir: package.out_of_tree_build_dir.map(|d| d.replace("%{phase}", &spec.name).replace("%{name}", package.name)),
        install_prefix: None,
        destdir: None,
        env,
        clean_build,
        sources: None,
        extract_sources: None,
        packages: None,
        content: None,
    }]
}

fn build_llvm_stages(
    package: &'static Package,
    spec: &PhaseSpec,
    base_dir: &str,
    configure_flags: &[String],
    patches: &[String],
    env: &EnvMap,
) -> Vec<Step> {
    let workdir = format!("{}/{}", spec.workspace, base_dir);

    let mut stage1_flags = configure_flags.to_vec();
    stage1_flags.push("-DLLVM_BUILD_STATIC=ON".to_string());

    let stage1 = Step {
        name: format!("{}-stage1", package.name),
        strategy: Strategy::CmakeProject,
        workdir: workdir.clone(),
        configure_flags: stage1_flags,
        patches: patches.to_vec(),
        build_dir: Some(format!("build-{}-stage1", package.name)),
        install_prefix: None,
        destdir: None,
        env: env.clone(),
        clean_build: false,
        sources: None,
        extract_sources: None,
        packages: None,
        content: None,
    };

    // Stage 2 rebuilds with clang against stage 1's freshly-installed
    // libc++/libc++abi/libunwind rather than the host's libstdc++; both
    // the compiler env and the cmake flags need to point at stage 1's
    // install prefix since stage 2 never depends on stage 1's build tree.
    let prefix = spec.install_prefix.trim_end_matches('/');
    let cxx_include = format!("{}/include/c++/v1", prefix);
    let lib_dir = format!("{}/lib", prefix);

    let mut stage2_env = env.clone();
    stage2_env.entry("CC".into()).or_insert_with(|| "clang".into());
    stage2_env.entry("CXX".into()).or_insert_with(|| "clang++".into());
    stage2_env.entry("CPPFLAGS".into()).or_insert_with(|| format!("-I{}", cxx_include));
    stage2_env
        .entry("LDFLAGS".into())
        .or_insert_with(|| format!("-L{} -Wl,-rpath,{}", lib_dir, lib_dir));

    let mut stage2_flags = configure_flags.to_vec();
    stage2_flags.push(format!("-DCMAKE_CXX_FLAGS=-stdlib=libc++ -I{}", cxx_include));
    stage2_flags.push(format!(
        "-DCMAKE_EXE_LINKER_FLAGS=-L{} -Wl,-rpath,{} -lc++abi -lunwind",
        lib_dir, lib_dir
    ));

    let stage2 = Step {
        name: format!("{}-stage2", package.name),
        strategy: Strategy::CmakeProject,
        workdir,
        configure_flags: stage2_flags,
        patches: patches.to_vec(),
        build_dir: Some(format!("build-{}-stage2", package.name)),
        install_prefix: None,
        destdir: None,
        env: stage2_env,
        clean_build: false,
        sources: None,
        extract_sources: None,
        packages: None,
        content: None,
    };

    vec![stage1, stage2]
}

fn is_clean_build_package(name: &str, phase: &str) -> bool {
    name == "bdwgc" && matches!(phase, "sysroot-from-alpine" | "system-from-sysroot")
}

fn merged(base: &'static [&'static str], extra: Option<&Vec<String>>) -> Vec<String> {
    let mut out: Vec<String> = base.iter().map(|s| s.to_string()).collect();
    if let Some(extra) = extra {
        out.extend(extra.iter().cloned());
    }
    out
}

/// Strips one archive suffix and an optional trailing `.src` from the
/// package's archive basename, or uses the explicit `build_directory`.
fn derive_workdir(package: &'static Package) -> String {
    if let Some(dir) = package.build_directory {
        return dir.to_string();
    }
    let basename = package
        .url
        .rsplit('/')
        .next()
        .unwrap_or(package.url);
    let mut stripped = basename;
    for suffix in ARCHIVE_SUFFIXES {
        if let Some(rest) = stripped.strip_suffix(suffix) {
            stripped = rest;
            break;
        }
    }
    stripped.strip_suffix(".src").unwrap_or(stripped).to_string()
}
