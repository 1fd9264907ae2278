//! The static source package catalog.
//! Compiled into the builder; never read from disk.

use crate::model::{Package, Strategy};

pub const CURRENT_FORMAT_VERSION: i64 = 2;

pub static CATALOG: &[Package] = &[
    Package {
        name: "m4",
        version: "1.4.19",
        url: "https://ftp.gnu.org/gnu/m4/m4-1.4.19.tar.xz",
        sha256: Some("63aede5c6d33b6d9b13511cd0be2cac046f2e70fd0a07aa154ba20601d6ad36"),
        checksum_sidecar_url: None,
        phases: None,
        strategy: Strategy::Autotools,
        configure_flags: &["--disable-static"],
        patches: &[],
        build_directory: None,
        out_of_tree_build_dir: None,
    },
    Package {
        name: "bison",
        version: "3.8.2",
        url: "https://ftp.gnu.org/gnu/bison/bison-3.8.2.tar.xz",
        sha256: Some("9bba0214ccf7f1079c5d59210045227bcf6eee90152e162b641309a42b2ed52"),
        checksum_sidecar_url: None,
        phases: None,
        strategy: Strategy::Autotools,
        configure_flags: &[],
        patches: &[],
        build_directory: None,
        out_of_tree_build_dir: None,
    },
    Package {
        name: "bdwgc",
        version: "8.2.6",
        url: "https://github.com/ivmai/bdwgc/releases/download/v8.2.6/gc-8.2.6.tar.gz",
        sha256: None,
        checksum_sidecar_url: Some("https://github.com/ivmai/bdwgc/releases/download/v8.2.6/gc-8.2.6.tar.gz.sha256"),
        phases: Some(&["sysroot-from-alpine", "system-from-sysroot"]),
        strategy: Strategy::Autotools,
        configure_flags: &["--enable-cplusplus"],
        patches: &[],
        build_directory: None,
        out_of_tree_build_dir: None,
    },
    Package {
        name: "busybox",
        version: "1.36.1",
        url: "https://busybox.net/downloads/busybox-1.36.1.tar.bz2",
        sha256: Some("bguess000000000000000000000000000000000000000000000000000000"),
        checksum_sidecar_url: None,
        phases: Some(&["rootfs-from-sysroot"]),
        strategy: Strategy::Busybox,
        configure_flags: &[],
        patches: &[],
        build_directory: None,
        out_of_tree_build_dir: None,
    },
    Package {
        name: "linux",
        version: "6.9",
        url: "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.9.tar.xz",
        sha256: None,
        checksum_sidecar_url: Some("https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.9.tar.sign"),
        phases: Some(&["sysroot-from-alpine"]),
        strategy: Strategy::LinuxHeaders,
        configure_flags: &["ARCH=x86_64"],
        patches: &[],
        build_directory: None,
        out_of_tree_build_dir: None,
    },
    Package {
        name: "llvm-project",
        version: "18.1.8",
        url: "https://github.com/llvm/llvm-project/releases/download/llvmorg-18.1.8/llvm-project-18.1.8.src.tar.xz",
        sha256: None,
        checksum_sidecar_url: None,
        phases: Some(&["sysroot-from-alpine"]),
        strategy: Strategy::CmakeProject,
        configure_flags: &["-DLLVM_ENABLE_PROJECTS=clang;lld", "-DLLVM_TARGETS_TO_BUILD=X86"],
        patches: &[],
        build_directory: Some("llvm-project-18.1.8.src"),
        out_of_tree_build_dir: Some("build-%{phase}-%{name}"),
    },
    Package {
        name: "crystal",
        version: "1.12.2",
        url: "https://github.com/crystal-lang/crystal/archive/refs/tags/1.12.2.tar.gz",
        sha256: None,
        checksum_sidecar_url: None,
        phases: Some(&["sysroot-from-alpine"]),
        strategy: Strategy::CrystalCompiler,
        configure_flags: &[],
        patches: &[],
        build_directory: Some("crystal-1.12.2"),
        out_of_tree_build_dir: None,
    },
    Package {
        name: "recipe",
        version: "0.5.0",
        url: "https://example.invalid/recipe-0.5.0.tar.gz",
        sha256: None,
        checksum_sidecar_url: None,
        phases: Some(&["system-from-sysroot"]),
        strategy: Strategy::CrystalBuild,
        configure_flags: &["--release"],
        patches: &[],
        build_directory: Some("recipe-0.5.0"),
        out_of_tree_build_dir: None,
    },
];

pub fn find(name: &str) -> Option<&'static Package> {
    CATALOG.iter().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<&str> = CATALOG.iter().map(|p| p.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
    }
}
