//! `sysroot-namespace-check`: prints whatever precondition restrictions
//! would block `sysroot-namespace` from entering a rootfs, without
//! mutating any process or kernel state.

use bq2::namespace::collect_restrictions;

fn main() {
    bq2::logging::init();
    let restrictions = collect_restrictions();
    if restrictions.is_empty() {
        println!("no known restrictions on entering a user/mount namespace");
        return;
    }
    println!("namespace entry may be restricted:");
    for restriction in &restrictions {
        println!("  - {restriction}");
    }
    std::process::exit(1);
}
