//! Non-mutating precondition probe.
//! `collect_restrictions` has no side effects and is idempotent for
//! identical process state.

use std::fs;

const CAP_SYS_ADMIN_BIT: u32 = 21;

pub fn collect_restrictions() -> Vec<String> {
    let mut restrictions = Vec::new();

    if let Some(value) = read_trimmed("/proc/sys/kernel/unprivileged_userns_clone") {
        if value == "0" {
            restrictions.push(
                "kernel.unprivileged_userns_clone=0: user namespaces are disabled system-wide; \
                 enable with `sysctl -w kernel.unprivileged_userns_clone=1`"
                    .to_string(),
            );
        }
    }

    if let Some(value) = read_trimmed("/proc/sys/user/max_user_namespaces") {
        if value == "0" {
            restrictions.push(
                "user.max_user_namespaces=0: user namespace creation is capped to zero".to_string(),
            );
        }
    }

    let filesystems = read_to_string("/proc/filesystems").unwrap_or_default();
    for fstype in ["proc", "sysfs", "tmpfs"] {
        if !filesystems.lines().any(|l| l.trim_end().ends_with(fstype)) {
            restrictions.push(format!("filesystem type {:?} is not registered with this kernel", fstype));
        }
    }

    if let Some(status) = read_to_string("/proc/self/status") {
        if let Some(no_new_privs) = field(&status, "NoNewPrivs") {
            if no_new_privs.trim() == "1" {
                restrictions.push("NoNewPrivs is set on this process".to_string());
            }
        }
        if let Some(seccomp) = field(&status, "Seccomp") {
            if seccomp.trim() != "0" {
                restrictions.push(format!("Seccomp mode is {} (filtering active)", seccomp.trim()));
            }
        }
    }

    if let Some(mountinfo) = read_to_string("/proc/self/mountinfo") {
        if let Some(opts) = dev_mount_options(&mountinfo) {
            if opts.contains("nodev") {
                restrictions.push("/dev is mounted nodev".to_string());
            }
        }
    }

    if let Some(profile) = read_trimmed("/proc/self/attr/current") {
        let name = profile.split(' ').next().unwrap_or("").trim_end_matches('\0');
        if !name.is_empty() && name != "unconfined" {
            restrictions.push(format!("AppArmor profile {:?} is active", name));
        }
    }

    restrictions
}

pub fn has_cap_sys_admin() -> bool {
    let status = match read_to_string("/proc/self/status") {
        Some(s) => s,
        None => return false,
    };
    let cap_eff = match field(&status, "CapEff") {
        Some(v) => v,
        None => return false,
    };
    match u64::from_str_radix(cap_eff.trim(), 16) {
        Ok(mask) => mask & (1 << CAP_SYS_ADMIN_BIT) != 0,
        Err(_) => false,
    }
}

fn field<'a>(status: &'a str, name: &str) -> Option<&'a str> {
    status
        .lines()
        .find(|l| l.starts_with(name))
        .and_then(|l| l.split(':').nth(1))
}

fn dev_mount_options(mountinfo: &str) -> Option<String> {
    mountinfo
        .lines()
        .find(|l| l.split(' ').nth(4) == Some("/dev"))
        .and_then(|l| l.split(" - ").next())
        .and_then(|fields| fields.split(' ').nth(5))
        .map(str::to_string)
}

fn read_to_string(path: &str) -> Option<String> {
    fs::read_to_string(path).ok()
}

fn read_trimmed(path: &str) -> Option<String> {
    read_to_string(path).map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_idempotent_for_identical_process_state() {
        let a = collect_restrictions();
        let b = collect_restrictions();
        assert_eq!(a, b);
    }

    #[test]
    fn field_extracts_value_after_colon() {
        let status = "Name:\tbash\nNoNewPrivs:\t0\n";
        assert_eq!(field(status, "NoNewPrivs").unwrap().trim(), "0");
    }
}
