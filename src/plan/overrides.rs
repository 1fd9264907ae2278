//! Overrides engine: `apply` rewrites a [`Plan`] per user-authored
//! [`Overrides`]; `from_diff` derives overrides from two plans.

use crate::error::ValidationError;
use crate::model::Plan;
use crate::overrides_model::{Overrides, PhaseOverride, StepOverride};

/// Applies `overrides` to `plan`, returning a new plan. Fails if any
/// referenced phase or allowlisted package does not exist.
pub fn apply(plan: &Plan, overrides: &Overrides) -> Result<Plan, ValidationError> {
    let mut plan = plan.clone();

    for (phase_name, phase_override) in &overrides.phases {
        let phase_idx = plan
            .phases
            .iter()
            .position(|p| &p.name == phase_name)
            .ok_or_else(|| ValidationError::Other(format!("overrides reference unknown phase {:?}", phase_name)))?;

        apply_phase_scalars(&mut plan.phases[phase_idx], phase_override);

        if let Some(allowlist) = &phase_override.packages {
            let available: std::collections::HashSet<&str> =
                plan.phases[phase_idx].steps.iter().map(|s| s.name.as_str()).collect();
            let unknown: Vec<String> = allowlist.iter().filter(|n| !available.contains(n.as_str())).cloned().collect();
            if !unknown.is_empty() {
                return Err(ValidationError::UnknownPackages(unknown));
            }
            let mut by_name: std::collections::HashMap<String, crate::model::Step> =
                plan.phases[phase_idx].steps.drain(..).map(|s| (s.name.clone(), s)).collect();
            plan.phases[phase_idx].steps = allowlist.iter().filter_map(|n| by_name.remove(n)).collect();
        }

        for step in &mut plan.phases[phase_idx].steps {
            if let Some(step_override) = phase_override.steps.get(&step.name) {
                apply_step_override(step, step_override);
            }
        }
    }

    Ok(plan)
}

fn apply_phase_scalars(phase: &mut crate::model::Phase, ov: &PhaseOverride) {
    if let Some(install_prefix) = &ov.install_prefix {
        phase.install_prefix = install_prefix.clone();
    }
    if let Some(destdir) = &ov.destdir {
        phase.destdir = Some(destdir.clone());
    }
    if let Some(env) = &ov.env {
        for (k, v) in env {
            phase.env.insert(k.clone(), v.clone());
        }
    }
}

fn apply_step_override(step: &mut crate::model::Step, ov: &StepOverride) {
    if let Some(workdir) = &ov.workdir {
        step.workdir = workdir.clone();
    }
    if let Some(build_dir) = &ov.build_dir {
        step.build_dir = Some(build_dir.clone());
    }
    if let Some(install_prefix) = &ov.install_prefix {
        step.install_prefix = Some(install_prefix.clone());
    }
    if let Some(destdir) = &ov.destdir {
        step.destdir = Some(destdir.clone());
    }
    if let Some(env) = &ov.env {
        for (k, v) in env {
            step.env.insert(k.clone(), v.clone());
        }
    }
    if let Some(clean_build) = ov.clean_build {
        step.clean_build = clean_build;
    }
    if let Some(flags) = &ov.configure_flags {
        step.configure_flags = flags.clone();
    }
    if let Some(patches) = &ov.patches {
        step.patches = patches.clone();
    }
    step.configure_flags.extend(ov.configure_flags_add.iter().cloned());
    step.patches.extend(ov.patches_add.iter().cloned());
}

/// Derives the minimal [`Overrides`] that turns `base` into `target`.
/// Used only as a tooling convenience; refuses transformations that
/// `apply` itself cannot express losslessly.
pub fn from_diff(base: &Plan, target: &Plan) -> Result<Overrides, ValidationError> {
    if base.format_version != target.format_version {
        return Err(ValidationError::Other("from_diff requires equal format_version".to_string()));
    }

    let base_names: std::collections::BTreeSet<&str> = base.phases.iter().map(|p| p.name.as_str()).collect();
    let target_names: std::collections::BTreeSet<&str> = target.phases.iter().map(|p| p.name.as_str()).collect();
    if base_names != target_names {
        return Err(ValidationError::ForbiddenOverride(
            "from_diff requires identical phase sets between base and target".to_string(),
        ));
    }

    let mut overrides = Overrides::default();

    for base_phase in &base.phases {
        let target_phase = target.phase(&base_phase.name).expect("phase sets were checked equal above");

        let base_step_names: Vec<&str> = base_phase.steps.iter().map(|s| s.name.as_str()).collect();
        let target_step_names: Vec<&str> = target_phase.steps.iter().map(|s| s.name.as_str()).collect();
        if target_step_names.len() > base_step_names.len() || target_step_names.iter().any(|n| !base_step_names.contains(n)) {
            return Err(ValidationError::ForbiddenOverride(format!(
                "from_diff refuses to add new steps to phase {:?}",
                base_phase.name
            )));
        }
        let base_order_restricted_to_target: Vec<&str> =
            base_step_names.iter().copied().filter(|n| target_step_names.contains(n)).collect();
        if base_order_restricted_to_target != target_step_names {
            return Err(ValidationError::ForbiddenOverride(format!(
                "from_diff refuses to reorder steps in phase {:?}",
                base_phase.name
            )));
        }

        let mut phase_override = PhaseOverride::default();
        if base_phase.install_prefix != target_phase.install_prefix {
            phase_override.install_prefix = Some(target_phase.install_prefix.clone());
        }
        if base_phase.destdir != target_phase.destdir {
            phase_override.destdir = Some(target_phase.destdir.clone().unwrap_or_default());
        }
        for (k, v) in &target_phase.env {
            if base_phase.env.get(k) != Some(v) {
                phase_override.env.get_or_insert_with(Default::default).insert(k.clone(), v.clone());
            }
        }
        for k in base_phase.env.keys() {
            if !target_phase.env.contains_key(k) {
                return Err(ValidationError::ForbiddenOverride(format!(
                    "from_diff refuses to remove env key {:?} from phase {:?}",
                    k, base_phase.name
                )));
            }
        }
        if target_step_names.len() != base_step_names.len() {
            phase_override.packages = Some(target_step_names.iter().map(|s| s.to_string()).collect());
        }

        for target_step in &target_phase.steps {
            let base_step = base_phase.steps.iter().find(|s| s.name == target_step.name).expect("checked above");
            if let Some(step_override) = diff_step(base_step, target_step)? {
                phase_override.steps.insert(target_step.name.clone(), step_override);
            }
        }

        if phase_override != PhaseOverride::default() {
            overrides.phases.insert(base_phase.name.clone(), phase_override);
        }
    }

    Ok(overrides)
}

fn diff_step(base: &crate::model::Step, target: &crate::model::Step) -> Result<Option<StepOverride>, ValidationError> {
    let mut ov = StepOverride::default();

    if base.workdir != target.workdir {
        ov.workdir = Some(target.workdir.clone());
    }
    if base.build_dir != target.build_dir {
        ov.build_dir = target.build_dir.clone();
    }
    if base.install_prefix != target.install_prefix {
        ov.install_prefix = target.install_prefix.clone();
    }
    if base.destdir != target.destdir {
        ov.destdir = target.destdir.clone();
    }
    if base.clean_build != target.clean_build {
        ov.clean_build = Some(target.clean_build);
    }

    for (k, v) in &target.env {
        if base.env.get(k) != Some(v) {
            ov.env.get_or_insert_with(Default::default).insert(k.clone(), v.clone());
        }
    }
    for k in base.env.keys() {
        if !target.env.contains_key(k) {
            return Err(ValidationError::ForbiddenOverride(format!(
                "from_diff refuses to remove env key {:?} from step {:?}",
                k, base.name
            )));
        }
    }

    if !target.configure_flags.starts_with(&base.configure_flags) {
        return Err(ValidationError::ForbiddenOverride(format!(
            "from_diff refuses to remove existing configure flags from step {:?}",
            base.name
        )));
    }
    let added_flags = &target.configure_flags[base.configure_flags.len()..];
    if !added_flags.is_empty() {
        ov.configure_flags_add = added_flags.to_vec();
    }

    if !target.patches.starts_with(&base.patches) {
        return Err(ValidationError::ForbiddenOverride(format!(
            "from_diff refuses to remove existing patches from step {:?}",
            base.name
        )));
    }
    let added_patches = &target.patches[base.patches.len()..];
    if !added_patches.is_empty() {
        ov.patches_add = added_patches.to_vec();
    }

    Ok(if ov == StepOverride::default() { None } else { Some(ov) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnvMap, EnvironmentTag, Phase, Step, Strategy};

    fn sample_step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            strategy: Strategy::Autotools,
            workdir: "/workspace/x".into(),
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
        }
    }

    fn sample_plan() -> Plan {
        Plan {
            format_version: 2,
            phases: vec![Phase {
                name: "sysroot-from-alpine".into(),
                description: "d".into(),
                workspace: "/workspace".into(),
                environment: EnvironmentTag::AlpineSeed,
                install_prefix: "/opt/sysroot".into(),
                destdir: None,
                env: EnvMap::new(),
                steps: vec![sample_step("m4"), sample_step("bison")],
            }],
        }
    }

    #[test]
    fn apply_restricts_and_reorders_via_allowlist() {
        let plan = sample_plan();
        let mut overrides = Overrides::default();
        let mut phase_override = PhaseOverride::default();
        phase_override.packages = Some(vec!["bison".to_string()]);
        overrides.phases.insert("sysroot-from-alpine".to_string(), phase_override);

        let result = apply(&plan, &overrides).unwrap();
        let names: Vec<&str> = result.phases[0].steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["bison"]);
    }

    #[test]
    fn apply_rejects_unknown_allowlisted_package() {
        let plan = sample_plan();
        let mut overrides = Overrides::default();
        let mut phase_override = PhaseOverride::default();
        phase_override.packages = Some(vec!["not-real".to_string()]);
        overrides.phases.insert("sysroot-from-alpine".to_string(), phase_override);

        let err = apply(&plan, &overrides).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownPackages(_)));
    }

    #[test]
    fn apply_appends_configure_flags_add_onto_base() {
        let plan = sample_plan();
        let mut overrides = Overrides::default();
        let mut phase_override = PhaseOverride::default();
        let mut step_override = StepOverride::default();
        step_override.configure_flags_add = vec!["--enable-foo".to_string()];
        phase_override.steps.insert("m4".to_string(), step_override);
        overrides.phases.insert("sysroot-from-alpine".to_string(), phase_override);

        let result = apply(&plan, &overrides).unwrap();
        let m4 = result.phases[0].steps.iter().find(|s| s.name == "m4").unwrap();
        assert_eq!(m4.configure_flags, vec!["--disable-static", "--enable-foo"]);
    }

    #[test]
    fn from_diff_encodes_added_configure_flag() {
        let base = sample_plan();
        let mut target = sample_plan();
        target.phases[0].steps[0].configure_flags.push("--enable-foo".to_string());

        let overrides = from_diff(&base, &target).unwrap();
        let phase_override = overrides.phases.get("sysroot-from-alpine").unwrap();
        let step_override = phase_override.steps.get("m4").unwrap();
        assert_eq!(step_override.configure_flags_add, vec!["--enable-foo".to_string()]);
    }

    #[test]
    fn from_diff_refuses_removed_configure_flag() {
        let base = sample_plan();
        let mut target = sample_plan();
        target.phases[0].steps[0].configure_flags.clear();

        let err = from_diff(&base, &target).unwrap_err();
        assert!(matches!(err, ValidationError::ForbiddenOverride(_)));
    }

    #[test]
    fn from_diff_refuses_new_steps() {
        let base = sample_plan();
        let mut target = sample_plan();
        target.phases[0].steps.push(sample_step("extra"));

        let err = from_diff(&base, &target).unwrap_err();
        assert!(matches!(err, ValidationError::ForbiddenOverride(_)));
    }
}
