//! JSON shape for user-authored overrides. Every field is optional;
//! applying/diffing is implemented in [`crate::plan::overrides`].

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::model::EnvMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_build: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configure_flags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configure_flags_add: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches_add: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvMap>,
    /// Restricts (and may reorder) the step list to this subset; unknown
    /// names are a validation error. Never allowed to introduce new steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<String, StepOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub phases: BTreeMap<String, PhaseOverride>,
}

impl Overrides {
    pub fn is_noop(&self) -> bool {
        self.phases.is_empty()
    }
}
