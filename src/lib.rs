//! `bq2`: self-hosting sysroot and rootfs construction engine.
//!
//! Builds a sysroot toolchain from a seed environment, then a minimal
//! rootfs from that sysroot, driven by a declarative build plan that is
//! resumable across interrupted runs (see [`orchestrator`] for the
//! top-level state machine).

pub mod cache;
pub mod config;
pub mod digest;
pub mod error;
pub mod git;
pub mod http;
pub mod logging;
pub mod model;
pub mod namespace;
pub mod orchestrator;
pub mod overrides_model;
pub mod plan;
pub mod process;
pub mod report;
pub mod state;
pub mod tar;
