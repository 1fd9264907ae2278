//! Plan model, builder, strategy synthesis, executor, resume engine, and
//! overrides engine.

pub mod builder;
pub mod catalog;
pub mod executor;
pub mod overrides;
pub mod resume;
pub mod strategy;

pub use builder::{build_plan, PhaseSpec};
pub use executor::{run_phase, ExecutorConfig};
pub use resume::{decide, ResumeDecision, ResumeInputs, Stage};
