//! HookRuns gating canary steps and pod lifecycle transitions.

pub mod lifecycle;
pub mod run;
pub mod step;

pub use lifecycle::{HookKind, LifecycleHookControl};
pub use step::StepHookControl;
