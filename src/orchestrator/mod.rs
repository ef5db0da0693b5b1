//! The execution kernel's control plane: guardian, runner, and the
//! interactive debugger.

pub mod guardian;
pub mod interactive;
pub mod runner;

pub use guardian::{FeatureFlags, GuardianDecision, get_next_phase};
pub use runner::{LoopRunner, RunOutcome, RunnerOptions};
