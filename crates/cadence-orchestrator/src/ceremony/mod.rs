mod failure;
mod git;
mod orchestrator;
mod triggers;

pub use failure::*;
pub use git::*;
pub use orchestrator::*;
pub use triggers::*;
