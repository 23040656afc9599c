//! Schema module - Configuration and data-model types for heuristic search runs.

mod candidate;
mod config;
mod sandbox;
mod task;

pub use candidate::*;
pub use config::*;
pub use sandbox::*;
pub use task::*;
