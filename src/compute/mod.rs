//! Compute module - sampling, evaluation and evolutionary search.

pub mod evolution;
pub mod sampler;
pub mod sandbox;
