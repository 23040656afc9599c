//! heurisearch - Language-model driven evolutionary heuristic search.
//!
//! A language model proposes candidate programs, a sandbox scores each one
//! against benchmark instances, and an evolutionary loop improves a shared
//! population of candidates under a sample and generation budget.
//!
//! # Architecture
//!
//! The crate is split into three modules:
//!
//! - `schema`: Configuration and data-model types (candidates, scores, search
//!   and sandbox configuration, task context)
//! - `compute`: Sampling, evaluation and the evolutionary search engine
//! - `registry`: Explicit mapping from task keys to evaluator factories
//!
//! # Example
//!
//! ```rust,no_run
//! use heurisearch::{
//!     compute::sandbox::{Evaluator, ExternalEvaluator},
//!     schema::SandboxConfig,
//! };
//!
//! let config: SandboxConfig =
//!     serde_json::from_str(&std::fs::read_to_string("sandbox.json")?)?;
//!
//! // One workspace slot, cloned from the template project
//! let evaluator = ExternalEvaluator::new(config, 1)?;
//! let evaluation = evaluator.evaluate("class Ruin {}", 0);
//!
//! println!("{} in {:.1}s", evaluation.outcome, evaluation.elapsed_seconds());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compute;
pub mod registry;
pub mod schema;

// Re-export commonly used types
pub use compute::evolution::{EvolutionEngine, SearchError, SearchResult, StopReason};
pub use registry::{RegistryError, TaskRegistry};
pub use schema::{Candidate, Operator, Score, SearchConfig, TaskContext};
