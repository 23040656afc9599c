//! Evolutionary search over generated programs.
//!
//! # Overview
//!
//! The search system consists of:
//!
//! - **Population** (`population`): shared generations of scored candidates,
//!   survival and parent selection for one or several objectives
//! - **Pareto tools** (`pareto`): dominance and non-dominated fronts
//! - **Similarity** (`similarity`): token-level structural similarity used to
//!   penalize near-identical dominated candidates
//! - **Dispatch** (`dispatch`): bounded evaluator pool with exclusive
//!   workspace slots
//! - **Recording** (`recorder`): sample history, population snapshots and resume
//! - **Search** (`search`): the engine tying sampler, evaluator and population
//!   together
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use heurisearch::compute::evolution::EvolutionEngine;
//! use heurisearch::compute::sampler::{LanguageModel, LanguageModelError, Message};
//! use heurisearch::compute::sandbox::InProcessEvaluator;
//! use heurisearch::schema::{Score, SearchConfig, TaskContext};
//!
//! struct Echo;
//! impl LanguageModel for Echo {
//!     fn draw(&self, _messages: &[Message]) -> Result<String, LanguageModelError> {
//!         Ok("<<constant>>[[CODE_START 1.0 CODE_END]]".into())
//!     }
//! }
//!
//! let evaluator = InProcessEvaluator::new(|source: &str| {
//!     source.trim().parse().map(Score::Scalar).map_err(|e| format!("{e}"))
//! });
//! let task = TaskContext::new("Return a number.", "0.0");
//! let mut engine = EvolutionEngine::new(
//!     SearchConfig::default(),
//!     Arc::new(Echo),
//!     task,
//!     Arc::new(evaluator),
//! )?;
//! let result = engine.run_with_callback(|progress| {
//!     println!("Generation {}: best {:?}", progress.generation, progress.best_score);
//! })?;
//! println!("Stopped: {:?}", result.stats.stop_reason);
//! # Ok::<(), heurisearch::compute::evolution::SearchError>(())
//! ```

mod dispatch;
mod pareto;
mod population;
mod recorder;
mod search;
mod similarity;

pub use dispatch::{EvaluatorPool, PendingEvaluation, SlotLease, SlotPoller};
pub use pareto::{dominates, non_dominated_front};
pub use population::{Population, RegisterOutcome, dominance_similarity};
pub use recorder::{
    JsonRecorder, NullRecorder, PopulationEntry, ResumeState, RunParameters, RunRecorder,
    SampleRecord, load_population,
};
pub use search::{
    EvolutionEngine, SearchError, SearchPhase, SearchProgress, SearchResult, SearchStats,
    StopReason,
};
pub use similarity::structural_similarity;
