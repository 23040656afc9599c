//! Search configuration.

use serde::{Deserialize, Serialize};

use super::Operator;

/// Top-level configuration for one search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Stop once the population reaches this generation. `None` disables the limit.
    #[serde(default = "default_max_generations")]
    pub max_generations: Option<usize>,
    /// Stop once this many candidates were evaluated. `None` disables the limit.
    #[serde(default = "default_max_sample_nums")]
    pub max_sample_nums: Option<usize>,
    /// Population target size. `None` picks one from the sample budget.
    #[serde(default)]
    pub pop_size: Option<usize>,
    /// Number of parents handed to crossover operators.
    #[serde(default = "default_selection_num")]
    pub selection_num: usize,
    /// Operators each evolving worker cycles through, in order.
    #[serde(default = "default_operators")]
    pub operators: Vec<Operator>,
    /// Concurrent sampler workers.
    #[serde(default = "default_workers")]
    pub num_samplers: usize,
    /// Concurrent evaluations (and workspace slots).
    #[serde(default = "default_workers")]
    pub num_evaluators: usize,
    /// Skip seeding and continue from an installed population.
    #[serde(default)]
    pub resume_mode: bool,
    /// Stop the run on the first internal worker error.
    #[serde(default)]
    pub debug_mode: bool,
    /// Language-model calls per operator step before the step is skipped.
    #[serde(default = "default_max_reply_attempts")]
    pub max_reply_attempts: usize,
    /// Pause after a step whose attempts were all malformed, in milliseconds.
    #[serde(default = "default_reply_backoff_ms")]
    pub reply_backoff_ms: u64,
    /// Single or multi-objective scoring.
    #[serde(default)]
    pub objective: ObjectiveMode,
    /// Random seed for parent selection.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_generations: default_max_generations(),
            max_sample_nums: default_max_sample_nums(),
            pop_size: None,
            selection_num: default_selection_num(),
            operators: default_operators(),
            num_samplers: default_workers(),
            num_evaluators: default_workers(),
            resume_mode: false,
            debug_mode: false,
            max_reply_attempts: default_max_reply_attempts(),
            reply_backoff_ms: default_reply_backoff_ms(),
            objective: ObjectiveMode::default(),
            random_seed: None,
        }
    }
}

fn default_max_generations() -> Option<usize> {
    Some(10)
}
fn default_max_sample_nums() -> Option<usize> {
    Some(100)
}
fn default_selection_num() -> usize {
    2
}
fn default_operators() -> Vec<Operator> {
    Operator::EVOLVING.to_vec()
}
fn default_workers() -> usize {
    1
}
fn default_max_reply_attempts() -> usize {
    3
}
fn default_reply_backoff_ms() -> u64 {
    500
}

/// How candidate scores are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ObjectiveMode {
    /// Scalar scores, truncation survival.
    #[default]
    Single,
    /// Vector scores, Pareto survival with diversity.
    Multi {
        /// Number of objectives per score.
        objectives: usize,
    },
}

impl ObjectiveMode {
    /// Objectives per score.
    pub fn objectives(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Multi { objectives } => objectives,
        }
    }
}

/// Recommended population size for a sample budget, with the tolerated deviation.
///
/// An unbounded budget is treated like the largest bracket.
pub fn recommended_population_size(max_sample_nums: Option<usize>) -> (usize, usize) {
    match max_sample_nums {
        None => (40, 20),
        Some(n) if n >= 10_000 => (40, 20),
        Some(n) if n >= 1_000 => (20, 10),
        Some(n) if n >= 200 => (10, 5),
        Some(_) => (5, 5),
    }
}

impl SearchConfig {
    /// Population size to use, warning if an explicit size is far from the recommendation.
    pub fn resolved_population_size(&self) -> usize {
        let (recommended, tolerance) = recommended_population_size(self.max_sample_nums);
        match self.pop_size {
            None => recommended,
            Some(size) => {
                if size.abs_diff(recommended) > tolerance {
                    log::warn!(
                        "population size {size} is not suitable for this budget, \
                         consider resetting it to {recommended}"
                    );
                }
                size
            }
        }
    }

    /// Cap on samples drawn while seeding the first generation.
    pub fn seeding_sample_cap(&self, population_size: usize) -> usize {
        let cap = 3 * population_size;
        match self.max_sample_nums {
            Some(max) => max.min(cap),
            None => cap,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_samplers == 0 {
            return Err(ConfigError::NoSamplers);
        }
        if self.num_evaluators == 0 {
            return Err(ConfigError::NoEvaluators);
        }
        if self.selection_num == 0 {
            return Err(ConfigError::InvalidSelectionNum);
        }
        if self.operators.is_empty() {
            return Err(ConfigError::NoOperators);
        }
        if let Some(op) = self
            .operators
            .iter()
            .find(|op| matches!(op, Operator::Init | Operator::Seed))
        {
            return Err(ConfigError::InvalidOperator(op.tag().to_string()));
        }
        if self.pop_size.is_some_and(|size| size < 2) {
            return Err(ConfigError::PopulationTooSmall);
        }
        if let ObjectiveMode::Multi { objectives } = self.objective
            && objectives < 2
        {
            return Err(ConfigError::InvalidObjectives(objectives));
        }
        if self.max_reply_attempts == 0 {
            return Err(ConfigError::NoReplyAttempts);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one sampler worker is required")]
    NoSamplers,
    #[error("At least one evaluator worker is required")]
    NoEvaluators,
    #[error("Selection count must be at least 1")]
    InvalidSelectionNum,
    #[error("Operator sequence is empty")]
    NoOperators,
    #[error("Operator {0} cannot be used while evolving")]
    InvalidOperator(String),
    #[error("Population size must be at least 2")]
    PopulationTooSmall,
    #[error("Multi-objective mode needs at least 2 objectives, got {0}")]
    InvalidObjectives(usize),
    #[error("At least one reply attempt is required")]
    NoReplyAttempts,
    #[error("Invalid sandbox configuration: {0}")]
    Sandbox(String),
}
