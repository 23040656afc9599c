//! Concurrent evolutionary search driven by language-model proposals.
//!
//! The engine runs two phases. Seeding asks the model for fresh candidates
//! until the first generation fills; evolving then cycles through the
//! configured operators, each step selecting parents, sampling a child,
//! evaluating it on the [`EvaluatorPool`] and registering it with the
//! [`Population`]. Every sampler worker checks the stop conditions before
//! each step, so the sample budget can overshoot by at most one step per
//! worker.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::compute::sampler::{LanguageModel, Sampler};
use crate::compute::sandbox::{EvalOutcome, Evaluator};
use crate::schema::{Candidate, ConfigError, Operator, SearchConfig, TaskContext};

use super::dispatch::EvaluatorPool;
use super::population::{Population, RegisterOutcome};
use super::recorder::{NullRecorder, ResumeState, RunParameters, RunRecorder};

/// Reason the search stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Generation or sample budget reached.
    BudgetExhausted,
    /// Seeding produced too few feasible candidates to select parents from.
    Infeasible,
    /// Cancelled through [`EvolutionEngine::cancel_handle`].
    Cancelled,
}

/// Phase the search is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchPhase {
    Seeding,
    Evolving,
}

/// Snapshot passed to progress callbacks after each survival pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProgress {
    pub phase: SearchPhase,
    pub generation: usize,
    pub total_samples: usize,
    /// Primary objective of the best feasible member.
    pub best_score: Option<f64>,
}

/// Search statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    /// Generations completed.
    pub generations: usize,
    /// Candidates evaluated, including resumed ones.
    pub total_samples: usize,
    /// Feasible members of the final generation.
    pub feasible_members: usize,
    pub elapsed_seconds: f64,
    pub samples_per_second: f64,
    pub stop_reason: StopReason,
}

/// Final state of a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Best feasible candidate by primary objective.
    pub best: Option<Candidate>,
    /// Final generation.
    pub population: Vec<Candidate>,
    /// Pareto archive (empty for single-objective runs).
    pub elitist: Vec<Candidate>,
    pub stats: SearchStats,
}

/// Errors that prevent a search from starting or completing.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to build evaluator pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("Invalid reply format: {0}")]
    ReplyFormat(#[from] regex::Error),
    #[error("Evaluator serves {slots} slots but {evaluators} evaluator workers are configured")]
    InsufficientSlots { slots: usize, evaluators: usize },
    #[error("Search halted after internal error: {0}")]
    Halted(String),
}

/// Evolution engine that runs the search.
pub struct EvolutionEngine {
    config: SearchConfig,
    sampler: Sampler,
    pool: EvaluatorPool,
    population: Population,
    recorder: Arc<dyn RunRecorder>,
    model_name: String,
    task_name: String,
    total_samples: AtomicUsize,
    cancelled: Arc<AtomicBool>,
    halted: Mutex<Option<String>>,
}

impl EvolutionEngine {
    /// Create an engine. Validates the configuration and starts the evaluator pool.
    pub fn new(
        config: SearchConfig,
        model: Arc<dyn LanguageModel>,
        task: TaskContext,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<Self, SearchError> {
        config.validate()?;
        if let Some(slots) = evaluator.slot_capacity()
            && slots < config.num_evaluators
        {
            return Err(SearchError::InsufficientSlots {
                slots,
                evaluators: config.num_evaluators,
            });
        }

        let population_size = config.resolved_population_size();
        let sampler = Sampler::new(model, task, config.max_reply_attempts)?;
        let pool = EvaluatorPool::new(evaluator, config.num_evaluators)?;
        let population = Population::new(population_size, config.objective, config.random_seed);

        log::info!(
            "Search: population {population_size}, {} samplers, {} evaluators, operators [{}]",
            config.num_samplers,
            pool.workers(),
            config
                .operators
                .iter()
                .map(|op| op.tag())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            config,
            sampler,
            pool,
            population,
            recorder: Arc::new(NullRecorder),
            model_name: "unknown".into(),
            task_name: "unknown".into(),
            total_samples: AtomicUsize::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
            halted: Mutex::new(None),
        })
    }

    /// Report samples and populations to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Names written to the run parameters record.
    pub fn with_labels(mut self, model: impl Into<String>, task: impl Into<String>) -> Self {
        self.model_name = model.into();
        self.task_name = task.into();
        self
    }

    /// Continue a previous run: install its population and sample count and
    /// skip seeding.
    pub fn with_resume(mut self, state: ResumeState) -> Self {
        log::info!(
            "Resuming at generation {} with {} members and {} samples",
            state.generation,
            state.members.len(),
            state.total_samples
        );
        self.population = Population::restore(
            self.population.target_size(),
            self.config.objective,
            self.config.random_seed,
            state.members,
            state.generation,
        );
        self.total_samples = AtomicUsize::new(state.total_samples);
        self.config.resume_mode = true;
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Shared population.
    pub fn population(&self) -> &Population {
        &self.population
    }

    /// Candidates evaluated so far.
    pub fn total_samples(&self) -> usize {
        self.total_samples.load(Ordering::SeqCst)
    }

    /// Evaluate caller-provided candidates and place the feasible ones straight
    /// into the current generation. Returns how many were admitted.
    ///
    /// Seeds count toward the sample budget.
    pub fn inject_seeds(&self, seeds: Vec<Candidate>) -> usize {
        if self.pool.is_closed() {
            log::warn!("Evaluator pool is shut down, ignoring {} seeds", seeds.len());
            return 0;
        }
        let submitted: Vec<_> = seeds
            .into_iter()
            .map(|mut seed| {
                seed.operator = Operator::Seed;
                let pending = self.pool.submit(seed.source_text.clone());
                (seed, pending)
            })
            .collect();

        let mut admitted = 0;
        for (mut seed, pending) in submitted {
            let evaluation = pending.wait();
            if matches!(evaluation.outcome, EvalOutcome::Cancelled) {
                continue;
            }
            if evaluation.score().is_none() {
                log::warn!("Dropping seed: {}", evaluation.outcome);
            }
            seed.evaluate_time_seconds = evaluation.elapsed_seconds();
            seed.score = evaluation.into_score();
            self.total_samples.fetch_add(1, Ordering::SeqCst);
            self.record_candidate(&seed);
            if seed.is_feasible() {
                self.population.insert(seed);
                admitted += 1;
            }
        }
        log::info!("Injected {admitted} seeds");
        admitted
    }

    /// Run the search with a progress callback invoked after every survival pass.
    ///
    /// Shuts the evaluator pool down on return; an engine runs once.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<SearchResult, SearchError>
    where
        F: Fn(&SearchProgress) + Sync,
    {
        let start = Instant::now();
        self.record_parameters();

        if self.config.resume_mode {
            log::info!(
                "Skipping seeding, resuming at generation {}",
                self.population.generation()
            );
        } else {
            self.seed(&callback);
        }

        let feasible = self.population.feasible_count();
        let stop_reason = if self.is_cancelled() {
            StopReason::Cancelled
        } else if feasible < self.config.selection_num {
            log::error!(
                "Only {feasible} feasible candidates after seeding, {} needed to select parents",
                self.config.selection_num
            );
            StopReason::Infeasible
        } else {
            self.evolve(&callback);
            if self.is_cancelled() {
                StopReason::Cancelled
            } else {
                StopReason::BudgetExhausted
            }
        };

        self.shutdown();
        if let Some(reason) = self.halt_reason() {
            return Err(SearchError::Halted(reason));
        }

        let elapsed = start.elapsed().as_secs_f64();
        let total_samples = self.total_samples();
        let generations = self.population.generation();
        log::info!(
            "Search stopped ({stop_reason:?}) at generation {generations} after {total_samples} samples in {elapsed:.1}s"
        );

        Ok(SearchResult {
            best: self.population.best(),
            population: self.population.members(),
            elitist: self.population.elitist(),
            stats: SearchStats {
                generations,
                total_samples,
                feasible_members: self.population.feasible_count(),
                elapsed_seconds: elapsed,
                samples_per_second: if elapsed > 0.0 {
                    total_samples as f64 / elapsed
                } else {
                    0.0
                },
                stop_reason,
            },
        })
    }

    /// Run the search (blocking).
    pub fn run(&mut self) -> Result<SearchResult, SearchError> {
        self.run_with_callback(|_| {})
    }

    fn seed<F>(&self, callback: &F)
    where
        F: Fn(&SearchProgress) + Sync,
    {
        let cap = self.config.seeding_sample_cap(self.population.target_size());
        let issued = AtomicUsize::new(0);
        log::info!(
            "Seeding: up to {cap} samples for a population of {}",
            self.population.target_size()
        );

        std::thread::scope(|scope| {
            for worker in 0..self.config.num_samplers {
                let issued = &issued;
                scope.spawn(move || {
                    while self.population.generation() == 0 && self.should_continue() {
                        if issued.fetch_add(1, Ordering::SeqCst) >= cap {
                            break;
                        }
                        self.guarded_step(worker, Operator::Init, SearchPhase::Seeding, callback);
                    }
                });
            }
        });

        if self.population.generation() == 0 || self.population.pending_len() > 0 {
            let generation = self.population.survival();
            self.record_population(generation);
            callback(&self.progress(SearchPhase::Seeding));
        }
    }

    fn evolve<F>(&self, callback: &F)
    where
        F: Fn(&SearchProgress) + Sync,
    {
        log::info!(
            "Evolving from generation {} with {} feasible members",
            self.population.generation(),
            self.population.feasible_count()
        );

        std::thread::scope(|scope| {
            for worker in 0..self.config.num_samplers {
                scope.spawn(move || {
                    'work: while self.should_continue() {
                        for &operator in &self.config.operators {
                            if !self.should_continue() {
                                break 'work;
                            }
                            self.guarded_step(worker, operator, SearchPhase::Evolving, callback);
                        }
                    }
                });
            }
        });
    }

    /// One step with errors and panics contained to the step.
    fn guarded_step<F>(&self, worker: usize, operator: Operator, phase: SearchPhase, callback: &F)
    where
        F: Fn(&SearchProgress) + Sync,
    {
        let error = match catch_unwind(AssertUnwindSafe(|| self.step(operator))) {
            Ok(Ok(Some(RegisterOutcome::Survived { .. }))) => {
                callback(&self.progress(phase));
                return;
            }
            Ok(Ok(_)) => return,
            Ok(Err(error)) => error,
            Err(payload) => panic_message(payload.as_ref()),
        };

        log::error!("Sampler {worker}: {operator} step failed: {error}");
        if self.config.debug_mode {
            let mut halted = self.halted.lock().unwrap_or_else(PoisonError::into_inner);
            halted.get_or_insert(error);
        }
    }

    /// Select, sample, evaluate, register. `Ok(None)` when nothing was registered.
    fn step(&self, operator: Operator) -> Result<Option<RegisterOutcome>, String> {
        let wanted = operator.parent_count(self.config.selection_num);
        let parents = if wanted == 0 {
            Vec::new()
        } else {
            let parents = self.population.select_parents(wanted);
            if parents.is_empty() {
                return Err(format!("no selectable parent for {operator}"));
            }
            if parents.len() < wanted {
                log::debug!("{operator}: only {} of {wanted} parents available", parents.len());
            }
            parents
        };

        let Some(mut candidate) = self.sampler.propose(operator, &parents) else {
            std::thread::sleep(Duration::from_millis(self.config.reply_backoff_ms));
            return Ok(None);
        };

        let evaluation = self.pool.evaluate(candidate.source_text.clone());
        if matches!(evaluation.outcome, EvalOutcome::Cancelled) {
            return Ok(None);
        }
        log::debug!(
            "{operator}: {} in {:.2}s",
            evaluation.outcome,
            evaluation.elapsed_seconds()
        );
        candidate.evaluate_time_seconds = evaluation.elapsed_seconds();
        candidate.score = evaluation.into_score();

        self.total_samples.fetch_add(1, Ordering::SeqCst);
        self.record_candidate(&candidate);
        let outcome = self.population.register(candidate);
        if !outcome.is_admitted() {
            log::debug!("{operator}: candidate rejected");
        }
        if let RegisterOutcome::Survived { generation, .. } = outcome {
            self.record_population(generation);
        }
        Ok(Some(outcome))
    }

    fn should_continue(&self) -> bool {
        if self.is_cancelled() || self.halt_reason().is_some() {
            return false;
        }
        let within_generations = self
            .config
            .max_generations
            .is_none_or(|max| self.population.generation() < max);
        let within_samples = self
            .config
            .max_sample_nums
            .is_none_or(|max| self.total_samples() < max);
        within_generations && within_samples
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn halt_reason(&self) -> Option<String> {
        self.halted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn progress(&self, phase: SearchPhase) -> SearchProgress {
        SearchProgress {
            phase,
            generation: self.population.generation(),
            total_samples: self.total_samples(),
            best_score: self.population.best().map(|c| c.primary_score()),
        }
    }

    fn record_parameters(&self) {
        let parameters = RunParameters {
            model: self.model_name.clone(),
            task: self.task_name.clone(),
            method: "evolution".into(),
            config: self.config.clone(),
        };
        if let Err(e) = self.recorder.record_parameters(&parameters) {
            log::warn!("Failed to record run parameters: {e}");
        }
    }

    fn record_candidate(&self, candidate: &Candidate) {
        if let Err(e) = self.recorder.register_candidate(candidate) {
            log::warn!("Failed to record sample: {e}");
        }
    }

    fn record_population(&self, generation: usize) {
        if let Err(e) = self
            .recorder
            .register_population(generation, &self.population.members())
        {
            log::warn!("Failed to record generation {generation}: {e}");
        }
    }

    fn shutdown(&self) {
        self.pool.shutdown();
        if let Err(e) = self.recorder.finish() {
            log::warn!("Failed to finish run record: {e}");
        }
        self.sampler.close();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".into()
    }
}
