//! Candidate evaluation.
//!
//! An [`Evaluator`] turns candidate source text into an [`Evaluation`]. Every
//! failure is a value: compile errors, crashes, timeouts and panics come back
//! as [`EvalOutcome`] variants with no score, never as `Err`.
//!
//! Two evaluators are provided:
//!
//! - [`InProcessEvaluator`] calls a scoring closure directly, optionally on a
//!   watchdog thread with a timeout.
//! - [`ExternalEvaluator`] materializes the source into a per-slot workspace,
//!   compiles it and runs it against benchmark instance files.

mod external;
mod instances;
mod process;
mod workspace;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::schema::Score;

pub use external::{ExternalEvaluator, SandboxError};
pub use instances::{InstanceCommand, build_instance_commands, parse_score_line};
pub use process::{ProcessOutput, ProcessRunner, ProcessStatus};
pub use workspace::{WorkspaceError, collect_sources, provision_slots, slot_path};

/// Why an evaluation produced (or did not produce) a score.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// Evaluation succeeded.
    Scored(Score),
    /// The compiler rejected the candidate.
    CompileFailed,
    /// An instance exited with a non-zero status.
    Crashed,
    /// The evaluation ran out of time with nothing salvageable.
    TimedOut,
    /// Fewer instances produced a score than were run.
    Incomplete {
        /// Instances run.
        expected: usize,
        /// Instances that reported a score.
        parsed: usize,
    },
    /// The scoring function returned an error.
    Failed(String),
    /// The workspace or instance set could not be prepared.
    SetupFailed(String),
    /// The evaluator panicked.
    Panicked,
    /// The pool shut down before the evaluation started.
    Cancelled,
}

impl fmt::Display for EvalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scored(score) => write!(f, "scored {score}"),
            Self::CompileFailed => f.write_str("compile failed"),
            Self::Crashed => f.write_str("crashed"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Incomplete { expected, parsed } => {
                write!(f, "incomplete ({parsed} of {expected} instances scored)")
            }
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::SetupFailed(reason) => write!(f, "setup failed: {reason}"),
            Self::Panicked => f.write_str("panicked"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Outcome of one evaluation plus its wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// What happened.
    pub outcome: EvalOutcome,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

impl Evaluation {
    /// Create an evaluation.
    pub fn new(outcome: EvalOutcome, elapsed: Duration) -> Self {
        Self { outcome, elapsed }
    }

    /// Evaluation that never started.
    pub fn cancelled() -> Self {
        Self::new(EvalOutcome::Cancelled, Duration::ZERO)
    }

    /// Score, if the evaluation succeeded.
    pub fn score(&self) -> Option<&Score> {
        match &self.outcome {
            EvalOutcome::Scored(score) => Some(score),
            _ => None,
        }
    }

    /// Consume into the score, if any.
    pub fn into_score(self) -> Option<Score> {
        match self.outcome {
            EvalOutcome::Scored(score) => Some(score),
            _ => None,
        }
    }

    /// Elapsed time in seconds.
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Scores candidate source text.
///
/// `slot` identifies the exclusive workspace the caller leased for this call;
/// implementations without workspaces ignore it.
pub trait Evaluator: Send + Sync {
    /// Evaluate one candidate. Never panics across this boundary in the
    /// provided implementations; callers still guard against panics.
    fn evaluate(&self, source: &str, slot: usize) -> Evaluation;

    /// Number of distinct slots the evaluator can serve, if limited.
    fn slot_capacity(&self) -> Option<usize> {
        None
    }
}

type ScoreFn = dyn Fn(&str) -> Result<Score, String> + Send + Sync;

/// Evaluator backed by an in-process scoring closure.
pub struct InProcessEvaluator {
    score_fn: Arc<ScoreFn>,
    timeout: Option<Duration>,
}

impl InProcessEvaluator {
    /// Wrap a scoring closure. Errors become [`EvalOutcome::Failed`].
    pub fn new<F>(score_fn: F) -> Self
    where
        F: Fn(&str) -> Result<Score, String> + Send + Sync + 'static,
    {
        Self {
            score_fn: Arc::new(score_fn),
            timeout: None,
        }
    }

    /// Run each evaluation on a watchdog thread and give up after `timeout`.
    ///
    /// A timed-out closure keeps running detached until it returns.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn call(score_fn: &ScoreFn, source: &str) -> EvalOutcome {
        match catch_unwind(AssertUnwindSafe(|| score_fn(source))) {
            Ok(Ok(score)) => EvalOutcome::Scored(score),
            Ok(Err(reason)) => EvalOutcome::Failed(reason),
            Err(_) => EvalOutcome::Panicked,
        }
    }
}

impl Evaluator for InProcessEvaluator {
    fn evaluate(&self, source: &str, _slot: usize) -> Evaluation {
        let start = Instant::now();
        let Some(timeout) = self.timeout else {
            return Evaluation::new(Self::call(&*self.score_fn, source), start.elapsed());
        };

        let (tx, rx) = mpsc::channel();
        let score_fn = Arc::clone(&self.score_fn);
        let source = source.to_string();
        let spawned = std::thread::Builder::new()
            .name("score-watchdog".into())
            .spawn(move || {
                let _ = tx.send(Self::call(&*score_fn, &source));
            });
        if let Err(e) = spawned {
            return Evaluation::new(
                EvalOutcome::SetupFailed(format!("cannot spawn scoring thread: {e}")),
                start.elapsed(),
            );
        }

        let outcome = match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("In-process evaluation exceeded {timeout:?}");
                EvalOutcome::TimedOut
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => EvalOutcome::Panicked,
        };
        Evaluation::new(outcome, start.elapsed())
    }
}
