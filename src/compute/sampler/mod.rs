//! Candidate sampling through a language model.
//!
//! The [`Sampler`] turns an operator and its parents into a prompt, asks the
//! [`LanguageModel`] collaborator for a reply, and parses the reply into a new
//! unscored [`Candidate`]. Malformed replies are retried a bounded number of
//! times, after which the step yields nothing.

mod prompt;
mod reply;

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::schema::{Candidate, Operator, TaskContext};

pub use prompt::build_prompt;
pub use reply::{ParsedReply, ReplyParser};

/// Author of a prompt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One prompt message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Failure reported by a language-model collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LanguageModelError {
    #[error("Language model request failed: {0}")]
    Request(String),
    #[error("Language model connection closed")]
    Closed,
}

/// Text-in, text-out language-model collaborator.
///
/// `draw` blocks until a reply is available. Transport retries belong to the
/// implementation; the sampler only retries unusable replies.
pub trait LanguageModel: Send + Sync {
    /// Request one reply.
    fn draw(&self, messages: &[Message]) -> Result<String, LanguageModelError>;

    /// Release any connection held by the collaborator.
    fn close(&self) {}
}

/// Builds prompts, calls the model and parses replies.
pub struct Sampler {
    model: Arc<dyn LanguageModel>,
    parser: ReplyParser,
    task: TaskContext,
    max_attempts: usize,
}

impl Sampler {
    /// Create a sampler that tries each step at most `max_attempts` times.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        task: TaskContext,
        max_attempts: usize,
    ) -> Result<Self, regex::Error> {
        let parser = ReplyParser::new(&task.reply_format)?;
        Ok(Self {
            model,
            parser,
            task,
            max_attempts: max_attempts.max(1),
        })
    }

    /// Propose a new candidate for `operator` from `parents`.
    ///
    /// Returns `None` when every attempt failed to reach the model or produced a
    /// reply without both a rationale and a source block. The candidate's
    /// sample time covers all attempts.
    pub fn propose(&self, operator: Operator, parents: &[Candidate]) -> Option<Candidate> {
        let messages = build_prompt(operator, parents, &self.task);
        let start = Instant::now();

        for attempt in 1..=self.max_attempts {
            let reply = match self.model.draw(&messages) {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("{operator}: attempt {attempt}/{}: {e}", self.max_attempts);
                    continue;
                }
            };
            match self.parser.parse(&reply) {
                Some(parsed) => {
                    let mut candidate =
                        Candidate::new(parsed.source, operator).with_rationale(parsed.rationale);
                    candidate.sample_time_seconds = start.elapsed().as_secs_f64();
                    return Some(candidate);
                }
                None => log::debug!(
                    "{operator}: attempt {attempt}/{}: reply lacks rationale or source block",
                    self.max_attempts
                ),
            }
        }

        log::warn!(
            "{operator}: no usable reply after {} attempts",
            self.max_attempts
        );
        None
    }

    /// Release the model connection.
    pub fn close(&self) {
        self.model.close();
    }
}
