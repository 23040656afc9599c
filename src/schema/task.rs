//! Task description handed to the sampler.

use serde::{Deserialize, Serialize};

/// What the language model is asked to write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    /// Problem statement placed at the top of every prompt.
    pub description: String,
    /// Program skeleton the model must follow.
    pub template_program: String,
    /// Language of the generated source, e.g. "Java".
    #[serde(default = "default_language")]
    pub language: String,
    /// Noun for one generated program, e.g. "ruin operator".
    #[serde(default = "default_artifact")]
    pub artifact: String,
    /// Delimiters the model is told to use.
    #[serde(default)]
    pub reply_format: ReplyFormat,
}

fn default_language() -> String {
    "Rust".to_string()
}
fn default_artifact() -> String {
    "heuristic".to_string()
}

impl TaskContext {
    /// Create a task with default language, artifact and reply format.
    pub fn new(description: impl Into<String>, template_program: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            template_program: template_program.into(),
            language: default_language(),
            artifact: default_artifact(),
            reply_format: ReplyFormat::default(),
        }
    }

    /// Set the language label.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the artifact noun.
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = artifact.into();
        self
    }
}

/// Delimiters around the rationale and the source block of a reply.
///
/// The rationale is enclosed in `<<` and `>>`. The source block is enclosed in
/// `[[{tag}_START` and `{tag}_END]]`; tags match case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyFormat {
    /// Marker prefix of the source block.
    #[serde(default = "default_code_tag")]
    pub code_tag: String,
    /// Unwrap a markdown fence found inside the source block.
    #[serde(default = "default_strip_fences")]
    pub strip_markdown_fences: bool,
}

impl Default for ReplyFormat {
    fn default() -> Self {
        Self {
            code_tag: default_code_tag(),
            strip_markdown_fences: default_strip_fences(),
        }
    }
}

fn default_code_tag() -> String {
    "CODE".to_string()
}
fn default_strip_fences() -> bool {
    true
}

impl ReplyFormat {
    /// Opening marker of the source block.
    pub fn start_marker(&self) -> String {
        format!("[[{}_START", self.code_tag)
    }

    /// Closing marker of the source block.
    pub fn end_marker(&self) -> String {
        format!("{}_END]]", self.code_tag)
    }
}
