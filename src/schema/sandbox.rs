//! Configuration for the external-process evaluator.
//!
//! A sandbox is a template project directory cloned once per evaluator slot.
//! Each evaluation overwrites one target file inside the slot, compiles the
//! project, and runs it once per benchmark instance.
//!
//! Command templates accept these placeholders:
//!
//! | Placeholder | Value |
//! |---|---|
//! | `{workspace}` | Absolute path of the slot directory |
//! | `{target}` | Absolute path of the overwritten target file |
//! | `{source_dir}` | Absolute path of the source tree |
//! | `{sources_file}` | File listing every collected source, one per line |
//! | `{build_dir}` | Absolute path of the build output directory |
//! | `{instance}` | Absolute path of the instance file (run only) |
//! | `{limit}` | Per-instance time limit in seconds (run only) |

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// External evaluator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Template project cloned into every slot.
    pub template_dir: PathBuf,
    /// Where slot copies are created. Defaults to the template's parent.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// File overwritten with candidate source, relative to the slot.
    pub target_file: PathBuf,
    /// Source tree collected for compilation, relative to the slot.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    /// Extension of source files to collect.
    pub source_extension: String,
    /// Build output directory, relative to the slot.
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    /// Compiler invocation.
    pub compile: CommandTemplate,
    /// Timeout for the compiler, in seconds.
    #[serde(default = "default_compile_timeout")]
    pub compile_timeout_secs: u64,
    /// Instance directory, relative to the slot.
    pub instances_dir: PathBuf,
    /// Extension of instance files.
    pub instance_extension: String,
    /// Per-instance run invocation.
    pub run: CommandTemplate,
    /// How per-instance time limits are derived.
    #[serde(default)]
    pub time_limit: TimeLimitPolicy,
    /// Seconds added to an instance limit for the supervisory timeout.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    /// Seconds to wait for buffered output after killing a process.
    #[serde(default = "default_post_mortem")]
    pub post_mortem_secs: u64,
    /// Instances run concurrently within one evaluation (1 = serial).
    #[serde(default = "default_max_parallel_instances")]
    pub max_parallel_instances: usize,
    /// Separator preceding the score on a result line.
    #[serde(default = "default_score_separator")]
    pub score_separator: String,
    /// Log full process output.
    #[serde(default)]
    pub dump_output: bool,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("src")
}
fn default_build_dir() -> PathBuf {
    PathBuf::from("bin")
}
fn default_compile_timeout() -> u64 {
    600
}
fn default_safety_margin() -> u64 {
    120
}
fn default_post_mortem() -> u64 {
    5
}
fn default_max_parallel_instances() -> usize {
    4
}
fn default_score_separator() -> String {
    ";".to_string()
}

impl SandboxConfig {
    /// Directory that receives the slot copies.
    pub fn resolved_workspace_root(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(|| {
            self.template_dir
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    /// Compiler timeout.
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    /// Output salvage window after a kill.
    pub fn post_mortem(&self) -> Duration {
        Duration::from_secs(self.post_mortem_secs)
    }

    /// Conservative wall-clock estimate for one full evaluation.
    ///
    /// `supervisory` holds the supervisory timeout of each instance.
    pub fn estimated_evaluation_budget(&self, supervisory: &[Duration]) -> Duration {
        if supervisory.is_empty() {
            return Duration::from_secs(
                self.time_limit
                    .default_secs
                    .saturating_add(self.compile_timeout_secs),
            );
        }
        let total: f64 = supervisory.iter().map(Duration::as_secs_f64).sum();
        let longest = supervisory
            .iter()
            .map(Duration::as_secs_f64)
            .fold(0.0f64, f64::max);
        let parallel = self.max_parallel_instances.max(1) as f64;
        let robust = total / parallel + longest;
        Duration::try_from_secs_f64(robust * 1.1 + 60.0).unwrap_or(Duration::MAX)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compile.program.is_empty() || self.run.program.is_empty() {
            return Err(ConfigError::Sandbox("command program is empty".into()));
        }
        if self.score_separator.is_empty() {
            return Err(ConfigError::Sandbox("score separator is empty".into()));
        }
        if self.target_file.is_absolute() {
            return Err(ConfigError::Sandbox(
                "target file must be relative to the workspace".into(),
            ));
        }
        if self.time_limit.size_unit == 0 {
            return Err(ConfigError::Sandbox("time-limit size unit is zero".into()));
        }
        Ok(())
    }
}

/// A program plus arguments, with `{placeholder}` substitution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTemplate {
    /// Executable.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    /// Create a template.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Substitute placeholders in program and arguments.
    pub fn render(&self, vars: &[(&str, &str)]) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| {
                let mut rendered = part.clone();
                for (key, value) in vars {
                    rendered = rendered.replace(&format!("{{{key}}}"), value);
                }
                rendered
            })
            .collect()
    }
}

/// Derivation of per-instance time limits from the instance file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeLimitPolicy {
    /// Lower bound, also used when no size is found in the name.
    #[serde(default = "default_limit")]
    pub default_secs: u64,
    /// Regex whose first capture group is the instance size.
    #[serde(default = "default_size_pattern")]
    pub size_pattern: String,
    /// Size granularity.
    #[serde(default = "default_size_unit")]
    pub size_unit: u64,
    /// Seconds granted per whole size unit.
    #[serde(default = "default_secs_per_unit")]
    pub secs_per_unit: u64,
    /// Fixed limit for every instance, for smoke tests.
    #[serde(default)]
    pub fixed_secs: Option<u64>,
}

impl Default for TimeLimitPolicy {
    fn default() -> Self {
        Self {
            default_secs: default_limit(),
            size_pattern: default_size_pattern(),
            size_unit: default_size_unit(),
            secs_per_unit: default_secs_per_unit(),
            fixed_secs: None,
        }
    }
}

fn default_limit() -> u64 {
    10
}
fn default_size_pattern() -> String {
    r"n(\d+)".to_string()
}
fn default_size_unit() -> u64 {
    25
}
fn default_secs_per_unit() -> u64 {
    60
}

impl TimeLimitPolicy {
    /// Limit for an instance of the given size, saturating at `u64::MAX`.
    pub fn limit_for_size(&self, size: Option<u64>) -> u64 {
        if let Some(fixed) = self.fixed_secs {
            return fixed;
        }
        let scaled = size
            .map(|s| (s / self.size_unit.max(1)).saturating_mul(self.secs_per_unit))
            .unwrap_or(0);
        scaled.max(self.default_secs)
    }
}
