//! Evaluator that compiles and runs candidates as external processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rayon::prelude::*;
use regex::Regex;

use crate::schema::{ConfigError, SandboxConfig, Score};

use super::instances::{InstanceCommand, build_instance_commands, parse_score_line};
use super::process::{ProcessOutput, ProcessRunner, ProcessStatus};
use super::workspace::{WorkspaceError, collect_sources, provision_slots, slot_path};
use super::{EvalOutcome, Evaluation, Evaluator};

const SOURCES_FILE: &str = "sources.txt";

/// Errors raised while constructing an [`ExternalEvaluator`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("Invalid instance size pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("Failed to start process runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum InstanceResult {
    Scored(f64),
    Crashed,
    TimedOut,
    Unparsed,
}

/// Compiles each candidate inside its slot workspace and runs it on every
/// benchmark instance.
///
/// The reported score is the negated mean of the per-instance results, and
/// only when every instance reported one.
pub struct ExternalEvaluator {
    config: SandboxConfig,
    slots: Vec<PathBuf>,
    size_pattern: Regex,
    commands: Vec<Mutex<Option<Arc<Vec<InstanceCommand>>>>>,
    runner: ProcessRunner,
}

impl ExternalEvaluator {
    /// Validate `config` and clone its template into `slots` fresh workspaces.
    pub fn new(config: SandboxConfig, slots: usize) -> Result<Self, SandboxError> {
        config.validate()?;
        let root = config.resolved_workspace_root();
        let slots = provision_slots(&config.template_dir, &root, slots)?;
        Self::with_slots(config, slots)
    }

    /// Use already provisioned slot directories.
    pub fn with_slots(config: SandboxConfig, slots: Vec<PathBuf>) -> Result<Self, SandboxError> {
        config.validate()?;
        let size_pattern = Regex::new(&config.time_limit.size_pattern)?;
        let commands = slots.iter().map(|_| Mutex::new(None)).collect();
        Ok(Self {
            config,
            slots,
            size_pattern,
            commands,
            runner: ProcessRunner::new()?,
        })
    }

    /// Reuse existing `<template>_<i>` directories without re-cloning.
    pub fn attach(config: SandboxConfig, slots: usize) -> Result<Self, SandboxError> {
        let root = config.resolved_workspace_root();
        let paths = (0..slots)
            .map(|i| slot_path(&config.template_dir, &root, i))
            .collect();
        Self::with_slots(config, paths)
    }

    /// Number of workspace slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Instance commands for `slot`, built on first use and cached.
    pub fn instance_commands(
        &self,
        slot: usize,
    ) -> Result<Arc<Vec<InstanceCommand>>, WorkspaceError> {
        let (Some(cache), Some(workspace)) = (self.commands.get(slot), self.slots.get(slot)) else {
            return Err(WorkspaceError::MissingSlot(slot));
        };
        let mut cached = cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(commands) = cached.as_ref() {
            return Ok(Arc::clone(commands));
        }

        let commands = Arc::new(build_instance_commands(
            &self.config,
            workspace,
            &self.size_pattern,
        )?);
        log::info!(
            "Slot {slot}: built {} instance commands, estimated evaluation budget {:?}",
            commands.len(),
            self.config.estimated_evaluation_budget(
                &commands.iter().map(|c| c.supervisory).collect::<Vec<_>>()
            )
        );
        *cached = Some(Arc::clone(&commands));
        Ok(commands)
    }

    fn dump(&self, label: &str, output: &ProcessOutput) {
        if self.config.dump_output {
            log::info!("{label} stdout:\n{}", output.stdout);
            if !output.stderr.is_empty() {
                log::info!("{label} stderr:\n{}", output.stderr);
            }
        }
    }

    fn materialize(&self, workspace: &Path, source: &str) -> Result<PathBuf, String> {
        let target = workspace.join(&self.config.target_file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("{}: {e}", parent.display()))?;
        }
        fs::write(&target, source).map_err(|e| format!("{}: {e}", target.display()))?;

        let source_dir = workspace.join(&self.config.source_dir);
        let sources = collect_sources(&source_dir, &self.config.source_extension)
            .map_err(|e| e.to_string())?;
        if sources.is_empty() {
            return Err(format!("no sources found in {}", source_dir.display()));
        }
        let listing: Vec<String> = sources
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let sources_file = workspace.join(SOURCES_FILE);
        fs::write(&sources_file, listing.join("\n"))
            .map_err(|e| format!("{}: {e}", sources_file.display()))?;

        let build_dir = workspace.join(&self.config.build_dir);
        fs::create_dir_all(&build_dir).map_err(|e| format!("{}: {e}", build_dir.display()))?;
        Ok(target)
    }

    fn compile(&self, slot: usize, workspace: &Path, target: &Path) -> Option<EvalOutcome> {
        let workspace_str = workspace.to_string_lossy();
        let target_str = target.to_string_lossy();
        let source_dir = workspace.join(&self.config.source_dir);
        let source_dir_str = source_dir.to_string_lossy();
        let sources_file = workspace.join(SOURCES_FILE);
        let sources_file_str = sources_file.to_string_lossy();
        let build_dir = workspace.join(&self.config.build_dir);
        let build_dir_str = build_dir.to_string_lossy();

        let argv = self.config.compile.render(&[
            ("workspace", &*workspace_str),
            ("target", &*target_str),
            ("source_dir", &*source_dir_str),
            ("sources_file", &*sources_file_str),
            ("build_dir", &*build_dir_str),
        ]);
        log::debug!("Slot {slot}: compiling with {}", argv.join(" "));

        let output = self.runner.run(
            &argv,
            workspace,
            self.config.compile_timeout(),
            self.config.post_mortem(),
        );
        self.dump(&format!("Slot {slot} compiler"), &output);
        match output.status {
            ProcessStatus::Exited(0) => None,
            ProcessStatus::SpawnFailed(reason) => Some(EvalOutcome::SetupFailed(reason)),
            status => {
                log::warn!("Slot {slot}: compilation failed ({status:?})");
                if !self.config.dump_output {
                    log::debug!("Slot {slot} compiler stderr:\n{}", output.stderr);
                }
                Some(EvalOutcome::CompileFailed)
            }
        }
    }

    fn run_instance(&self, slot: usize, workspace: &Path, command: &InstanceCommand) -> InstanceResult {
        let output = self.runner.run(
            &command.argv,
            workspace,
            command.supervisory,
            self.config.post_mortem(),
        );
        self.dump(&format!("Slot {slot} instance {}", command.name), &output);
        let score = parse_score_line(&output.stdout, &self.config.score_separator);

        match (&output.status, score) {
            (ProcessStatus::Exited(0), Some(value)) => InstanceResult::Scored(value),
            (ProcessStatus::Exited(0), None) => {
                log::warn!("Slot {slot}: {} produced no score line", command.name);
                InstanceResult::Unparsed
            }
            (ProcessStatus::TimedOut, Some(value)) => {
                log::info!(
                    "Slot {slot}: {} timed out after {:?}, salvaged score {value}",
                    command.name,
                    command.supervisory
                );
                InstanceResult::Scored(value)
            }
            (ProcessStatus::TimedOut, None) => {
                log::warn!(
                    "Slot {slot}: {} timed out after {:?} with no score",
                    command.name,
                    command.supervisory
                );
                InstanceResult::TimedOut
            }
            (status, _) => {
                log::warn!("Slot {slot}: {} crashed ({status:?})", command.name);
                InstanceResult::Crashed
            }
        }
    }

    fn run_instances(
        &self,
        slot: usize,
        workspace: &Path,
        commands: &[InstanceCommand],
    ) -> Vec<InstanceResult> {
        let parallel = self.config.max_parallel_instances.min(commands.len());
        if parallel <= 1 {
            return commands
                .iter()
                .map(|c| self.run_instance(slot, workspace, c))
                .collect();
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(parallel)
            .thread_name(move |i| format!("slot{slot}-instance-{i}"))
            .build()
        {
            Ok(pool) => pool.install(|| {
                commands
                    .par_iter()
                    .map(|c| self.run_instance(slot, workspace, c))
                    .collect()
            }),
            Err(e) => {
                log::warn!("Slot {slot}: instance pool unavailable ({e}), running serially");
                commands
                    .iter()
                    .map(|c| self.run_instance(slot, workspace, c))
                    .collect()
            }
        }
    }

    fn aggregate(slot: usize, results: &[InstanceResult]) -> EvalOutcome {
        let scores: Vec<f64> = results
            .iter()
            .filter_map(|r| match r {
                InstanceResult::Scored(v) => Some(*v),
                _ => None,
            })
            .collect();
        let expected = results.len();

        if scores.len() == expected {
            let mean = scores.iter().sum::<f64>() / expected as f64;
            return EvalOutcome::Scored(Score::Scalar(-mean));
        }

        log::warn!(
            "Slot {slot}: {} of {expected} instances scored, discarding evaluation",
            scores.len()
        );
        if scores.is_empty() && results.iter().all(|r| *r == InstanceResult::Crashed) {
            EvalOutcome::Crashed
        } else if scores.is_empty() && results.iter().all(|r| *r == InstanceResult::TimedOut) {
            EvalOutcome::TimedOut
        } else {
            EvalOutcome::Incomplete {
                expected,
                parsed: scores.len(),
            }
        }
    }

    fn evaluate_in_slot(&self, slot: usize, source: &str) -> EvalOutcome {
        let Some(workspace) = self.slots.get(slot) else {
            return EvalOutcome::SetupFailed(format!("slot {slot} does not exist"));
        };

        let target = match self.materialize(workspace, source) {
            Ok(target) => target,
            Err(reason) => {
                log::error!("Slot {slot}: {reason}");
                return EvalOutcome::SetupFailed(reason);
            }
        };

        if let Some(failure) = self.compile(slot, workspace, &target) {
            return failure;
        }

        let commands = match self.instance_commands(slot) {
            Ok(commands) if commands.is_empty() => {
                return EvalOutcome::SetupFailed(format!(
                    "no .{} instances in {}",
                    self.config.instance_extension,
                    self.config.instances_dir.display()
                ));
            }
            Ok(commands) => commands,
            Err(e) => return EvalOutcome::SetupFailed(e.to_string()),
        };

        let results = self.run_instances(slot, workspace, &commands);
        Self::aggregate(slot, &results)
    }
}

impl Evaluator for ExternalEvaluator {
    fn evaluate(&self, source: &str, slot: usize) -> Evaluation {
        let start = Instant::now();
        let outcome = self.evaluate_in_slot(slot, source);
        log::debug!("Slot {slot}: {outcome} in {:?}", start.elapsed());
        Evaluation::new(outcome, start.elapsed())
    }

    fn slot_capacity(&self) -> Option<usize> {
        Some(self.slots.len())
    }
}
