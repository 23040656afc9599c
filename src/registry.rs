//! Task registry: string keys to evaluator factories.
//!
//! Tasks are registered explicitly at start-up. A factory receives the number
//! of workspace slots the search needs (one per evaluator worker) and returns
//! a shared [`Evaluator`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::compute::sandbox::{Evaluator, ExternalEvaluator, InProcessEvaluator, SandboxError};
use crate::schema::{SandboxConfig, Score};

type EvaluatorFactory =
    Box<dyn Fn(usize) -> Result<Arc<dyn Evaluator>, RegistryError> + Send + Sync>;

/// Registry lookup and construction errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown task '{0}'")]
    Unknown(String),
    #[error("Task '{0}' is already registered")]
    Duplicate(String),
    #[error("Failed to set up sandbox: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Map from task key to evaluator factory.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, EvaluatorFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `key`.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(usize) -> Result<Arc<dyn Evaluator>, RegistryError> + Send + Sync + 'static,
    {
        let key = key.into();
        if self.factories.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        log::debug!("Registered task '{key}'");
        self.factories.insert(key, Box::new(factory));
        Ok(())
    }

    /// Register an in-process scoring closure. All builds share one evaluator.
    pub fn register_in_process<F>(
        &mut self,
        key: impl Into<String>,
        score_fn: F,
        timeout: Option<Duration>,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&str) -> Result<Score, String> + Send + Sync + 'static,
    {
        let mut evaluator = InProcessEvaluator::new(score_fn);
        if let Some(timeout) = timeout {
            evaluator = evaluator.with_timeout(timeout);
        }
        let evaluator: Arc<dyn Evaluator> = Arc::new(evaluator);
        self.register(key, move |_slots| Ok(Arc::clone(&evaluator)))
    }

    /// Register an external-process sandbox. Each build provisions fresh slots.
    pub fn register_external(
        &mut self,
        key: impl Into<String>,
        config: SandboxConfig,
    ) -> Result<(), RegistryError> {
        config.validate().map_err(SandboxError::from)?;
        self.register(key, move |slots| {
            let evaluator = ExternalEvaluator::new(config.clone(), slots)?;
            Ok(Arc::new(evaluator) as Arc<dyn Evaluator>)
        })
    }

    /// Build the evaluator registered under `key` with `slots` workspace slots.
    pub fn build(&self, key: &str, slots: usize) -> Result<Arc<dyn Evaluator>, RegistryError> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| RegistryError::Unknown(key.to_string()))?;
        factory(slots)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse_value(source: &str) -> Result<Score, String> {
        source
            .trim()
            .parse::<f64>()
            .map(Score::Scalar)
            .map_err(|e| e.to_string())
    }

    #[test]
    fn test_build_registered_task() {
        let mut registry = TaskRegistry::new();
        registry.register_in_process("constant", parse_value, None).unwrap();

        let evaluator = registry.build("constant", 2).unwrap();
        assert_eq!(evaluator.evaluate("3.5", 0).score(), Some(&Score::Scalar(3.5)));
        assert!(evaluator.slot_capacity().is_none());
    }

    #[test]
    fn test_unknown_and_duplicate_keys() {
        let mut registry = TaskRegistry::new();
        registry.register_in_process("a", parse_value, None).unwrap();

        assert!(matches!(
            registry.register_in_process("a", parse_value, None),
            Err(RegistryError::Duplicate(key)) if key == "a"
        ));
        assert!(matches!(
            registry.build("b", 1),
            Err(RegistryError::Unknown(key)) if key == "b"
        ));
    }

    #[test]
    fn test_keys_sorted() {
        let mut registry = TaskRegistry::new();
        for key in ["tsp", "bin-packing", "cvrp"] {
            registry.register_in_process(key, parse_value, None).unwrap();
        }
        assert_eq!(registry.keys(), vec!["bin-packing", "cvrp", "tsp"]);
        assert!(registry.contains("cvrp"));
    }

    #[test]
    fn test_external_task_provisions_slots() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("project");
        fs::create_dir_all(template.join("src")).unwrap();
        fs::create_dir_all(template.join("instances")).unwrap();
        fs::write(template.join("src/solver.sh"), "echo 'cost;1'\n").unwrap();

        let config: SandboxConfig = serde_json::from_value(serde_json::json!({
            "template_dir": template,
            "workspace_root": dir.path().join("slots"),
            "target_file": "src/solver.sh",
            "source_extension": "sh",
            "compile": { "program": "sh", "args": ["-n", "{target}"] },
            "instances_dir": "instances",
            "instance_extension": "inst",
            "run": { "program": "sh", "args": ["{workspace}/src/solver.sh"] }
        }))
        .unwrap();

        let mut registry = TaskRegistry::new();
        registry.register_external("shell", config).unwrap();
        let evaluator = registry.build("shell", 3).unwrap();

        assert_eq!(evaluator.slot_capacity(), Some(3));
        assert!(dir.path().join("slots/project_2/src/solver.sh").is_file());
    }
}
