//! Benchmark instance enumeration and result-line parsing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;

use crate::schema::SandboxConfig;

use super::workspace::WorkspaceError;

/// A ready-to-run instance invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceCommand {
    /// Instance file name.
    pub name: String,
    /// Absolute instance path.
    pub path: PathBuf,
    /// Limit handed to the solver, in seconds.
    pub limit_secs: u64,
    /// Supervisory timeout: the solver limit plus the safety margin, saturating.
    pub supervisory: Duration,
    /// Rendered program and arguments.
    pub argv: Vec<String>,
}

/// Size encoded in an instance file name, from the first capture group.
pub fn instance_size(name: &str, pattern: &Regex) -> Option<u64> {
    pattern
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Enumerate the instances of `workspace` and compose their commands.
///
/// Instances are sorted by file name so every slot runs them in the same order.
pub fn build_instance_commands(
    config: &SandboxConfig,
    workspace: &Path,
    size_pattern: &Regex,
) -> Result<Vec<InstanceCommand>, WorkspaceError> {
    let instances_dir = workspace.join(&config.instances_dir);
    let entries = std::fs::read_dir(&instances_dir).map_err(|source| WorkspaceError::Io {
        path: instances_dir.clone(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == config.instance_extension.as_str())
        })
        .collect();
    paths.sort();

    let workspace_str = workspace.to_string_lossy();
    let build_dir = workspace.join(&config.build_dir);
    let build_dir_str = build_dir.to_string_lossy();
    let source_dir = workspace.join(&config.source_dir);
    let source_dir_str = source_dir.to_string_lossy();

    Ok(paths
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let limit_secs = config
                .time_limit
                .limit_for_size(instance_size(&name, size_pattern));
            let limit = limit_secs.to_string();
            let instance = path.to_string_lossy().into_owned();
            let argv = config.run.render(&[
                ("instance", instance.as_str()),
                ("limit", limit.as_str()),
                ("workspace", &*workspace_str),
                ("build_dir", &*build_dir_str),
                ("source_dir", &*source_dir_str),
            ]);
            InstanceCommand {
                name,
                path,
                limit_secs,
                supervisory: Duration::from_secs(
                    limit_secs.saturating_add(config.safety_margin_secs),
                ),
                argv,
            }
        })
        .collect())
}

/// Extract the score text from process output.
///
/// Lines are scanned from the last one backward. Blank lines and lines
/// without `separator` are skipped, as are lines with nothing after it. The
/// first remaining line decides: the trimmed text after its first separator.
pub fn score_token<'a>(output: &'a str, separator: &str) -> Option<&'a str> {
    output.lines().rev().find_map(|line| {
        let (_, after) = line.trim().split_once(separator)?;
        let after = after.trim();
        (!after.is_empty()).then_some(after)
    })
}

/// Parse the instance score from process output, see [`score_token`].
///
/// A deciding token that is not a number yields `None`.
pub fn parse_score_line(output: &str, separator: &str) -> Option<f64> {
    let token = score_token(output, separator)?;
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value),
        _ => {
            log::debug!("Unparseable score token {token:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CommandTemplate, TimeLimitPolicy};

    fn config() -> SandboxConfig {
        serde_json::from_value(serde_json::json!({
            "template_dir": "/unused",
            "target_file": "src/Ruin.java",
            "source_extension": "java",
            "compile": {"program": "javac"},
            "instances_dir": "instances",
            "instance_extension": "vrp",
            "run": {"program": "java", "args": ["-cp", "{build_dir}", "Main", "{instance}", "{limit}"]},
            "safety_margin_secs": 120
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_last_valid_line() {
        let out = "starting\nbest;100\nbest;95.5\nshutting down\n\n";
        assert_eq!(parse_score_line(out, ";"), Some(95.5));
    }

    #[test]
    fn test_parse_skips_empty_token() {
        let out = "final;123\nsummary;\n";
        assert_eq!(parse_score_line(out, ";"), Some(123.0));
    }

    #[test]
    fn test_parse_non_numeric_decides() {
        let out = "final;123\nstatus;done\n";
        assert_eq!(score_token(out, ";"), Some("done"));
        assert_eq!(parse_score_line(out, ";"), None);
        assert_eq!(parse_score_line("no separators here", ";"), None);
    }

    #[test]
    fn test_instance_size() {
        let pattern = Regex::new(r"n(\d+)").unwrap();
        assert_eq!(instance_size("X-n101-k25.vrp", &pattern), Some(101));
        assert_eq!(instance_size("tiny.vrp", &pattern), None);
    }

    #[test]
    fn test_build_commands() {
        let dir = tempfile::tempdir().unwrap();
        let instances = dir.path().join("instances");
        std::fs::create_dir_all(&instances).unwrap();
        for name in ["X-n150-k5.vrp", "X-n51-k3.vrp", "X-n75-k2.vrp", "notes.txt"] {
            std::fs::write(instances.join(name), "").unwrap();
        }

        let config = config();
        let pattern = Regex::new(&config.time_limit.size_pattern).unwrap();
        let commands = build_instance_commands(&config, dir.path(), &pattern).unwrap();

        let limits: Vec<u64> = commands.iter().map(|c| c.limit_secs).collect();
        assert_eq!(limits, vec![360, 120, 180]);
        let timeouts: Vec<u64> = commands.iter().map(|c| c.supervisory.as_secs()).collect();
        assert_eq!(timeouts, vec![480, 240, 300]);

        let first = &commands[0];
        assert_eq!(first.name, "X-n150-k5.vrp");
        assert_eq!(first.argv[0], "java");
        assert_eq!(first.argv[2], dir.path().join("bin").to_string_lossy());
        assert_eq!(first.argv[5], "360");
    }

    #[test]
    fn test_fixed_limit_overrides_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("instances")).unwrap();
        std::fs::write(dir.path().join("instances/X-n1000.vrp"), "").unwrap();

        let mut config = config();
        config.time_limit = TimeLimitPolicy {
            fixed_secs: Some(15),
            ..Default::default()
        };
        config.run = CommandTemplate::new("solver", ["{limit}"]);
        let pattern = Regex::new(&config.time_limit.size_pattern).unwrap();
        let commands = build_instance_commands(&config, dir.path(), &pattern).unwrap();
        assert_eq!(commands[0].argv, vec!["solver", "15"]);
    }

    #[test]
    fn test_huge_instance_size_saturates() {
        let dir = tempfile::tempdir().unwrap();
        let instances = dir.path().join("instances");
        std::fs::create_dir_all(&instances).unwrap();
        std::fs::write(instances.join("X-n9999999999999999999.vrp"), "").unwrap();
        std::fs::write(instances.join("Y-n99999999999999999999.vrp"), "").unwrap();

        let config = config();
        let pattern = Regex::new(&config.time_limit.size_pattern).unwrap();
        let commands = build_instance_commands(&config, dir.path(), &pattern).unwrap();

        // Fits in u64 but the scaled limit does not.
        assert_eq!(commands[0].limit_secs, u64::MAX);
        assert_eq!(commands[0].supervisory, Duration::from_secs(u64::MAX));
        assert_eq!(commands[0].argv[5], u64::MAX.to_string());
        // Too large to parse at all, so the default limit applies.
        assert_eq!(commands[1].limit_secs, 10);
        assert_eq!(commands[1].supervisory, Duration::from_secs(130));
    }
}
