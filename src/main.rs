//! heurisearch CLI - Evaluate one candidate against an external sandbox.

use std::fs;
use std::path::PathBuf;

use heurisearch::{
    compute::sandbox::{Evaluator, ExternalEvaluator, slot_path},
    schema::{CommandTemplate, SandboxConfig, TimeLimitPolicy},
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && args[1] == "--example" {
        print_example_config();
        return;
    }

    if args.len() < 3 {
        eprintln!("Usage: {} <sandbox.json> <candidate-file> [slot]", args[0]);
        eprintln!();
        eprintln!("Compile and run one candidate in an external sandbox.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  sandbox.json    Path to sandbox configuration file");
        eprintln!("  candidate-file  Source text written over the sandbox target file");
        eprintln!("  slot            Workspace slot to use (default: 0)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);
    let candidate_path = PathBuf::from(&args[2]);
    let slot: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading sandbox file: {}", e);
        std::process::exit(1);
    });

    let config: SandboxConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing sandbox config: {}", e);
        std::process::exit(1);
    });

    let source = fs::read_to_string(&candidate_path).unwrap_or_else(|e| {
        eprintln!("Error reading candidate file: {}", e);
        std::process::exit(1);
    });

    println!("heurisearch sandbox evaluation");
    println!("==============================");
    println!("Template: {}", config.template_dir.display());
    println!("Target: {}", config.target_file.display());
    println!("Slot: {}", slot);
    println!();

    // Slots left by an earlier run are reused as they are.
    let root = config.resolved_workspace_root();
    let provisioned = (0..=slot).all(|i| slot_path(&config.template_dir, &root, i).is_dir());
    let evaluator = if provisioned {
        ExternalEvaluator::attach(config, slot + 1)
    } else {
        ExternalEvaluator::new(config, slot + 1)
    }
    .unwrap_or_else(|e| {
        eprintln!("Error preparing sandbox: {}", e);
        std::process::exit(1);
    });
    println!(
        "Slots: {} ({})",
        evaluator.slot_count(),
        if provisioned { "reused" } else { "provisioned" }
    );

    match evaluator.instance_commands(slot) {
        Ok(commands) => println!("Instances: {}", commands.len()),
        Err(e) => {
            eprintln!("Error enumerating instances: {}", e);
            std::process::exit(1);
        }
    }

    let evaluation = evaluator.evaluate(&source, slot);

    println!("Outcome: {}", evaluation.outcome);
    println!("Time: {:.2}s", evaluation.elapsed_seconds());
    match evaluation.score() {
        Some(score) => println!("Score: {}", score),
        None => {
            println!("Score: none");
            std::process::exit(2);
        }
    }
}

fn print_example_config() {
    let config = SandboxConfig {
        template_dir: PathBuf::from("tasks/cvrp/project"),
        workspace_root: None,
        target_file: PathBuf::from("src/heuristic/Ruin.java"),
        source_dir: PathBuf::from("src"),
        source_extension: "java".into(),
        build_dir: PathBuf::from("bin"),
        compile: CommandTemplate::new(
            "javac",
            ["-d", "{build_dir}", "@{sources_file}"],
        ),
        compile_timeout_secs: 600,
        instances_dir: PathBuf::from("instances"),
        instance_extension: "vrp".into(),
        run: CommandTemplate::new(
            "java",
            ["-cp", "{build_dir}", "Main", "{instance}", "{limit}"],
        ),
        time_limit: TimeLimitPolicy::default(),
        safety_margin_secs: 120,
        post_mortem_secs: 5,
        max_parallel_instances: 4,
        score_separator: ";".into(),
        dump_output: false,
    };

    println!("Example configuration (sandbox.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing example: {}", e),
    }
}
