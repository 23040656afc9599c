//! End-to-end search with a scripted language model.
//!
//! The "model" proposes two coefficients, perturbing a parent's coefficients
//! when the prompt contains one. The evaluator rewards coefficients close to
//! (3, -1). Run with `RUST_LOG=info` to watch the generations.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use heurisearch::{
    EvolutionEngine, SearchConfig, TaskContext,
    compute::evolution::{JsonRecorder, load_population},
    compute::sampler::{LanguageModel, LanguageModelError, Message},
    compute::sandbox::InProcessEvaluator,
    schema::Score,
};

static COEFFICIENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(-?\d+\.\d+) (-?\d+\.\d+)$").expect("constant regex")
});

struct Perturbing {
    rng: Mutex<StdRng>,
}

impl LanguageModel for Perturbing {
    fn draw(&self, messages: &[Message]) -> Result<String, LanguageModelError> {
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| LanguageModelError::Request("rng poisoned".into()))?;

        let (a, b) = match COEFFICIENTS.captures(prompt) {
            Some(caps) => {
                let a: f64 = caps[1].parse().unwrap_or(0.0);
                let b: f64 = caps[2].parse().unwrap_or(0.0);
                (a + rng.gen_range(-0.5..0.5), b + rng.gen_range(-0.5..0.5))
            }
            None => (rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0)),
        };
        Ok(format!(
            "<<shift coefficients to {a:.3} and {b:.3}>>\n[[CODE_START\n{a:.3} {b:.3}\nCODE_END]]"
        ))
    }
}

fn score(source: &str) -> Result<Score, String> {
    let values: Vec<f64> = source
        .split_whitespace()
        .map(|t| t.parse::<f64>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    match values.as_slice() {
        [a, b] => Ok(Score::Scalar(-((a - 3.0).powi(2) + (b + 1.0).powi(2)))),
        _ => Err(format!("expected two coefficients, got {}", values.len())),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("=== Heuristic Search Demo ===\n");

    let log_dir = std::env::temp_dir().join("heurisearch-demo");
    let task = TaskContext::new(
        "Choose two coefficients a and b. Reply with them on one line separated by a space.",
        "<a> <b>",
    )
    .with_artifact("coefficient pair");

    for num_samplers in [1, 4] {
        let config = SearchConfig {
            max_generations: None,
            max_sample_nums: Some(200),
            num_samplers,
            num_evaluators: num_samplers,
            reply_backoff_ms: 0,
            random_seed: Some(42),
            ..Default::default()
        };
        let model = Arc::new(Perturbing {
            rng: Mutex::new(StdRng::seed_from_u64(42)),
        });
        if log_dir.exists() {
            std::fs::remove_dir_all(&log_dir)?;
        }
        let recorder = Arc::new(JsonRecorder::new(&log_dir)?);

        let start = Instant::now();
        let mut engine = EvolutionEngine::new(
            config,
            model,
            task.clone(),
            Arc::new(InProcessEvaluator::new(score)),
        )?
        .with_recorder(recorder)
        .with_labels("scripted", "coefficients");
        let result = engine.run_with_callback(|progress| {
            println!(
                "  generation {:>3}: {:>4} samples, best {:?}",
                progress.generation, progress.total_samples, progress.best_score
            );
        })?;
        let elapsed = start.elapsed();

        println!("Samplers: {}", num_samplers);
        println!("  Stop reason:  {:?}", result.stats.stop_reason);
        println!("  Generations:  {}", result.stats.generations);
        println!("  Samples:      {}", result.stats.total_samples);
        println!("  Elapsed:      {:.2}s", elapsed.as_secs_f64());
        if let Some(best) = &result.best {
            println!("  Best:         {} ({})", best.source_text, best.primary_score());
        }
        println!();
    }

    let resumed = load_population(&log_dir)?;
    println!(
        "Resuming at generation {} with {} members after {} samples",
        resumed.generation,
        resumed.members.len(),
        resumed.total_samples
    );
    let recorder = Arc::new(JsonRecorder::new(&log_dir)?.resuming_from(resumed.total_samples)?);
    let config = SearchConfig {
        max_generations: None,
        max_sample_nums: Some(resumed.total_samples + 50),
        reply_backoff_ms: 0,
        random_seed: Some(7),
        ..Default::default()
    };
    let model = Arc::new(Perturbing {
        rng: Mutex::new(StdRng::seed_from_u64(7)),
    });
    let mut engine = EvolutionEngine::new(
        config,
        model,
        task,
        Arc::new(InProcessEvaluator::new(score)),
    )?
    .with_recorder(recorder.clone())
    .with_resume(resumed)
    .with_labels("scripted", "coefficients");
    let result = engine.run()?;
    println!("  Samples:      {}", result.stats.total_samples);
    println!("  Log dir:      {}", recorder.log_dir().display());
    Ok(())
}
