//! Benchmarks for population survival and parent selection.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use heurisearch::{
    compute::evolution::Population,
    schema::{Candidate, ObjectiveMode, Operator, Score},
};

fn candidates(count: usize, objective: ObjectiveMode) -> Vec<Candidate> {
    (0..count)
        .map(|i| {
            let source = format!(
                "fn heuristic(route: &[usize]) -> f64 {{ let w = {}; route.len() as f64 * w + {} }}",
                i % 13,
                i
            );
            let primary = (i * 37 % 101) as f64;
            let score = match objective {
                ObjectiveMode::Single => Score::Scalar(primary),
                ObjectiveMode::Multi { .. } => Score::Vector(vec![primary, (i * 53 % 89) as f64]),
            };
            Candidate::new(source, Operator::MutateForm).with_score(score)
        })
        .collect()
}

fn bench_survival(c: &mut Criterion) {
    let mut group = c.benchmark_group("survival");

    for (label, objective) in [
        ("single", ObjectiveMode::Single),
        ("multi", ObjectiveMode::Multi { objectives: 2 }),
    ] {
        for size in [10, 20, 40] {
            let batch = candidates(size * 4, objective);
            group.bench_with_input(
                BenchmarkId::new(label, size),
                &size,
                |b, &size| {
                    b.iter(|| {
                        let population = Population::new(size, objective, Some(1));
                        for candidate in &batch {
                            population.register(candidate.clone());
                        }
                        black_box(population.generation())
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_parents");

    for (label, objective) in [
        ("single", ObjectiveMode::Single),
        ("multi", ObjectiveMode::Multi { objectives: 2 }),
    ] {
        for size in [10, 20, 40] {
            let population = Population::new(size, objective, Some(1));
            for candidate in candidates(size * 2, objective) {
                population.register(candidate);
            }
            group.bench_with_input(BenchmarkId::new(label, size), &size, |b, _| {
                b.iter(|| black_box(population.select_parents(2)));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_survival, bench_selection);
criterion_main!(benches);
