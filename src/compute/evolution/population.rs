//! Generation-indexed, thread-safe candidate store.
//!
//! Every mutation goes through one mutex. Registrations fill a pending buffer;
//! when the buffer reaches the target size the registering thread runs a
//! survival pass before returning.
//!
//! Two policies exist, picked from [`ObjectiveMode`]:
//!
//! - **Single objective**: merge current and pending, sort by score, drop
//!   repeated sources, keep the best `target_size`. Parents are drawn with
//!   rank-proportional weights.
//! - **Multi objective**: maintain an elitist archive holding the Pareto
//!   front of everything seen, then rank the working set by dominance-weighted
//!   similarity and keep a quarter of the target size. Parents are drawn from
//!   a softmax over the same ranking.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::schema::{Candidate, ObjectiveMode, Score};

use super::pareto::{dominates, non_dominated_front};
use super::similarity::structural_similarity;

/// Result of [`Population::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// Unscored candidate offered while seeding; not stored.
    Rejected,
    /// Stored in the pending buffer.
    Buffered {
        /// The candidate duplicated an existing member and now carries the sentinel.
        demoted: bool,
    },
    /// Stored, and the buffer filled up and triggered survival.
    Survived {
        /// The candidate duplicated an existing member and now carries the sentinel.
        demoted: bool,
        /// Generation after the survival pass.
        generation: usize,
    },
}

impl RegisterOutcome {
    /// True unless the candidate was rejected.
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Shared population of scored candidates.
pub struct Population {
    state: Mutex<PopulationState>,
    target_size: usize,
    objective: ObjectiveMode,
}

struct PopulationState {
    current: Vec<Candidate>,
    pending: Vec<Candidate>,
    elitist: Vec<Candidate>,
    generation: usize,
    rng: StdRng,
}

impl Population {
    /// Create an empty population at generation 0.
    pub fn new(target_size: usize, objective: ObjectiveMode, seed: Option<u64>) -> Self {
        Self::restore(target_size, objective, seed, Vec::new(), 0)
    }

    /// Create a population that starts from existing members at a given generation.
    pub fn restore(
        target_size: usize,
        objective: ObjectiveMode,
        seed: Option<u64>,
        members: Vec<Candidate>,
        generation: usize,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let objectives = objective.objectives();
        let current = members
            .into_iter()
            .map(|c| normalize_score(c, objectives))
            .collect();

        Self {
            state: Mutex::new(PopulationState {
                current,
                pending: Vec::new(),
                elitist: Vec::new(),
                generation,
                rng,
            }),
            target_size: target_size.max(1),
            objective,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PopulationState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::error!("Population lock poisoned, recovering state");
            poisoned.into_inner()
        })
    }

    /// Target size of the current generation.
    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Objective mode.
    pub fn objective(&self) -> ObjectiveMode {
        self.objective
    }

    /// Current generation index.
    pub fn generation(&self) -> usize {
        self.lock().generation
    }

    /// Copy of the current generation.
    pub fn members(&self) -> Vec<Candidate> {
        self.lock().current.clone()
    }

    /// Copy of the elitist archive (empty in single-objective mode).
    pub fn elitist(&self) -> Vec<Candidate> {
        self.lock().elitist.clone()
    }

    /// Number of candidates awaiting survival.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of selectable members of the current generation.
    pub fn feasible_count(&self) -> usize {
        self.lock()
            .current
            .iter()
            .filter(|c| c.is_feasible())
            .count()
    }

    /// Best feasible candidate by primary objective, archive included.
    pub fn best(&self) -> Option<Candidate> {
        let state = self.lock();
        state
            .current
            .iter()
            .chain(&state.elitist)
            .filter(|c| c.is_feasible())
            .max_by(|a, b| a.primary_score().total_cmp(&b.primary_score()))
            .cloned()
    }

    /// Register an evaluated candidate.
    ///
    /// An unscored candidate is rejected while the population is still at
    /// generation 0 and otherwise stored with the failure sentinel. A candidate
    /// that repeats an existing source, or ties an existing primary objective
    /// without beating any other objective, is stored with the sentinel so
    /// the next survival pass prunes it.
    pub fn register(&self, candidate: Candidate) -> RegisterOutcome {
        let mut state = self.lock();

        if state.generation == 0 && !candidate.is_feasible() {
            log::debug!(
                "Rejecting unscored {} candidate during seeding",
                candidate.operator
            );
            return RegisterOutcome::Rejected;
        }

        let objectives = self.objective.objectives();
        let mut candidate = normalize_score(candidate, objectives);
        let demoted = candidate.is_feasible() && state.is_duplicate(&candidate);
        if demoted {
            log::debug!("Demoting duplicate {} candidate", candidate.operator);
            candidate.score = Some(Score::failure(objectives));
        }

        state.pending.push(candidate);
        if state.pending.len() >= self.target_size {
            let generation = self.survive(&mut state);
            return RegisterOutcome::Survived {
                demoted,
                generation,
            };
        }
        RegisterOutcome::Buffered { demoted }
    }

    /// Insert a scored candidate straight into the current generation.
    ///
    /// Used for caller-provided seeds; bypasses the pending buffer and
    /// duplicate demotion.
    pub fn insert(&self, candidate: Candidate) {
        let candidate = normalize_score(candidate, self.objective.objectives());
        self.lock().current.push(candidate);
    }

    /// Run a survival pass now and return the new generation index.
    pub fn survival(&self) -> usize {
        let mut state = self.lock();
        self.survive(&mut state)
    }

    fn survive(&self, state: &mut PopulationState) -> usize {
        match self.objective {
            ObjectiveMode::Single => state.survive_single(self.target_size),
            ObjectiveMode::Multi { .. } => state.survive_multi(self.target_size),
        }
        state.generation += 1;
        log::info!(
            "Generation {}: {} members, best {}",
            state.generation,
            state.current.len(),
            state
                .current
                .iter()
                .filter(|c| c.is_feasible())
                .map(Candidate::primary_score)
                .fold(f64::NEG_INFINITY, f64::max)
        );
        state.generation
    }

    /// Draw one parent from the selectable members.
    pub fn selection(&self) -> Option<Candidate> {
        self.select_parents(1).into_iter().next()
    }

    /// Draw up to `count` distinct parents from the selectable members.
    ///
    /// Returns fewer than `count` when not enough members are feasible.
    pub fn select_parents(&self, count: usize) -> Vec<Candidate> {
        let mut state = self.lock();
        let feasible: Vec<&Candidate> = state.current.iter().filter(|c| c.is_feasible()).collect();
        if feasible.is_empty() || count == 0 {
            return Vec::new();
        }

        let weights = match self.objective {
            ObjectiveMode::Single => rank_weights(&feasible),
            ObjectiveMode::Multi { .. } => softmax(&dominance_similarity(&feasible)),
        };
        let feasible: Vec<Candidate> = feasible.into_iter().cloned().collect();
        draw_without_replacement(&mut state.rng, weights, count)
            .into_iter()
            .map(|i| feasible[i].clone())
            .collect()
    }
}

impl PopulationState {
    fn is_duplicate(&self, candidate: &Candidate) -> bool {
        let Some(score) = candidate.score.as_ref() else {
            return false;
        };
        self.current.iter().chain(&self.pending).any(|member| {
            if member.source_text == candidate.source_text {
                return true;
            }
            match member.score.as_ref() {
                Some(existing) if !existing.is_failure() => ties_or_trails(score, existing),
                _ => false,
            }
        })
    }

    fn survive_single(&mut self, target_size: usize) {
        let mut merged: Vec<Candidate> = self.current.drain(..).chain(self.pending.drain(..)).collect();
        merged.sort_by(|a, b| b.primary_score().total_cmp(&a.primary_score()));
        dedup_by_source(&mut merged);
        merged.truncate(target_size);
        self.current = merged;
    }

    fn survive_multi(&mut self, target_size: usize) {
        let mut working: Vec<Candidate> = self.current.drain(..).chain(self.pending.drain(..)).collect();

        let mut pool: Vec<Candidate> = self
            .elitist
            .drain(..)
            .chain(working.iter().cloned())
            .filter(Candidate::is_feasible)
            .collect();
        dedup_by_source(&mut pool);
        let objectives: Vec<&[f64]> = pool.iter().map(objectives_of).collect();
        let front = non_dominated_front(&objectives);
        self.elitist = front.into_iter().map(|i| pool[i].clone()).collect();

        dedup_by_source(&mut working);
        let refs: Vec<&Candidate> = working.iter().collect();
        let totals = dominance_similarity(&refs);
        let mut order: Vec<usize> = (0..working.len()).collect();
        order.sort_by(|&a, &b| totals[b].total_cmp(&totals[a]));

        let keep = (target_size / 4).max(1);
        let mut slots: Vec<Option<Candidate>> = working.into_iter().map(Some).collect();
        self.current = order
            .into_iter()
            .take(keep)
            .filter_map(|i| slots[i].take())
            .collect();
    }
}

fn objectives_of(candidate: &Candidate) -> &[f64] {
    candidate.score.as_ref().map(Score::objectives).unwrap_or(&[])
}

/// Replace a missing, malformed or non-finite score with the failure sentinel.
fn normalize_score(mut candidate: Candidate, objectives: usize) -> Candidate {
    let keep = match candidate.score.as_ref() {
        Some(score) if score.len() != objectives => {
            log::warn!(
                "Score {score} has {} objectives, expected {objectives}",
                score.len()
            );
            false
        }
        Some(score) => !score.is_failure(),
        None => false,
    };
    if !keep {
        candidate.score = Some(Score::failure(objectives));
    }
    candidate
}

/// `new` equals `existing` in the primary objective and is no better elsewhere.
fn ties_or_trails(new: &Score, existing: &Score) -> bool {
    let (new, existing) = (new.objectives(), existing.objectives());
    new.len() == existing.len()
        && new[0] == existing[0]
        && new[1..].iter().zip(&existing[1..]).all(|(n, e)| n <= e)
}

/// Keep the first occurrence of every source text.
fn dedup_by_source(candidates: &mut Vec<Candidate>) {
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.source_text.clone()));
}

/// Dominance-weighted similarity total per candidate.
///
/// Whenever `i` dominates `j`, the similarity between them is subtracted from
/// `j`. Undominated candidates total zero; a candidate dominated by close
/// relatives scores lowest. Failures total negative infinity.
pub fn dominance_similarity(candidates: &[&Candidate]) -> Vec<f64> {
    let n = candidates.len();
    let mut totals = vec![0.0; n];
    for i in 0..n {
        if !candidates[i].is_feasible() {
            continue;
        }
        for j in 0..n {
            if i != j && dominates(objectives_of(candidates[i]), objectives_of(candidates[j])) {
                totals[j] -= structural_similarity(
                    &candidates[i].source_text,
                    &candidates[j].source_text,
                );
            }
        }
    }
    for (total, candidate) in totals.iter_mut().zip(candidates) {
        if !candidate.is_feasible() {
            *total = f64::NEG_INFINITY;
        }
    }
    totals
}

/// Weights proportional to rank, best first.
fn rank_weights(candidates: &[&Candidate]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[b]
            .primary_score()
            .partial_cmp(&candidates[a].primary_score())
            .unwrap_or(Ordering::Equal)
    });
    let n = candidates.len();
    let mut weights = vec![0.0; n];
    for (rank, idx) in order.into_iter().enumerate() {
        weights[idx] = (n - rank) as f64;
    }
    weights
}

fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - max).exp()).collect()
}

fn draw_without_replacement(rng: &mut StdRng, mut weights: Vec<f64>, count: usize) -> Vec<usize> {
    let mut picked = Vec::with_capacity(count);
    while picked.len() < count {
        let Ok(dist) = WeightedIndex::new(&weights) else {
            break;
        };
        let idx = dist.sample(rng);
        picked.push(idx);
        weights[idx] = 0.0;
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Operator;
    use proptest::prelude::*;

    fn scored(source: &str, score: f64) -> Candidate {
        Candidate::new(source, Operator::Init).with_score(Score::Scalar(score))
    }

    fn scored_vec(source: &str, score: &[f64]) -> Candidate {
        Candidate::new(source, Operator::Init).with_score(Score::Vector(score.to_vec()))
    }

    fn primaries(pop: &Population) -> Vec<f64> {
        pop.members().iter().map(Candidate::primary_score).collect()
    }

    #[test]
    fn test_seeding_sequence_keeps_top_scores() {
        let pop = Population::new(4, ObjectiveMode::Single, Some(7));
        for (i, s) in [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0].into_iter().enumerate() {
            pop.register(scored(&format!("p{i}"), s));
        }
        assert_eq!(pop.generation(), 2);
        let outcome = pop.register(Candidate::new("broken", Operator::Init));
        assert!(outcome.is_admitted());
        pop.survival();

        assert_eq!(pop.generation(), 3);
        assert_eq!(primaries(&pop), vec![9.0, 6.0, 5.0, 4.0]);
        assert_eq!(pop.pending_len(), 0);
    }

    #[test]
    fn test_generation_zero_rejects_unscored() {
        let pop = Population::new(4, ObjectiveMode::Single, Some(1));
        let outcome = pop.register(Candidate::new("x", Operator::Init));
        assert_eq!(outcome, RegisterOutcome::Rejected);
        assert!(!outcome.is_admitted());
        assert_eq!(pop.pending_len(), 0);

        let pop = Population::restore(4, ObjectiveMode::Single, Some(1), Vec::new(), 1);
        let outcome = pop.register(Candidate::new("x", Operator::MutateForm));
        assert_eq!(outcome, RegisterOutcome::Buffered { demoted: false });
        assert_eq!(pop.pending_len(), 1);
    }

    #[test]
    fn test_register_triggers_survival() {
        let pop = Population::new(2, ObjectiveMode::Single, Some(1));
        assert_eq!(
            pop.register(scored("a", 1.0)),
            RegisterOutcome::Buffered { demoted: false }
        );
        assert_eq!(
            pop.register(scored("b", 2.0)),
            RegisterOutcome::Survived {
                demoted: false,
                generation: 1
            }
        );
        assert_eq!(pop.generation(), 1);
    }

    #[test]
    fn test_duplicates_are_demoted_not_dropped() {
        let pop = Population::new(10, ObjectiveMode::Single, Some(1));
        pop.register(scored("a", 1.0));
        let outcome = pop.register(scored("a", 5.0));
        assert_eq!(outcome, RegisterOutcome::Buffered { demoted: true });
        assert_eq!(pop.pending_len(), 2);

        pop.survival();
        let members = pop.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].primary_score(), 1.0);
    }

    #[test]
    fn test_multi_objective_tie_rule() {
        let pop = Population::new(10, ObjectiveMode::Multi { objectives: 2 }, Some(1));
        pop.register(scored_vec("a", &[1.0, 2.0]));
        assert_eq!(
            pop.register(scored_vec("b", &[1.0, 1.0])),
            RegisterOutcome::Buffered { demoted: true }
        );
        assert_eq!(
            pop.register(scored_vec("c", &[1.0, 3.0])),
            RegisterOutcome::Buffered { demoted: false }
        );
    }

    #[test]
    fn test_wrong_objective_count_becomes_failure() {
        let pop = Population::restore(4, ObjectiveMode::Multi { objectives: 2 }, None, Vec::new(), 1);
        pop.register(scored("scalar", 1.0));
        pop.survival();
        assert_eq!(pop.feasible_count(), 0);
    }

    #[test]
    fn test_multi_survival_keeps_quarter_and_front() {
        let pop = Population::new(8, ObjectiveMode::Multi { objectives: 2 }, Some(3));
        let points = [
            [5.0, 1.0],
            [1.0, 5.0],
            [3.0, 3.0],
            [2.0, 2.0],
            [1.0, 1.0],
            [0.0, 4.0],
            [4.0, 0.0],
            [0.5, 0.5],
        ];
        for (i, p) in points.iter().enumerate() {
            pop.register(scored_vec(&format!("fn f{i}() {{ return {i}; }}"), p));
        }
        assert_eq!(pop.generation(), 1);
        assert_eq!(pop.members().len(), 2);

        let mut front: Vec<f64> = pop.elitist().iter().map(Candidate::primary_score).collect();
        front.sort_by(f64::total_cmp);
        assert_eq!(front, vec![1.0, 3.0, 5.0]);

        for member in pop.members() {
            let score = member.score.unwrap();
            assert!(points.iter().all(|p| !dominates(p, score.objectives())));
        }
    }

    #[test]
    fn test_dominated_relative_is_penalized() {
        let a = scored_vec("x = a + b;", &[2.0, 2.0]);
        let near = scored_vec("x = a + c;", &[1.0, 1.0]);
        let far = scored_vec("while (true) { run(); }", &[1.0, 1.0]);
        let totals = dominance_similarity(&[&a, &near, &far]);
        assert_eq!(totals[0], 0.0);
        assert!(totals[1] < totals[2]);
        assert!(totals[2] <= 0.0);
    }

    #[test]
    fn test_selection_skips_failures() {
        let members = vec![
            scored("good", 1.0),
            Candidate::new("bad", Operator::Init).with_score(Score::failure(1)),
        ];
        let pop = Population::restore(4, ObjectiveMode::Single, Some(9), members, 1);
        for _ in 0..20 {
            assert_eq!(pop.selection().unwrap().source_text, "good");
        }
        assert_eq!(pop.select_parents(2).len(), 1);
    }

    #[test]
    fn test_select_parents_distinct() {
        let members = (0..5).map(|i| scored(&format!("p{i}"), i as f64)).collect();
        let pop = Population::restore(5, ObjectiveMode::Multi { objectives: 1 }, Some(2), members, 1);
        let parents = pop.select_parents(3);
        let sources: HashSet<_> = parents.iter().map(|c| c.source_text.clone()).collect();
        assert_eq!(sources.len(), 3);
    }

    #[test]
    fn test_concurrent_register() {
        let pop = Population::new(5, ObjectiveMode::Single, Some(4));
        std::thread::scope(|s| {
            for t in 0..4 {
                let pop = &pop;
                s.spawn(move || {
                    for i in 0..25 {
                        pop.register(scored(&format!("t{t}-{i}"), (t * 100 + i) as f64));
                    }
                });
            }
        });
        assert_eq!(pop.generation(), 20);
        assert_eq!(pop.members().len(), 5);
        assert_eq!(pop.best().unwrap().primary_score(), 324.0);
    }

    proptest! {
        #[test]
        fn test_best_is_monotone_and_survivors_unique(
            entries in prop::collection::vec((0u8..12, -50i32..50), 1..60)
        ) {
            let pop = Population::new(4, ObjectiveMode::Single, Some(11));
            let mut best = f64::NEG_INFINITY;
            for (source, score) in entries {
                let outcome = pop.register(scored(&format!("s{source}"), f64::from(score)));
                if let RegisterOutcome::Survived { .. } = outcome {
                    let members = pop.members();
                    let now = members.iter().map(Candidate::primary_score).fold(f64::NEG_INFINITY, f64::max);
                    prop_assert!(now >= best);
                    best = now;

                    let unique: HashSet<_> = members.iter().map(|c| &c.source_text).collect();
                    prop_assert_eq!(unique.len(), members.len());
                }
            }
        }
    }
}
