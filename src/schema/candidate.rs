//! Candidate programs and their scores.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Score of an evaluated candidate.
///
/// The search always maximizes. A failed or demoted candidate carries the
/// failure sentinel: negative infinity in every objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    /// Single objective.
    Scalar(f64),
    /// One value per objective.
    Vector(Vec<f64>),
}

impl Score {
    /// Failure sentinel with the given number of objectives.
    ///
    /// One objective yields a scalar sentinel.
    pub fn failure(objectives: usize) -> Self {
        if objectives <= 1 {
            Self::Scalar(f64::NEG_INFINITY)
        } else {
            Self::Vector(vec![f64::NEG_INFINITY; objectives])
        }
    }

    /// Objective values as a slice (a scalar is a one-element slice).
    pub fn objectives(&self) -> &[f64] {
        match self {
            Self::Scalar(value) => std::slice::from_ref(value),
            Self::Vector(values) => values,
        }
    }

    /// Number of objectives.
    pub fn len(&self) -> usize {
        self.objectives().len()
    }

    /// True if there are no objective values at all.
    pub fn is_empty(&self) -> bool {
        self.objectives().is_empty()
    }

    /// First objective, used for ordering and reporting.
    pub fn primary(&self) -> f64 {
        self.objectives()
            .first()
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    /// True if any objective is infinite or NaN.
    ///
    /// Such candidates are never offered for selection.
    pub fn is_failure(&self) -> bool {
        self.is_empty() || self.objectives().iter().any(|v| !v.is_finite())
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{value:.6}"),
            Self::Vector(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value:.6}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Generation operator that shaped the prompt for a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operator {
    /// No parents; produce a program from the task template.
    Init,
    /// Several parents; produce something unlike all of them.
    CrossoverBroad,
    /// Several parents; find their common idea, then diverge from it.
    CrossoverGuided,
    /// One parent; change its structure.
    MutateForm,
    /// One parent; keep the structure, change constants and thresholds.
    MutateParams,
    /// Caller-supplied program injected without sampling.
    Seed,
}

impl Operator {
    /// Default evolving sequence.
    pub const EVOLVING: [Operator; 4] = [
        Operator::CrossoverBroad,
        Operator::CrossoverGuided,
        Operator::MutateForm,
        Operator::MutateParams,
    ];

    /// Bookkeeping tag.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CrossoverBroad => "crossover-broad",
            Self::CrossoverGuided => "crossover-guided",
            Self::MutateForm => "mutate-form",
            Self::MutateParams => "mutate-params",
            Self::Seed => "seed",
        }
    }

    /// True for operators that take several parents.
    pub fn is_crossover(self) -> bool {
        matches!(self, Self::CrossoverBroad | Self::CrossoverGuided)
    }

    /// Number of parents the operator consumes.
    pub fn parent_count(self, selection_num: usize) -> usize {
        match self {
            Self::Init | Self::Seed => 0,
            op if op.is_crossover() => selection_num,
            _ => 1,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A generated program with its rationale, score and timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Full program text.
    pub source_text: String,
    /// Natural-language idea produced alongside the program.
    #[serde(default)]
    pub rationale: Option<String>,
    /// `None` until evaluated.
    #[serde(default)]
    pub score: Option<Score>,
    /// Seconds spent waiting on the language model.
    #[serde(default)]
    pub sample_time_seconds: f64,
    /// Seconds spent evaluating.
    #[serde(default)]
    pub evaluate_time_seconds: f64,
    /// Operator that produced the candidate.
    pub operator: Operator,
}

impl Candidate {
    /// Create an unscored candidate.
    pub fn new(source_text: impl Into<String>, operator: Operator) -> Self {
        Self {
            source_text: source_text.into(),
            rationale: None,
            score: None,
            sample_time_seconds: 0.0,
            evaluate_time_seconds: 0.0,
            operator,
        }
    }

    /// Attach a rationale.
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    /// Attach a score.
    pub fn with_score(mut self, score: Score) -> Self {
        self.score = Some(score);
        self
    }

    /// True if the candidate has a finite score and may be selected.
    pub fn is_feasible(&self) -> bool {
        self.score.as_ref().is_some_and(|s| !s.is_failure())
    }

    /// Primary objective, negative infinity when unscored.
    pub fn primary_score(&self) -> f64 {
        self.score
            .as_ref()
            .map(Score::primary)
            .unwrap_or(f64::NEG_INFINITY)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_sentinel_shape() {
        assert_eq!(Score::failure(1), Score::Scalar(f64::NEG_INFINITY));
        assert_eq!(
            Score::failure(3),
            Score::Vector(vec![f64::NEG_INFINITY; 3])
        );
        assert!(Score::failure(2).is_failure());
        assert!(!Score::Vector(vec![1.0, -2.0]).is_failure());
    }

    #[test]
    fn test_score_json_is_untagged() {
        let scalar: Score = serde_json::from_str("-12.5").unwrap();
        assert_eq!(scalar, Score::Scalar(-12.5));

        let vector: Score = serde_json::from_str("[1.0, 2.0]").unwrap();
        assert_eq!(vector.objectives(), &[1.0, 2.0]);
    }

    #[test]
    fn test_operator_tags() {
        assert_eq!(Operator::CrossoverBroad.tag(), "crossover-broad");
        let json = serde_json::to_string(&Operator::MutateParams).unwrap();
        assert_eq!(json, "\"mutate-params\"");
        assert_eq!(Operator::CrossoverGuided.parent_count(3), 3);
        assert_eq!(Operator::MutateForm.parent_count(3), 1);
        assert_eq!(Operator::Seed.parent_count(3), 0);
        assert!(Operator::CrossoverBroad.is_crossover());
        assert!(!Operator::MutateParams.is_crossover());
    }

    #[test]
    fn test_feasibility() {
        let c = Candidate::new("x", Operator::Init);
        assert!(!c.is_feasible());
        assert!(c.clone().with_score(Score::Scalar(1.0)).is_feasible());
        assert!(!c.with_score(Score::failure(1)).is_feasible());
    }
}
