//! Run recording and resume.
//!
//! [`JsonRecorder`] writes this layout under its log directory:
//!
//! ```text
//! run_parameters.json
//! samples/samples_1~200.json      every evaluated candidate, 200 per file
//! samples/samples_best.json       each new best, in order
//! population/pop_<gen>.json       one snapshot per generation
//! ```
//!
//! Failure scores are written as `null`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::schema::{Candidate, Operator, Score, SearchConfig};

const SAMPLES_PER_FILE: usize = 200;

/// Run metadata written once at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParameters {
    /// Language model identifier.
    pub model: String,
    /// Task identifier.
    pub task: String,
    /// Search method identifier.
    pub method: String,
    /// Search configuration.
    pub config: SearchConfig,
}

/// One evaluated candidate in the sample history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    /// 1-based evaluation order.
    pub sample_order: usize,
    pub operator: Operator,
    pub score: Option<Score>,
    pub rationale: Option<String>,
    pub source_text: String,
    pub sample_time: f64,
    pub evaluate_time: f64,
}

/// One member of a population snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationEntry {
    pub score: Option<Score>,
    pub operator: Operator,
    pub rationale: Option<String>,
    pub source_text: String,
}

impl From<&Candidate> for PopulationEntry {
    fn from(candidate: &Candidate) -> Self {
        Self {
            score: recorded_score(candidate),
            operator: candidate.operator,
            rationale: candidate.rationale.clone(),
            source_text: candidate.source_text.clone(),
        }
    }
}

impl From<PopulationEntry> for Candidate {
    fn from(entry: PopulationEntry) -> Self {
        Self {
            source_text: entry.source_text,
            rationale: entry.rationale,
            score: entry.score,
            sample_time_seconds: 0.0,
            evaluate_time_seconds: 0.0,
            operator: entry.operator,
        }
    }
}

fn recorded_score(candidate: &Candidate) -> Option<Score> {
    candidate.score.clone().filter(|s| !s.is_failure())
}

/// Profiler collaborator notified by the search engine.
///
/// Recording is best effort: the engine logs returned errors and carries on.
pub trait RunRecorder: Send + Sync {
    /// Called once before seeding.
    fn record_parameters(&self, parameters: &RunParameters) -> io::Result<()>;

    /// Called for every evaluated candidate, in registration order.
    fn register_candidate(&self, candidate: &Candidate) -> io::Result<()>;

    /// Called after survival passes with the current generation.
    fn register_population(&self, generation: usize, members: &[Candidate]) -> io::Result<()>;

    /// Called once at shutdown.
    fn finish(&self) -> io::Result<()>;
}

/// Recorder that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl RunRecorder for NullRecorder {
    fn record_parameters(&self, _parameters: &RunParameters) -> io::Result<()> {
        Ok(())
    }

    fn register_candidate(&self, _candidate: &Candidate) -> io::Result<()> {
        Ok(())
    }

    fn register_population(&self, _generation: usize, _members: &[Candidate]) -> io::Result<()> {
        Ok(())
    }

    fn finish(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    total: usize,
    batch: Vec<SampleRecord>,
    best: Option<f64>,
    best_history: Vec<SampleRecord>,
    last_generation: Option<usize>,
}

/// Recorder writing JSON files under a log directory.
#[derive(Debug)]
pub struct JsonRecorder {
    log_dir: PathBuf,
    state: Mutex<RecorderState>,
}

impl JsonRecorder {
    /// Create the log directory layout.
    pub fn new<P: AsRef<Path>>(log_dir: P) -> io::Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(log_dir.join("samples"))?;
        fs::create_dir_all(log_dir.join("population"))?;
        Ok(Self {
            log_dir,
            state: Mutex::new(RecorderState::default()),
        })
    }

    /// Continue a recorded run after `total_samples` earlier samples.
    ///
    /// The partly filled sample file and the best history are read back so
    /// that later writes extend them instead of replacing them.
    pub fn resuming_from(self, total_samples: usize) -> io::Result<Self> {
        let open_batch = total_samples / SAMPLES_PER_FILE;
        let batch = if total_samples % SAMPLES_PER_FILE == 0 {
            Vec::new()
        } else {
            read_records(&self.batch_path(open_batch))?
        };
        let best_history = read_records(&self.best_path())?;
        let best = best_history
            .last()
            .and_then(|record| record.score.as_ref())
            .map(Score::primary);
        log::debug!(
            "Resuming recorder at sample {total_samples} ({} in open batch, best {best:?})",
            batch.len()
        );
        {
            let mut state = self.lock();
            state.total = total_samples;
            state.batch = batch;
            state.best = best;
            state.best_history = best_history;
        }
        Ok(self)
    }

    /// Log directory.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        fs::write(path, json)
    }

    fn batch_path(&self, batch_index: usize) -> PathBuf {
        let lo = batch_index * SAMPLES_PER_FILE + 1;
        let hi = (batch_index + 1) * SAMPLES_PER_FILE;
        self.log_dir
            .join("samples")
            .join(format!("samples_{lo}~{hi}.json"))
    }

    fn best_path(&self) -> PathBuf {
        self.log_dir.join("samples").join("samples_best.json")
    }
}

/// Records in `path`, or none when the file does not exist yet.
fn read_records(path: &Path) -> io::Result<Vec<SampleRecord>> {
    match fs::read_to_string(path) {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

impl RunRecorder for JsonRecorder {
    fn record_parameters(&self, parameters: &RunParameters) -> io::Result<()> {
        Self::write_json(&self.log_dir.join("run_parameters.json"), parameters)
    }

    fn register_candidate(&self, candidate: &Candidate) -> io::Result<()> {
        let mut state = self.lock();
        state.total += 1;
        let record = SampleRecord {
            sample_order: state.total,
            operator: candidate.operator,
            score: recorded_score(candidate),
            rationale: candidate.rationale.clone(),
            source_text: candidate.source_text.clone(),
            sample_time: candidate.sample_time_seconds,
            evaluate_time: candidate.evaluate_time_seconds,
        };

        if let Some(score) = &record.score
            && state.best.is_none_or(|best| score.primary() > best)
        {
            state.best = Some(score.primary());
            state.best_history.push(record.clone());
            Self::write_json(&self.best_path(), &state.best_history)?;
        }

        let batch_index = (state.total - 1) / SAMPLES_PER_FILE;
        state.batch.push(record);
        Self::write_json(&self.batch_path(batch_index), &state.batch)?;
        if state.total % SAMPLES_PER_FILE == 0 {
            state.batch.clear();
        }
        Ok(())
    }

    fn register_population(&self, generation: usize, members: &[Candidate]) -> io::Result<()> {
        let mut state = self.lock();
        if state.last_generation == Some(generation) {
            return Ok(());
        }
        let entries: Vec<PopulationEntry> = members.iter().map(PopulationEntry::from).collect();
        Self::write_json(
            &self
                .log_dir
                .join("population")
                .join(format!("pop_{generation}.json")),
            &entries,
        )?;
        state.last_generation = Some(generation);
        Ok(())
    }

    fn finish(&self) -> io::Result<()> {
        let state = self.lock();
        log::info!(
            "Recorded {} samples under {}",
            state.total,
            self.log_dir.display()
        );
        Ok(())
    }
}

/// Population and progress restored from a [`JsonRecorder`] log directory.
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// Generation of the newest snapshot.
    pub generation: usize,
    /// Members of that snapshot.
    pub members: Vec<Candidate>,
    /// Samples recorded so far.
    pub total_samples: usize,
}

fn numbered_files(dir: &Path, prefix: &str) -> io::Result<Vec<(usize, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some(rest) = stem.strip_prefix(prefix) else {
            continue;
        };
        let number = rest.split('~').next().and_then(|n| n.parse().ok());
        if let Some(number) = number {
            files.push((number, path));
        }
    }
    files.sort_by_key(|(n, _)| *n);
    Ok(files)
}

/// Load the newest population snapshot and the sample count from `log_dir`.
pub fn load_population<P: AsRef<Path>>(log_dir: P) -> io::Result<ResumeState> {
    let log_dir = log_dir.as_ref();
    let snapshots = numbered_files(&log_dir.join("population"), "pop_")?;
    let (generation, path) = snapshots.last().cloned().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no population snapshot in {}", log_dir.display()),
        )
    })?;
    let entries: Vec<PopulationEntry> = serde_json::from_str(&fs::read_to_string(&path)?)?;

    let mut total_samples = 0;
    let samples_dir = log_dir.join("samples");
    if samples_dir.is_dir() {
        for (_, batch) in numbered_files(&samples_dir, "samples_")? {
            total_samples += read_records(&batch)?.len();
        }
    }

    log::info!(
        "Resuming from generation {generation} with {} members and {total_samples} samples",
        entries.len()
    );
    Ok(ResumeState {
        generation,
        members: entries.into_iter().map(Candidate::from).collect(),
        total_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(i: usize, score: Option<f64>) -> Candidate {
        let mut c = Candidate::new(format!("p{i}"), Operator::MutateForm).with_rationale("r");
        c.score = score.map(Score::Scalar);
        c
    }

    #[test]
    fn test_sample_batches_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonRecorder::new(dir.path()).unwrap();
        for i in 0..205 {
            let score = if i == 3 { None } else { Some(i as f64 % 50.0) };
            recorder.register_candidate(&candidate(i, score)).unwrap();
        }
        recorder.register_candidate(&candidate(999, Some(f64::NEG_INFINITY))).unwrap();

        let first: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_1~200.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(first.len(), 200);
        assert_eq!(first[0].sample_order, 1);
        assert!(first[3].score.is_none());

        let second: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_201~400.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(second.len(), 6);
        assert!(second[5].score.is_none());

        let best: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_best.json")).unwrap(),
        )
        .unwrap();
        let primaries: Vec<f64> = best.iter().map(|r| r.score.as_ref().unwrap().primary()).collect();
        assert_eq!(primaries.first(), Some(&0.0));
        assert_eq!(primaries.last(), Some(&49.0));
        assert!(primaries.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_population_snapshot_once_per_generation() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonRecorder::new(dir.path()).unwrap();
        recorder
            .register_population(1, &[candidate(0, Some(1.0))])
            .unwrap();
        recorder
            .register_population(1, &[candidate(1, Some(2.0))])
            .unwrap();

        let entries: Vec<PopulationEntry> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("population/pop_1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source_text, "p0");
    }

    #[test]
    fn test_resume_reads_newest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonRecorder::new(dir.path()).unwrap();
        for i in 0..7 {
            recorder.register_candidate(&candidate(i, Some(i as f64))).unwrap();
        }
        recorder.register_population(2, &[candidate(0, Some(1.0))]).unwrap();
        recorder
            .register_population(10, &[candidate(5, Some(5.0)), candidate(6, None)])
            .unwrap();

        let resume = load_population(dir.path()).unwrap();
        assert_eq!(resume.generation, 10);
        assert_eq!(resume.total_samples, 7);
        assert_eq!(resume.members.len(), 2);
        assert_eq!(resume.members[0].score, Some(Score::Scalar(5.0)));
        assert!(resume.members[1].score.is_none());
    }

    #[test]
    fn test_resumed_recorder_extends_open_batch_and_best() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonRecorder::new(dir.path()).unwrap();
        for i in 0..205 {
            recorder.register_candidate(&candidate(i, Some(i as f64))).unwrap();
        }
        recorder.register_population(3, &[candidate(204, Some(204.0))]).unwrap();
        drop(recorder);

        let recorder = JsonRecorder::new(dir.path())
            .unwrap()
            .resuming_from(205)
            .unwrap();
        assert_eq!(recorder.log_dir(), dir.path());
        recorder.register_candidate(&candidate(205, Some(1.0))).unwrap();
        recorder.register_candidate(&candidate(206, Some(500.0))).unwrap();

        let resume = load_population(dir.path()).unwrap();
        assert_eq!(resume.total_samples, 207);

        let open: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_201~400.json")).unwrap(),
        )
        .unwrap();
        let orders: Vec<usize> = open.iter().map(|r| r.sample_order).collect();
        assert_eq!(orders, (201..=207).collect::<Vec<_>>());

        // 1.0 is below the restored best of 204, so only 500 extends the history.
        let best: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_best.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(best.len(), 206);
        assert_eq!(best[204].sample_order, 205);
        assert_eq!(best[205].sample_order, 207);
    }

    #[test]
    fn test_resume_at_batch_boundary_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonRecorder::new(dir.path()).unwrap();
        for i in 0..200 {
            recorder.register_candidate(&candidate(i, None)).unwrap();
        }
        drop(recorder);

        let recorder = JsonRecorder::new(dir.path())
            .unwrap()
            .resuming_from(200)
            .unwrap();
        recorder.register_candidate(&candidate(200, Some(-3.0))).unwrap();

        let open: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_201~400.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].sample_order, 201);
        let first: Vec<SampleRecord> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("samples/samples_1~200.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(first.len(), 200);
    }

    #[test]
    fn test_resume_without_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        JsonRecorder::new(dir.path()).unwrap();
        let err = load_population(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
