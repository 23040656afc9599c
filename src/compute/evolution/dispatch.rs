//! Evaluator pool and workspace slot assignment.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Instant;

use crate::compute::sandbox::{EvalOutcome, Evaluation, Evaluator};

/// Round-robin slot assignment with exclusive leases.
///
/// `propose` hands out slot indices in rotation. A slot is only used while a
/// [`SlotLease`] on it is alive; when the proposed slot is still leased the
/// next free one is taken instead.
#[derive(Debug)]
pub struct SlotPoller {
    next: AtomicUsize,
    busy: Vec<AtomicBool>,
}

impl SlotPoller {
    /// Create a poller over `slots` slots.
    pub fn new(slots: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            busy: (0..slots.max(1)).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.busy.len()
    }

    /// Next slot in rotation.
    pub fn propose(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.busy.len()
    }

    /// Lease `preferred`, or the first free slot after it.
    pub fn lease(self: &Arc<Self>, preferred: usize) -> Option<SlotLease> {
        let n = self.busy.len();
        (0..n).map(|offset| (preferred + offset) % n).find_map(|slot| {
            self.busy[slot]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| SlotLease {
                    poller: Arc::clone(self),
                    slot,
                })
        })
    }
}

/// Exclusive use of one slot, released on drop.
#[derive(Debug)]
pub struct SlotLease {
    poller: Arc<SlotPoller>,
    slot: usize,
}

impl SlotLease {
    /// Leased slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.poller.busy[self.slot].store(false, Ordering::Release);
    }
}

/// Evaluation submitted to the pool.
pub struct PendingEvaluation {
    receiver: mpsc::Receiver<Evaluation>,
}

impl PendingEvaluation {
    /// Block until the evaluation finishes.
    pub fn wait(self) -> Evaluation {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Evaluation::cancelled())
    }
}

/// Bounded pool of evaluation workers, one per workspace slot.
pub struct EvaluatorPool {
    pool: rayon::ThreadPool,
    evaluator: Arc<dyn Evaluator>,
    poller: Arc<SlotPoller>,
    closed: Arc<AtomicBool>,
}

impl EvaluatorPool {
    /// Create a pool of `workers` threads sharing `evaluator`.
    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        workers: usize,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("evaluator-{i}"))
            .build()?;
        Ok(Self {
            pool,
            evaluator,
            poller: Arc::new(SlotPoller::new(workers)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of workers (and slots).
    pub fn workers(&self) -> usize {
        self.poller.slots()
    }

    /// Queue `source` for evaluation.
    pub fn submit(&self, source: String) -> PendingEvaluation {
        let (tx, rx) = mpsc::channel();
        let preferred = self.poller.propose();
        let evaluator = Arc::clone(&self.evaluator);
        let poller = Arc::clone(&self.poller);
        let closed = Arc::clone(&self.closed);

        self.pool.spawn(move || {
            if closed.load(Ordering::Acquire) {
                let _ = tx.send(Evaluation::cancelled());
                return;
            }
            let start = Instant::now();
            let evaluation = match poller.lease(preferred) {
                Some(lease) => {
                    catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&source, lease.slot())))
                        .unwrap_or_else(|_| {
                            log::error!("Evaluator panicked in slot {}", lease.slot());
                            Evaluation::new(EvalOutcome::Panicked, start.elapsed())
                        })
                }
                None => Evaluation::new(
                    EvalOutcome::SetupFailed("no free workspace slot".into()),
                    start.elapsed(),
                ),
            };
            let _ = tx.send(evaluation);
        });

        PendingEvaluation { receiver: rx }
    }

    /// Submit and wait.
    pub fn evaluate(&self, source: String) -> Evaluation {
        self.submit(source).wait()
    }

    /// Stop starting new evaluations. Queued ones resolve as cancelled.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Score;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    struct SlotChecker {
        in_use: Mutex<HashSet<usize>>,
        seen: Mutex<HashSet<usize>>,
    }

    impl Evaluator for SlotChecker {
        fn evaluate(&self, _source: &str, slot: usize) -> Evaluation {
            assert!(self.in_use.lock().unwrap().insert(slot), "slot {slot} shared");
            self.seen.lock().unwrap().insert(slot);
            std::thread::sleep(Duration::from_millis(20));
            self.in_use.lock().unwrap().remove(&slot);
            Evaluation::new(EvalOutcome::Scored(Score::Scalar(slot as f64)), Duration::ZERO)
        }
    }

    #[test]
    fn test_round_robin() {
        let poller = SlotPoller::new(3);
        let slots: Vec<usize> = (0..6).map(|_| poller.propose()).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_lease_skips_busy_slot() {
        let poller = Arc::new(SlotPoller::new(2));
        let first = poller.lease(0).unwrap();
        let second = poller.lease(0).unwrap();
        assert_eq!(first.slot(), 0);
        assert_eq!(second.slot(), 1);
        assert!(poller.lease(0).is_none());
        drop(first);
        assert_eq!(poller.lease(1).unwrap().slot(), 0);
    }

    #[test]
    fn test_concurrent_evaluations_never_share_a_slot() {
        let checker = Arc::new(SlotChecker {
            in_use: Mutex::new(HashSet::new()),
            seen: Mutex::new(HashSet::new()),
        });
        let pool = EvaluatorPool::new(checker.clone(), 4).unwrap();

        let pending: Vec<_> = (0..32).map(|i| pool.submit(format!("c{i}"))).collect();
        for p in pending {
            assert!(p.wait().score().is_some());
        }
        assert_eq!(checker.seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_panics_become_outcomes() {
        struct Exploding;
        impl Evaluator for Exploding {
            fn evaluate(&self, _source: &str, _slot: usize) -> Evaluation {
                panic!("boom")
            }
        }
        let pool = EvaluatorPool::new(Arc::new(Exploding), 1).unwrap();
        assert_eq!(pool.evaluate("x".into()).outcome, EvalOutcome::Panicked);
        // The slot was released despite the panic.
        assert_eq!(pool.evaluate("y".into()).outcome, EvalOutcome::Panicked);
    }

    #[test]
    fn test_shutdown_cancels_queued_work() {
        struct Slow;
        impl Evaluator for Slow {
            fn evaluate(&self, _source: &str, _slot: usize) -> Evaluation {
                std::thread::sleep(Duration::from_millis(200));
                Evaluation::new(EvalOutcome::Scored(Score::Scalar(1.0)), Duration::ZERO)
            }
        }
        let pool = EvaluatorPool::new(Arc::new(Slow), 1).unwrap();
        let running = pool.submit("a".into());
        std::thread::sleep(Duration::from_millis(50));
        let queued = pool.submit("b".into());
        pool.shutdown();

        assert!(running.wait().score().is_some());
        assert_eq!(queued.wait().outcome, EvalOutcome::Cancelled);
    }
}
