//! Bounded-concurrency execution of evaluation jobs
//!
//! One job per combination. At most `workers` jobs are in flight at any time.
//! Each job writes only its own result slot (indexed by combination id), so the
//! final outcome set does not depend on completion order. Cancellation is
//! cooperative: it is checked before a job starts, never while one is running.

use indicatif::ProgressBar;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::evaluation::{EvaluationClient, Evaluator};
use crate::types::{
    Combination, DateRange, EvaluationFailure, EvaluationOutcome, FailureKind, Phase,
};

/// Smoothing factor of the job-duration moving average
const DURATION_EMA_ALPHA: f64 = 0.2;

/// Worker count matching the available compute
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cloneable cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Read-only view of a batch in progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub avg_job_duration: Option<Duration>,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn succeeded(&self) -> usize {
        self.completed.saturating_sub(self.failed)
    }
}

#[derive(Debug)]
struct ProgressTracker {
    total: usize,
    workers: usize,
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    /// f64 bits of the moving average in seconds, 0 until the first sample
    avg_secs_bits: AtomicU64,
    started: Instant,
}

impl ProgressTracker {
    fn new(total: usize, workers: usize) -> Self {
        Self {
            total,
            workers,
            dispatched: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            avg_secs_bits: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn record(&self, duration: Duration, success: bool) {
        let sample = duration.as_secs_f64();
        let _ = self
            .avg_secs_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let avg = f64::from_bits(bits);
                let next = if bits == 0 {
                    sample
                } else {
                    DURATION_EMA_ALPHA * sample + (1.0 - DURATION_EMA_ALPHA) * avg
                };
                Some(next.to_bits())
            });

        // `completed` first: a reader that loads `failed` before `completed`
        // never sees more failures than completions
        self.completed.fetch_add(1, Ordering::AcqRel);
        if !success {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// A job whose task died without reporting
    fn record_aborted(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let failed = self.failed.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire);
        let dispatched = self.dispatched.load(Ordering::Acquire);
        let bits = self.avg_secs_bits.load(Ordering::Acquire);
        let avg = (bits != 0).then(|| Duration::from_secs_f64(f64::from_bits(bits)));
        let remaining = self.total.saturating_sub(completed);
        let eta = avg.map(|avg| {
            let waves = remaining as f64 / self.workers.max(1) as f64;
            Duration::from_secs_f64(avg.as_secs_f64() * waves)
        });

        ProgressSnapshot {
            total: self.total,
            dispatched,
            completed,
            failed,
            in_flight: dispatched.saturating_sub(completed),
            avg_job_duration: avg,
            eta,
            elapsed: self.started.elapsed(),
        }
    }
}

type TrackerSlot = Arc<Mutex<Option<Arc<ProgressTracker>>>>;

/// Handle for observing the current (or most recent) batch from another task
#[derive(Debug, Clone)]
pub struct ProgressHandle(TrackerSlot);

impl ProgressHandle {
    /// `None` until the first batch starts
    pub fn snapshot(&self) -> Option<ProgressSnapshot> {
        let current = self.0.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(|t| t.snapshot())
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Outcomes of one batch, indexed like the input combinations
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// `None` for jobs never started because of cancellation
    pub outcomes: Vec<Option<EvaluationOutcome>>,
    pub cancelled: bool,
    pub progress: ProgressSnapshot,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.as_ref().is_some_and(|o| o.is_success()))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.as_ref().is_some_and(|o| !o.is_success()))
            .count()
    }
}

pub struct ExecutionCoordinator<E> {
    client: Arc<EvaluationClient<E>>,
    workers: usize,
    cancel: CancelToken,
    progress_bar: Option<ProgressBar>,
    current: TrackerSlot,
}

impl<E: Evaluator> ExecutionCoordinator<E> {
    pub fn new(client: Arc<EvaluationClient<E>>, workers: usize) -> Self {
        Self {
            client,
            workers: workers.max(1),
            cancel: CancelToken::new(),
            progress_bar: None,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress_bar(mut self, progress_bar: ProgressBar) -> Self {
        self.progress_bar = Some(progress_bar);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn client(&self) -> &EvaluationClient<E> {
        &self.client
    }

    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle(self.current.clone())
    }

    /// Evaluate every combination over `period`
    pub async fn execute(
        &self,
        strategy: &str,
        combinations: &[Combination],
        period: DateRange,
        symbols: &[String],
        phase: Phase,
    ) -> BatchResult {
        let total = combinations.len();
        let tracker = Arc::new(ProgressTracker::new(total, self.workers));
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(tracker.clone());
        let slots: Arc<Vec<OnceLock<EvaluationOutcome>>> =
            Arc::new((0..total).map(|_| OnceLock::new()).collect());
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let strategy: Arc<str> = Arc::from(strategy);
        let symbols: Arc<[String]> = Arc::from(symbols);

        if let Some(pb) = &self.progress_bar {
            pb.set_length(total as u64);
            pb.set_position(0);
            pb.set_message(format!("{} phase", phase));
        }

        info!(
            "Dispatching {} {} evaluations over {} with {} workers",
            total, phase, period, self.workers
        );

        let mut tasks = JoinSet::new();
        let mut cancelled = false;
        let mut dispatched = 0usize;

        for (slot, combination) in combinations.iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            tracker.dispatched.fetch_add(1, Ordering::AcqRel);
            dispatched += 1;

            let client = self.client.clone();
            let slots = slots.clone();
            let tracker = tracker.clone();
            let strategy = strategy.clone();
            let symbols = symbols.clone();
            let combination = combination.clone();
            let progress_bar = self.progress_bar.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                let outcome = client
                    .evaluate(&strategy, &combination, period, &symbols)
                    .await;
                let success = outcome.is_success();
                if slots[slot].set(outcome).is_err() {
                    error!(combination = combination.index, "Result slot written twice");
                }
                tracker.record(started.elapsed(), success);

                if let Some(pb) = progress_bar {
                    pb.inc(1);
                    let snap = tracker.snapshot();
                    pb.set_message(format!(
                        "{} ok, {} failed{}",
                        snap.succeeded(),
                        snap.failed,
                        snap.eta
                            .map(|eta| format!(", eta {}s", eta.as_secs()))
                            .unwrap_or_default()
                    ));
                }
            });
        }

        if cancelled {
            warn!(
                "Cancellation requested: {} of {} {} jobs dispatched, waiting for in-flight jobs",
                dispatched, total, phase
            );
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Evaluation task aborted: {}", e);
            }
        }

        let slots = match Arc::try_unwrap(slots) {
            Ok(slots) => slots,
            Err(shared) => shared.iter().map(|s| clone_slot(s)).collect(),
        };

        let outcomes: Vec<Option<EvaluationOutcome>> = slots
            .into_iter()
            .enumerate()
            .map(|(slot, cell)| match cell.into_inner() {
                Some(outcome) => Some(outcome),
                // Dispatch is in order, so any unfilled slot below `dispatched` lost its task
                None if slot < dispatched => {
                    tracker.record_aborted();
                    Some(EvaluationOutcome::Failure(EvaluationFailure {
                        kind: FailureKind::Aborted,
                        message: "evaluation task aborted before recording a result".to_string(),
                        attempts: 0,
                    }))
                }
                None => None,
            })
            .collect();

        let progress = tracker.snapshot();
        if let Some(pb) = &self.progress_bar {
            pb.set_message(format!("{} ok, {} failed", progress.succeeded(), progress.failed));
        }

        debug!(
            "{} batch finished: {} completed, {} failed, cancelled={}",
            phase, progress.completed, progress.failed, cancelled
        );

        BatchResult {
            outcomes,
            cancelled,
            progress,
        }
    }
}

fn clone_slot(slot: &OnceLock<EvaluationOutcome>) -> OnceLock<EvaluationOutcome> {
    let cell = OnceLock::new();
    if let Some(outcome) = slot.get() {
        let _ = cell.set(outcome.clone());
    }
    cell
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluationError;
    use crate::evaluation::{CircuitBreakerConfig, EvaluationRequest, RetryPolicy};
    use crate::types::{Metric, MetricBundle, ParamValue};
    use chrono::NaiveDate;

    fn period() -> DateRange {
        DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        )
        .unwrap()
    }

    fn combos(n: usize) -> Vec<Combination> {
        (0..n)
            .map(|i| Combination {
                index: i,
                values: vec![crate::types::ParamAssignment {
                    name: "n".to_string(),
                    value: ParamValue::Int(i as i64),
                }],
            })
            .collect()
    }

    /// Sleeps briefly and tracks the peak number of concurrent calls
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        fail_index: Option<usize>,
    }

    impl Evaluator for Gauge {
        async fn evaluate(&self, request: &EvaluationRequest) -> Result<MetricBundle, EvaluationError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if Some(request.combination.index) == self.fail_index {
                return Err(EvaluationError::Rejected("forced".to_string()));
            }
            Ok(MetricBundle::from_iter([(
                Metric::SharpeRatio,
                request.combination.index as f64,
            )]))
        }
    }

    fn client(fail_index: Option<usize>) -> Arc<EvaluationClient<Gauge>> {
        Arc::new(EvaluationClient::new(
            Gauge {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail_index,
            },
            RetryPolicy::default().with_max_retries(0),
            CircuitBreakerConfig::default(),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_ceiling_is_respected() {
        let client = client(None);
        let coordinator = ExecutionCoordinator::new(client.clone(), 3);
        let result = coordinator
            .execute("s", &combos(20), period(), &[], Phase::Train)
            .await;

        assert_eq!(result.success_count(), 20);
        let peak = client_peak(&client);
        assert!(peak <= 3, "peak concurrency {} exceeded 3", peak);
    }

    fn client_peak(client: &EvaluationClient<Gauge>) -> usize {
        client.evaluator().peak.load(Ordering::SeqCst)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_does_not_stop_batch() {
        let coordinator = ExecutionCoordinator::new(client(Some(2)), 4);
        let result = coordinator
            .execute("s", &combos(6), period(), &[], Phase::Train)
            .await;

        assert_eq!(result.success_count(), 5);
        assert_eq!(result.failure_count(), 1);
        assert!(!result.outcomes[2].as_ref().unwrap().is_success());
        assert_eq!(result.progress.completed, 6);
        assert_eq!(result.progress.failed, 1);
    }

    #[tokio::test]
    async fn test_outcomes_are_keyed_by_index() {
        let coordinator = ExecutionCoordinator::new(client(None), 8);
        let result = coordinator
            .execute("s", &combos(10), period(), &[], Phase::Train)
            .await;

        for (i, outcome) in result.outcomes.iter().enumerate() {
            let sharpe = outcome
                .as_ref()
                .and_then(|o| o.metrics())
                .and_then(|m| m.get(Metric::SharpeRatio));
            assert_eq!(sharpe, Some(i as f64));
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_dispatches_nothing() {
        let coordinator = ExecutionCoordinator::new(client(None), 2);
        coordinator.cancel_token().cancel();
        let result = coordinator
            .execute("s", &combos(5), period(), &[], Phase::Train)
            .await;

        assert!(result.cancelled);
        assert!(result.outcomes.iter().all(|o| o.is_none()));
        assert_eq!(result.progress.dispatched, 0);
    }

    #[test]
    fn test_eta_uses_moving_average() {
        let tracker = ProgressTracker::new(10, 2);
        assert!(tracker.snapshot().eta.is_none());
        tracker.dispatched.store(2, Ordering::SeqCst);
        tracker.record(Duration::from_secs(2), true);
        tracker.record(Duration::from_secs(2), false);

        let snap = tracker.snapshot();
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.in_flight, 0);
        // 8 remaining jobs, 2 workers, 2s each
        assert_eq!(snap.eta, Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_succeeded_never_underflows() {
        let snap = ProgressSnapshot {
            total: 4,
            dispatched: 3,
            completed: 1,
            failed: 2,
            in_flight: 2,
            avg_job_duration: None,
            eta: None,
            elapsed: Duration::ZERO,
        };
        assert_eq!(snap.succeeded(), 0);
    }

    #[test]
    fn test_snapshots_during_failing_records_stay_consistent() {
        let tracker = Arc::new(ProgressTracker::new(4000, 4));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.record(Duration::from_millis(1), false);
                    }
                })
            })
            .collect();

        while writers.iter().any(|w| !w.is_finished()) {
            let snap = tracker.snapshot();
            assert!(snap.failed <= snap.completed, "{:?}", snap);
            assert_eq!(snap.succeeded(), snap.completed - snap.failed);
        }
        for w in writers {
            w.join().unwrap();
        }

        let snap = tracker.snapshot();
        assert_eq!(snap.completed, 4000);
        assert_eq!(snap.failed, 4000);
        assert_eq!(snap.succeeded(), 0);
    }
}
