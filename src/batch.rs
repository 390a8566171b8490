//! Bounded worker pool running many `get_data` calls.
//!
//! Each [`FetchTask`] is one (provider, gauge, variable, range) request. The
//! [`BatchRunner`] spawns one Tokio task per request behind a semaphore, so at
//! most `concurrency` requests are in flight; each request on its own stays
//! sequential. Results come back in submission order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::config::{DEFAULT_CONCURRENCY, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::provider::{Provider, get_data};
use crate::series::CanonicalTimeSeries;

/// Error type for batch runs.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// One request in a batch.
#[derive(Clone)]
pub struct FetchTask {
    /// Adapter to query.
    pub provider: Arc<dyn Provider>,
    /// Gauge identifier.
    pub gauge_id: String,
    /// Variable identifier.
    pub variable_id: String,
    /// Start date (`YYYY-MM-DD`), provider default when `None`.
    pub start: Option<String>,
    /// End date (`YYYY-MM-DD`), today when `None`.
    pub end: Option<String>,
}

impl std::fmt::Debug for FetchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTask")
            .field("provider", &self.provider.name())
            .field("gauge_id", &self.gauge_id)
            .field("variable_id", &self.variable_id)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

impl FetchTask {
    /// Creates a task for the provider's full default range.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        gauge_id: impl Into<String>,
        variable_id: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            gauge_id: gauge_id.into(),
            variable_id: variable_id.into(),
            start: None,
            end: None,
        }
    }

    /// Restricts the task to `[start, end]`.
    #[must_use]
    pub fn with_range(mut self, start: Option<String>, end: Option<String>) -> Self {
        self.start = start;
        self.end = end;
        self
    }
}

/// What happened to one task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Observations were returned.
    Completed {
        /// The request.
        task: FetchTask,
        /// The result.
        series: CanonicalTimeSeries,
    },
    /// The request was valid but nothing came back.
    Empty {
        /// The request.
        task: FetchTask,
        /// The (empty) result.
        series: CanonicalTimeSeries,
    },
    /// The request was rejected or its worker died.
    Failed {
        /// The request.
        task: FetchTask,
        /// Why.
        reason: String,
    },
}

impl TaskOutcome {
    /// The request this outcome belongs to.
    #[must_use]
    pub fn task(&self) -> &FetchTask {
        match self {
            TaskOutcome::Completed { task, .. }
            | TaskOutcome::Empty { task, .. }
            | TaskOutcome::Failed { task, .. } => task,
        }
    }

    /// The series, unless the task failed.
    #[must_use]
    pub fn series(&self) -> Option<&CanonicalTimeSeries> {
        match self {
            TaskOutcome::Completed { series, .. } | TaskOutcome::Empty { series, .. } => {
                Some(series)
            }
            TaskOutcome::Failed { .. } => None,
        }
    }
}

/// Counters for a batch run, safe to read while it is in progress.
#[derive(Debug, Default)]
pub struct BatchStats {
    completed: AtomicUsize,
    empty: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchStats {
    /// Creates a new stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks that returned observations.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Tasks that returned an empty series.
    #[must_use]
    pub fn empty(&self) -> usize {
        self.empty.load(Ordering::SeqCst)
    }

    /// Tasks that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// All finished tasks.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.empty() + self.failed()
    }

    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Completed { .. } => &self.completed,
            TaskOutcome::Empty { .. } => &self.empty,
            TaskOutcome::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Receives an event each time a task finishes, in completion order.
pub trait BatchObserver: Send + Sync {
    /// Called from the worker that ran the task.
    fn on_finished(&self, outcome: &TaskOutcome, stats: &BatchStats);
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BatchObserver for NoopObserver {
    fn on_finished(&self, _: &TaskOutcome, _: &BatchStats) {}
}

/// Result of [`BatchRunner::run`].
#[derive(Debug)]
pub struct BatchReport {
    /// One outcome per task, in submission order.
    pub outcomes: Vec<TaskOutcome>,
    /// Final counters.
    pub stats: Arc<BatchStats>,
}

/// Runs fetch tasks concurrently under a fixed limit.
#[derive(Debug)]
pub struct BatchRunner {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl BatchRunner {
    /// Creates a runner allowing `concurrency` tasks in flight.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidConcurrency`] if the value is outside
    /// 1..=100.
    #[instrument(level = "debug")]
    pub fn new(concurrency: usize) -> Result<Self, BatchError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(BatchError::InvalidConcurrency { value: concurrency });
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs every task and waits for all of them.
    ///
    /// Individual task failures do not fail the run; they are counted and
    /// reported as [`TaskOutcome::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::SemaphoreClosed`] if the semaphore is closed.
    #[instrument(skip(self, tasks, observer), fields(tasks = tasks.len(), concurrency = self.concurrency))]
    pub async fn run(
        &self,
        tasks: Vec<FetchTask>,
        observer: Arc<dyn BatchObserver>,
    ) -> Result<BatchReport, BatchError> {
        let stats = Arc::new(BatchStats::new());
        let mut handles = Vec::with_capacity(tasks.len());
        info!("starting batch");

        for task in tasks {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| BatchError::SemaphoreClosed)?;

            let stats = Arc::clone(&stats);
            let observer = Arc::clone(&observer);
            let spawned = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = execute(spawned).await;
                stats.record(&outcome);
                observer.on_finished(&outcome, &stats);
                outcome
            });
            handles.push((task, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (task, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    warn!(gauge_id = %task.gauge_id, error = %error, "worker task died");
                    let outcome = TaskOutcome::Failed {
                        task,
                        reason: format!("worker task died: {error}"),
                    };
                    stats.record(&outcome);
                    observer.on_finished(&outcome, &stats);
                    outcomes.push(outcome);
                }
            }
        }

        info!(
            completed = stats.completed(),
            empty = stats.empty(),
            failed = stats.failed(),
            "batch finished"
        );
        Ok(BatchReport { outcomes, stats })
    }
}

async fn execute(task: FetchTask) -> TaskOutcome {
    debug!(
        provider = task.provider.name(),
        gauge_id = %task.gauge_id,
        variable = %task.variable_id,
        "task started"
    );
    let result = get_data(
        task.provider.as_ref(),
        &task.gauge_id,
        &task.variable_id,
        task.start.as_deref(),
        task.end.as_deref(),
    )
    .await;
    match result {
        Ok(series) if series.is_empty() => TaskOutcome::Empty { task, series },
        Ok(series) => TaskOutcome::Completed { task, series },
        Err(error) => {
            warn!(gauge_id = %task.gauge_id, error = %error, "task rejected");
            TaskOutcome::Failed {
                task,
                reason: error.to_string(),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::provider::{DateWindow, ProviderError, RawData, RawPage};
    use crate::series::Observation;
    use crate::variable::{Aggregation, Quantity, Resolution, Variable, VariableSet, variable_set};

    /// Sleeps, tracks peak concurrency, and returns one value for gauges
    /// other than `"dry"`.
    struct SlowStub {
        variables: VariableSet,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowStub {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                variables: variable_set(&[(
                    Quantity::Discharge,
                    Resolution::Daily,
                    Aggregation::Mean,
                )]),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for SlowStub {
        fn name(&self) -> &str {
            "slow"
        }

        fn available_variables(&self) -> &VariableSet {
            &self.variables
        }

        async fn download(
            &self,
            gauge_id: &str,
            _: &Variable,
            window: DateWindow,
        ) -> Result<RawData, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if gauge_id == "dry" {
                return Ok(RawData::Observations(Vec::new()));
            }
            Ok(RawData::Observations(vec![Observation::on_date(
                window.start,
                Some(1.0),
            )]))
        }

        fn parse_chunk(
            &self,
            _: &str,
            _: &RawPage,
            _: &Variable,
        ) -> Result<Vec<Observation>, ProviderError> {
            Ok(Vec::new())
        }
    }

    fn task(stub: &Arc<SlowStub>, gauge: &str, variable: &str) -> FetchTask {
        FetchTask::new(stub.clone(), gauge, variable)
            .with_range(Some("2020-01-01".to_string()), Some("2020-01-02".to_string()))
    }

    // ==================== Construction Tests ====================

    #[test]
    fn test_runner_rejects_out_of_range_concurrency() {
        assert!(matches!(
            BatchRunner::new(0),
            Err(BatchError::InvalidConcurrency { value: 0 })
        ));
        assert!(BatchRunner::new(101).is_err());
        assert_eq!(BatchRunner::new(100).unwrap().concurrency(), 100);
        assert_eq!(BatchRunner::default().concurrency(), 1);
    }

    // ==================== Run Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_run_respects_concurrency_limit() {
        let stub = SlowStub::new();
        let tasks: Vec<_> = (0..6)
            .map(|i| task(&stub, &format!("g{i}"), "discharge-daily-mean"))
            .collect();

        let report = BatchRunner::new(2)
            .unwrap()
            .run(tasks, Arc::new(NoopObserver))
            .await
            .unwrap();

        assert_eq!(report.stats.completed(), 6);
        assert_eq!(stub.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_in_submission_order_and_counts_kinds() {
        let stub = SlowStub::new();
        let tasks = vec![
            task(&stub, "a", "discharge-daily-mean"),
            task(&stub, "dry", "discharge-daily-mean"),
            task(&stub, "b", "stage-daily-mean"),
        ];

        let report = BatchRunner::new(3)
            .unwrap()
            .run(tasks, Arc::new(NoopObserver))
            .await
            .unwrap();

        let gauges: Vec<_> = report.outcomes.iter().map(|o| o.task().gauge_id.as_str()).collect();
        assert_eq!(gauges, vec!["a", "dry", "b"]);
        assert!(matches!(report.outcomes[0], TaskOutcome::Completed { .. }));
        assert!(matches!(report.outcomes[1], TaskOutcome::Empty { .. }));
        assert!(matches!(report.outcomes[2], TaskOutcome::Failed { .. }));
        assert_eq!(report.stats.total(), 3);
        assert_eq!(
            report.outcomes[0].series().unwrap().observations()[0].timestamp.date_naive(),
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_task() {
        struct Counting(AtomicUsize);
        impl BatchObserver for Counting {
            fn on_finished(&self, _: &TaskOutcome, _: &BatchStats) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let stub = SlowStub::new();
        let observer = Arc::new(Counting(AtomicUsize::new(0)));
        let tasks: Vec<_> = (0..4)
            .map(|i| task(&stub, &format!("g{i}"), "discharge-daily-mean"))
            .collect();
        BatchRunner::new(4)
            .unwrap()
            .run(tasks, observer.clone())
            .await
            .unwrap();
        assert_eq!(observer.0.load(Ordering::SeqCst), 4);
    }
}
