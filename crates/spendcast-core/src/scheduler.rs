//! Background refresh scheduler
//!
//! Recomputes and republishes every user's forecast on a fixed interval,
//! configured in `[schedule]` (or `SPENDCAST_REFRESH_HOURS`).
//!
//! - Users run concurrently, at most `max_parallel_users` at a time.
//! - Model work runs on the blocking pool under `run_timeout`. A run that
//!   times out is dropped before publishing, so the previous artifact stays.
//! - A failing user never affects other users. After
//!   `fallback_after_failures` consecutive failures the user's next run uses
//!   the moving-average baseline; any success resets the count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::MAX_INTERVAL_HOURS;
use crate::error::Error;
use crate::forecast::ModelChoice;
use crate::pipeline::Pipeline;
use crate::source::ExpenseSource;

/// What happened to one user in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Published { version: u64 },
    /// Not enough history yet; not counted as a failure
    Skipped { reason: String },
    Failed { error: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRun {
    pub user_id: String,
    pub model: ModelChoice,
    pub outcome: RunOutcome,
}

/// Summary of one refresh cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Per-user results, sorted by user id
    pub runs: Vec<UserRun>,
    /// Set when the user list itself could not be read
    pub error: Option<String>,
}

impl CycleReport {
    pub fn published(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Published { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Failed { .. } | RunOutcome::TimedOut))
    }

    pub fn run_for(&self, user_id: &str) -> Option<&UserRun> {
        self.runs.iter().find(|r| r.user_id == user_id)
    }

    fn count(&self, pred: impl Fn(&RunOutcome) -> bool) -> usize {
        self.runs.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Periodic per-user forecast refresh
#[derive(Clone)]
pub struct RefreshScheduler {
    pipeline: Arc<Pipeline>,
    source: Arc<dyn ExpenseSource>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl RefreshScheduler {
    pub fn new(pipeline: Arc<Pipeline>, source: Arc<dyn ExpenseSource>) -> Self {
        Self {
            pipeline,
            source,
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consecutive failures recorded for a user
    pub fn failure_count(&self, user_id: &str) -> u32 {
        self.failures
            .lock()
            .map(|f| f.get(user_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Model the next run for this user will use
    pub fn model_for(&self, user_id: &str) -> ModelChoice {
        let config = self.pipeline.config();
        let threshold = config.schedule.fallback_after_failures;
        if threshold > 0 && self.failure_count(user_id) >= threshold {
            ModelChoice::MovingAverage
        } else {
            config.forecast.model
        }
    }

    /// Spawn the scheduler loop
    ///
    /// The first cycle runs immediately when `run_on_start` is set, otherwise
    /// after one interval.
    pub fn start(self) -> JoinHandle<()> {
        let schedule = self.pipeline.config().schedule.clone();
        info!(
            interval_hours = schedule.interval_hours,
            max_parallel_users = schedule.max_parallel_users,
            "Starting refresh scheduler"
        );

        tokio::spawn(async move {
            let hours = schedule.interval_hours.clamp(1, MAX_INTERVAL_HOURS);
            let period = Duration::from_secs(hours * 3600);
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // The first tick completes immediately
            if !schedule.run_on_start {
                ticker.tick().await;
            }

            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// Refresh every user once
    pub async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        info!("Running refresh cycle...");

        let source = self.source.clone();
        let users = match tokio::task::spawn_blocking(move || source.users()).await {
            Ok(Ok(users)) => users,
            Ok(Err(e)) => return self.aborted(started_at, e.to_string()),
            Err(e) => return self.aborted(started_at, e.to_string()),
        };

        let permits = Arc::new(Semaphore::new(
            self.pipeline.config().schedule.max_parallel_users.max(1),
        ));
        let mut tasks = JoinSet::new();
        for user in users {
            let scheduler = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                scheduler.run_user(&user).await
            });
        }

        let mut runs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => runs.push(run),
                Err(e) => error!(error = %e, "Refresh task panicked"),
            }
        }
        runs.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let report = CycleReport {
            started_at,
            finished_at: Utc::now(),
            runs,
            error: None,
        };
        info!(
            published = report.published(),
            skipped = report.skipped(),
            failed = report.failed(),
            "Refresh cycle complete"
        );
        report
    }

    /// Compute and publish one user under the run timeout
    pub async fn run_user(&self, user_id: &str) -> UserRun {
        let model = self.model_for(user_id);
        let run_timeout = self.pipeline.config().schedule.run_timeout;

        let pipeline = self.pipeline.clone();
        let source = self.source.clone();
        let user = user_id.to_string();
        let compute = tokio::task::spawn_blocking(move || {
            let records = source.records(&user, None)?;
            pipeline.compute(&user, &records, model)
        });

        let output = match timeout(run_timeout, compute).await {
            Err(_) => {
                return self.record(user_id, model, RunOutcome::TimedOut);
            }
            Ok(Err(e)) => {
                let outcome = RunOutcome::Failed {
                    error: format!("Run task failed: {}", e),
                };
                return self.record(user_id, model, outcome);
            }
            Ok(Ok(Err(e))) => return self.record_error(user_id, model, e),
            Ok(Ok(Ok(output))) => output,
        };

        let pipeline = self.pipeline.clone();
        let published = tokio::task::spawn_blocking(move || pipeline.publish(&output)).await;
        match published {
            Ok(Ok(handle)) => self.record(
                user_id,
                model,
                RunOutcome::Published {
                    version: handle.version,
                },
            ),
            Ok(Err(e)) => self.record_error(user_id, model, e),
            Err(e) => self.record(
                user_id,
                model,
                RunOutcome::Failed {
                    error: format!("Publish task failed: {}", e),
                },
            ),
        }
    }

    /// Errors the same expenses would reproduce are skipped, not failed, so
    /// they never push a user onto the fallback model
    fn record_error(&self, user_id: &str, model: ModelChoice, e: Error) -> UserRun {
        let outcome = if e.is_retryable() {
            RunOutcome::Failed {
                error: e.to_string(),
            }
        } else {
            RunOutcome::Skipped {
                reason: e.to_string(),
            }
        };
        self.record(user_id, model, outcome)
    }

    /// Update the failure counter and log the outcome
    fn record(&self, user_id: &str, model: ModelChoice, outcome: RunOutcome) -> UserRun {
        let threshold = self.pipeline.config().schedule.fallback_after_failures;
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match &outcome {
            RunOutcome::Published { version } => {
                failures.remove(user_id);
                info!(user = user_id, model = %model, version, "Refreshed forecast");
            }
            RunOutcome::Skipped { reason } => {
                info!(user = user_id, reason = %reason, "Skipped forecast refresh");
            }
            RunOutcome::Failed { .. } | RunOutcome::TimedOut => {
                let count = failures.entry(user_id.to_string()).or_insert(0);
                *count += 1;
                let detail = match &outcome {
                    RunOutcome::Failed { error } => error.as_str(),
                    _ => "timed out",
                };
                if threshold > 0 && *count >= threshold {
                    error!(
                        user = user_id,
                        model = %model,
                        failures = *count,
                        error = detail,
                        "Forecast refresh keeps failing, falling back to baseline model"
                    );
                } else {
                    warn!(
                        user = user_id,
                        model = %model,
                        failures = *count,
                        error = detail,
                        "Forecast refresh failed"
                    );
                }
            }
        }

        UserRun {
            user_id: user_id.to_string(),
            model,
            outcome,
        }
    }

    fn aborted(&self, started_at: DateTime<Utc>, error: String) -> CycleReport {
        error!(error = %error, "Failed to list users for refresh");
        CycleReport {
            started_at,
            finished_at: Utc::now(),
            runs: Vec::new(),
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, PublisherConfig};
    use crate::models::{DateRange, ExpenseRecord};
    use crate::publish::ArtifactStore;
    use crate::source::MemorySource;
    use crate::test_utils::{alternating, daily_records};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.publisher = PublisherConfig {
            artifact_dir: dir.path().to_path_buf(),
            history_limit: 5,
        };
        config
    }

    fn scheduler(config: PipelineConfig, source: impl ExpenseSource + 'static) -> RefreshScheduler {
        let store = ArtifactStore::from_config(&config.publisher).unwrap();
        RefreshScheduler::new(Arc::new(Pipeline::new(config, store)), Arc::new(source))
    }

    /// Source whose reads take longer than the run timeout
    struct SlowSource {
        inner: MemorySource,
        delay: Duration,
    }

    impl ExpenseSource for SlowSource {
        fn users(&self) -> crate::Result<Vec<String>> {
            self.inner.users()
        }

        fn records(
            &self,
            user_id: &str,
            range: Option<DateRange>,
        ) -> crate::Result<Vec<ExpenseRecord>> {
            std::thread::sleep(self.delay);
            self.inner.records(user_id, range)
        }
    }

    #[tokio::test]
    async fn test_cycle_publishes_each_user() {
        let dir = TempDir::new().unwrap();
        let mut records = daily_records("alice", &alternating(60));
        records.extend(daily_records("bob", &alternating(60)));
        records.extend(daily_records("carol", &[5.0; 3]));
        let scheduler = scheduler(config(&dir), MemorySource::new(records));

        let report = scheduler.run_cycle().await;

        assert!(report.error.is_none());
        assert_eq!(report.runs.len(), 3);
        assert_eq!(report.published(), 2);
        assert_eq!(report.skipped(), 1);
        assert!(matches!(
            report.run_for("carol").unwrap().outcome,
            RunOutcome::Skipped { .. }
        ));
        // Insufficient history is not a failure
        assert_eq!(scheduler.failure_count("carol"), 0);

        let report = scheduler.run_cycle().await;
        assert_eq!(
            report.run_for("alice").unwrap().outcome,
            RunOutcome::Published { version: 2 }
        );
    }

    #[tokio::test]
    async fn test_repeated_failures_fall_back_to_baseline() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        // Unregularized fit on a constant series is singular
        config.forecast.ridge_lambda = 0.0;
        config.schedule.fallback_after_failures = 2;
        let scheduler = scheduler(config, MemorySource::new(daily_records("alice", &[30.0; 40])));

        for expected in 1..=2 {
            let run = scheduler.run_user("alice").await;
            assert_eq!(run.model, ModelChoice::WindowedRegression);
            assert!(matches!(run.outcome, RunOutcome::Failed { .. }));
            assert_eq!(scheduler.failure_count("alice"), expected);
        }

        let run = scheduler.run_user("alice").await;
        assert_eq!(run.model, ModelChoice::MovingAverage);
        assert_eq!(run.outcome, RunOutcome::Published { version: 1 });
        assert_eq!(scheduler.failure_count("alice"), 0);
        assert_eq!(scheduler.model_for("alice"), ModelChoice::WindowedRegression);
    }

    #[tokio::test]
    async fn test_invalid_data_is_skipped_not_failed() {
        let dir = TempDir::new().unwrap();
        // Computes fine, but the id cannot name an artifact directory
        let scheduler = scheduler(
            config(&dir),
            MemorySource::new(daily_records("bob smith", &alternating(60))),
        );

        for _ in 0..4 {
            let run = scheduler.run_user("bob smith").await;
            assert!(matches!(run.outcome, RunOutcome::Skipped { .. }));
        }
        assert_eq!(scheduler.failure_count("bob smith"), 0);
        assert_eq!(scheduler.model_for("bob smith"), ModelChoice::WindowedRegression);
    }

    #[tokio::test]
    async fn test_timed_out_run_is_never_published() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.schedule.run_timeout = Duration::from_millis(50);
        let source = SlowSource {
            inner: MemorySource::new(daily_records("alice", &alternating(60))),
            delay: Duration::from_millis(300),
        };
        let scheduler = scheduler(config, source);

        let run = scheduler.run_user("alice").await;
        assert_eq!(run.outcome, RunOutcome::TimedOut);
        assert_eq!(scheduler.failure_count("alice"), 1);

        // Let the abandoned blocking task finish
        tokio::time::sleep(Duration::from_millis(600)).await;
        let store = ArtifactStore::new(dir.path(), 5).unwrap();
        assert!(matches!(store.read_latest("alice"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_single_permit_still_runs_everyone() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.schedule.max_parallel_users = 1;
        let mut records = Vec::new();
        for user in ["u1", "u2", "u3", "u4"] {
            records.extend(daily_records(user, &alternating(60)));
        }
        let scheduler = scheduler(config, MemorySource::new(records));

        let report = scheduler.run_cycle().await;
        assert_eq!(report.published(), 4);
        let users: Vec<&str> = report.runs.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(users, vec!["u1", "u2", "u3", "u4"]);
    }
}
