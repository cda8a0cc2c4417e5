use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::scoring::{ScoringResult, ScoringService};

pub const SNAPSHOT_JOB: &str = "snapshot-leaderboard";

#[async_trait]
pub trait SnapshotTask: Send + Sync {
    /// Returns the number of rows written.
    async fn snapshot(&self, cancel: &CancellationToken) -> ScoringResult<usize>;
}

#[async_trait]
impl SnapshotTask for ScoringService {
    async fn snapshot(&self, cancel: &CancellationToken) -> ScoringResult<usize> {
        self.create_leaderboard_snapshot(cancel).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Bound on a single run.
    pub timeout: Duration,
    /// How long shutdown waits for a run already in progress.
    pub grace: Duration,
}

/// Periodic snapshot trigger. At most one run executes at a time; a firing that finds the
/// previous run still going is skipped.
pub struct SnapshotScheduler {
    task: Arc<dyn SnapshotTask>,
    config: SchedulerConfig,
    running: Arc<Mutex<()>>,
    // runs outlive the shutdown signal by up to `grace`, so they get their own token
    run_cancel: CancellationToken,
}

impl SnapshotScheduler {
    pub fn new(task: Arc<dyn SnapshotTask>, config: SchedulerConfig) -> Self {
        Self {
            task,
            config,
            running: Arc::new(Mutex::new(())),
            run_cancel: CancellationToken::new(),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.interval.max(Duration::from_secs(1));
        let mut tick = tokio::time::interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(job = SNAPSHOT_JOB, interval = ?period, "scheduler started");

        let mut in_flight: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = tick.tick() => {
                    if let Some(handle) = self.fire() {
                        in_flight = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = in_flight.filter(|handle| !handle.is_finished()) {
            self.drain(handle).await;
        }

        tracing::info!(job = SNAPSHOT_JOB, "scheduler stopped");
    }

    /// Starts one run in the background unless the previous one still holds the lock.
    pub fn fire(&self) -> Option<JoinHandle<()>> {
        let Ok(guard) = self.running.clone().try_lock_owned() else {
            tracing::warn!(job = SNAPSHOT_JOB, "previous run still executing; firing skipped");
            return None;
        };

        let task = self.task.clone();
        let cancel = self.run_cancel.clone();
        let limit = self.config.timeout;

        Some(tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();

            match tokio::time::timeout(limit, task.snapshot(&cancel)).await {
                Ok(Ok(rows)) => tracing::info!(
                    job = SNAPSHOT_JOB,
                    rows,
                    elapsed = ?started.elapsed(),
                    "snapshot run complete"
                ),
                Ok(Err(e)) => tracing::error!(job = SNAPSHOT_JOB, error = %e, "snapshot run failed"),
                Err(_) => tracing::warn!(job = SNAPSHOT_JOB, ?limit, "snapshot run timed out"),
            }
        }))
    }

    async fn drain(&self, mut handle: JoinHandle<()>) {
        tracing::info!(job = SNAPSHOT_JOB, grace = ?self.config.grace, "waiting for in-flight run");

        if tokio::time::timeout(self.config.grace, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(job = SNAPSHOT_JOB, "in-flight run exceeded shutdown grace; aborting");
            self.run_cancel.cancel();
            handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeTask {
        delay: Duration,
        started: AtomicUsize,
        completed: AtomicUsize,
    }

    impl FakeTask {
        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl SnapshotTask for FakeTask {
        async fn snapshot(&self, _cancel: &CancellationToken) -> ScoringResult<usize> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn config(interval: u64, timeout: u64, grace: u64) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
            grace: Duration::from_secs(grace),
        }
    }

    async fn run_for(scheduler: Arc<SnapshotScheduler>, cancel_after: Duration) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        });

        tokio::time::sleep(cancel_after).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_per_interval() {
        let task = FakeTask::slow(Duration::ZERO);
        let scheduler = Arc::new(SnapshotScheduler::new(task.clone(), config(10, 5, 5)));

        run_for(scheduler, Duration::from_secs(35)).await;

        assert_eq!(task.started.load(Ordering::SeqCst), 3);
        assert_eq!(task.completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_firing_is_skipped() {
        let task = FakeTask::slow(Duration::from_secs(30));
        let scheduler = SnapshotScheduler::new(task.clone(), config(10, 60, 5));

        let first = scheduler.fire().expect("first firing runs");
        tokio::task::yield_now().await;
        assert!(scheduler.fire().is_none());

        first.await.unwrap();
        assert_eq!(task.completed.load(Ordering::SeqCst), 1);

        let again = scheduler.fire().expect("lock released after the run");
        again.await.unwrap();
        assert_eq!(task.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_is_bounded_by_timeout() {
        let task = FakeTask::slow(Duration::from_secs(100));
        let scheduler = SnapshotScheduler::new(task.clone(), config(10, 5, 5));
        let started = Instant::now();

        scheduler.fire().unwrap().await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(task.started.load(Ordering::SeqCst), 1);
        assert_eq!(task.completed.load(Ordering::SeqCst), 0);
        // the timed-out run released the lock
        assert!(scheduler.fire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_run() {
        let task = FakeTask::slow(Duration::from_secs(3));
        let scheduler = Arc::new(SnapshotScheduler::new(task.clone(), config(1, 60, 10)));

        // fires at 1s, still running when cancelled at 2s
        run_for(scheduler, Duration::from_secs(2)).await;

        assert_eq!(task.started.load(Ordering::SeqCst), 1);
        assert_eq!(task.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_grace() {
        let task = FakeTask::slow(Duration::from_secs(60));
        let scheduler = Arc::new(SnapshotScheduler::new(task.clone(), config(1, 120, 5)));
        let started = Instant::now();

        run_for(scheduler, Duration::from_secs(2)).await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(task.completed.load(Ordering::SeqCst), 0);
    }
}
