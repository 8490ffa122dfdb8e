//! Bounded-concurrency worker pool.
//!
//! Submissions enter a FIFO queue; a single background dispatch loop owns
//! admission and starts a unit whenever a slot is free. A unit failure is
//! terminal for its job, never for the pool. Cancellation is cooperative:
//! the pool sets a stop token, the unit's own code observes it.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cancellation::CancellationToken;
use crate::config::SchedulerConfig;
use crate::core::{Job, PipelineOutcome};
use crate::errors::DubflowError;
use crate::store::JobStore;

/// The processing function a worker unit runs for one job.
pub type JobFn = Arc<
    dyn Fn(Job, Arc<CancellationToken>) -> BoxFuture<'static, Result<PipelineOutcome, DubflowError>>
        + Send
        + Sync,
>;

/// Lifecycle state of one worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Admitted, not yet running.
    Created,
    /// Executing its job function.
    Running,
    /// Stop requested, waiting for the unit to observe it.
    Stopping,
    /// Finished; retained briefly for inspection.
    Completed,
}

/// Inspectable snapshot of one worker unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitInfo {
    /// The unit's task id.
    pub task_id: String,
    /// The job the unit owns.
    pub job_id: String,
    /// Current lifecycle state.
    pub state: UnitState,
    /// When the unit was admitted.
    pub created_at: DateTime<Utc>,
    /// When the job function started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job function returned.
    pub completed_at: Option<DateTime<Utc>>,
}

struct WorkerUnit {
    job_id: String,
    state: UnitState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    stop: Arc<CancellationToken>,
}

struct QueuedJob {
    task_id: String,
    job: Job,
    func: JobFn,
}

struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Marks the unit finished and frees its slot exactly once, even if the
/// job function panics.
struct UnitGuard {
    pool: Arc<WorkerPool>,
    task_id: String,
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.pool.finish_unit(&self.task_id);
    }
}

/// Bounded dispatcher running (job, function) pairs on tokio tasks.
pub struct WorkerPool {
    store: Arc<JobStore>,
    max_concurrent_jobs: usize,
    grace_period: Duration,
    dispatch_tick: Duration,
    queue: Mutex<VecDeque<QueuedJob>>,
    units: RwLock<HashMap<String, WorkerUnit>>,
    active: AtomicUsize,
    accepting: AtomicBool,
    task_seq: AtomicU64,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl WorkerPool {
    /// Creates the pool and starts its dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(store: Arc<JobStore>, config: &SchedulerConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            store,
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            grace_period: config.unit_grace_period,
            dispatch_tick: config.dispatch_tick,
            queue: Mutex::new(VecDeque::new()),
            units: RwLock::new(HashMap::new()),
            active: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            task_seq: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        });
        pool.spawn_dispatcher();
        pool
    }

    /// Enqueues a job for processing and returns its task id.
    ///
    /// # Errors
    ///
    /// Returns [`DubflowError::PoolShutdown`] once shutdown has begun.
    pub fn submit(&self, job: Job, func: JobFn) -> Result<String, DubflowError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DubflowError::PoolShutdown);
        }

        let seq = self.task_seq.fetch_add(1, Ordering::SeqCst);
        let task_id = format!("worker_{}_{seq}", job.id);
        self.queue.lock().push_back(QueuedJob {
            task_id: task_id.clone(),
            job,
            func,
        });
        Ok(task_id)
    }

    /// Requests a cooperative stop of the unit running `job_id`.
    ///
    /// Returns false if no live unit owns that job. The unit's in-flight
    /// work is not interrupted; its code exits at the next checkpoint.
    pub fn cancel(&self, job_id: &str) -> bool {
        let mut units = self.units.write();
        for unit in units.values_mut() {
            if unit.job_id == job_id
                && matches!(unit.state, UnitState::Created | UnitState::Running)
            {
                unit.stop.cancel("cancellation requested");
                unit.state = UnitState::Stopping;
                tracing::info!(job_id, "stop requested for worker unit");
                return true;
            }
        }
        false
    }

    /// Number of units currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of submissions waiting for a slot.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Lifecycle state of one unit, while it is retained.
    #[must_use]
    pub fn unit_state(&self, task_id: &str) -> Option<UnitState> {
        self.units.read().get(task_id).map(|u| u.state)
    }

    /// Snapshots of all retained units.
    #[must_use]
    pub fn units_info(&self) -> Vec<UnitInfo> {
        self.units
            .read()
            .iter()
            .map(|(task_id, unit)| UnitInfo {
                task_id: task_id.clone(),
                job_id: unit.job_id.clone(),
                state: unit.state,
                created_at: unit.created_at,
                started_at: unit.started_at,
                completed_at: unit.completed_at,
            })
            .collect()
    }

    /// Returns true if a live unit owns `job_id`.
    #[must_use]
    pub fn is_job_running(&self, job_id: &str) -> bool {
        self.units
            .read()
            .values()
            .any(|u| u.job_id == job_id && u.completed_at.is_none())
    }

    /// Waits until no unit is active and the queue is empty.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.active_count() == 0 && self.queue_len() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Graceful stop: refuses new submissions, requests stop on running
    /// units, waits up to `timeout` for natural completion, then returns
    /// regardless of stragglers. Nothing is force-terminated.
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        tracing::info!("worker pool shutting down");

        {
            let mut units = self.units.write();
            for unit in units.values_mut() {
                if matches!(unit.state, UnitState::Created | UnitState::Running) {
                    unit.stop.cancel("worker pool shutting down");
                    unit.state = UnitState::Stopping;
                }
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stragglers = self.active_count();
        if stragglers > 0 {
            tracing::warn!(stragglers, "shutdown timeout elapsed with units still running");
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(Dispatcher {
            shutdown_tx,
            handle,
        }) = dispatcher
        {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!("dispatch loop did not stop within timeout");
            }
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pool = Arc::clone(self);
        let tick = self.dispatch_tick;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(tick) => {}
                    _ = shutdown_rx.changed() => break,
                }

                pool.reap_completed_units();

                while pool.active.load(Ordering::SeqCst) < pool.max_concurrent_jobs {
                    let next = pool.queue.lock().pop_front();
                    match next {
                        Some(queued) => pool.start_unit(queued),
                        None => break,
                    }
                }
            }
        });

        *self.dispatcher.lock() = Some(Dispatcher {
            shutdown_tx,
            handle,
        });
    }

    fn start_unit(self: &Arc<Self>, queued: QueuedJob) {
        let QueuedJob { task_id, job, func } = queued;
        let stop = CancellationToken::new();

        self.active.fetch_add(1, Ordering::SeqCst);
        self.units.write().insert(
            task_id.clone(),
            WorkerUnit {
                job_id: job.id.clone(),
                state: UnitState::Created,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                stop: Arc::clone(&stop),
            },
        );

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = UnitGuard {
                pool: Arc::clone(&pool),
                task_id: task_id.clone(),
            };

            pool.mark_unit_running(&task_id);
            if let Err(err) = pool.store.set_worker(&job.id, &task_id) {
                tracing::warn!(job_id = %job.id, error = %err, "failed to record worker ownership");
            }
            tracing::info!(task_id = %task_id, job_id = %job.id, "worker unit started");

            if let Err(err) = func(job.clone(), stop).await {
                tracing::warn!(job_id = %job.id, error = %err, "job processing failed");
                if let Err(store_err) = pool.store.set_error(&job.id, &err.to_string()) {
                    tracing::warn!(
                        job_id = %job.id,
                        error = %store_err,
                        "failed to record job failure"
                    );
                }
            }
        });
    }

    fn mark_unit_running(&self, task_id: &str) {
        let mut units = self.units.write();
        if let Some(unit) = units.get_mut(task_id) {
            unit.started_at = Some(Utc::now());
            if unit.state == UnitState::Created {
                unit.state = UnitState::Running;
            }
        }
    }

    fn finish_unit(&self, task_id: &str) {
        {
            let mut units = self.units.write();
            if let Some(unit) = units.get_mut(task_id) {
                unit.completed_at = Some(Utc::now());
                if unit.state != UnitState::Stopping {
                    unit.state = UnitState::Completed;
                }
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn reap_completed_units(&self) {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace_period)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.units.write().retain(|_, unit| {
            unit.completed_at
                .map_or(true, |done| now.signed_duration_since(done) <= grace)
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("active", &self.active_count())
            .field("queued", &self.queue_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineStage;

    fn test_setup(max_jobs: usize) -> (tempfile::TempDir, Arc<JobStore>, Arc<WorkerPool>) {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig::new()
            .with_supported_languages(["en", "es"])
            .with_snapshot_path(dir.path().join("jobs.json"))
            .with_max_concurrent_jobs(max_jobs)
            .with_unit_grace_period(Duration::from_millis(100));
        let store = Arc::new(JobStore::new(config.clone()));
        let pool = WorkerPool::new(Arc::clone(&store), &config);
        (dir, store, pool)
    }

    fn completing_fn(store: Arc<JobStore>, work: Duration) -> JobFn {
        Arc::new(move |job, _stop| {
            let store = store.clone();
            Box::pin(async move {
                tokio::time::sleep(work).await;
                store.update_progress(&job.id, PipelineStage::Completed, 100.0)?;
                Ok(PipelineOutcome::succeeded("out", 0.0, vec![]))
            })
        })
    }

    #[tokio::test]
    async fn test_concurrency_stays_bounded_and_all_jobs_finish() {
        let (_dir, store, pool) = test_setup(2);
        let func = completing_fn(Arc::clone(&store), Duration::from_millis(40));

        for i in 0..6 {
            let job = store.create(&format!("/media/{i}.mp4"), "es").unwrap();
            pool.submit(job, func.clone()).unwrap();
        }

        let sampler = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut max_seen = 0;
                for _ in 0..40 {
                    max_seen = max_seen.max(pool.active_count());
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                max_seen
            })
        };

        assert!(pool.wait_idle(Duration::from_secs(5)).await);
        assert!(sampler.await.unwrap() <= 2);

        for job in store.list_all() {
            assert!(job.is_finished(), "job {} not terminal", job.id);
        }
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failures_are_terminal_for_the_job_not_the_pool() {
        let (_dir, store, pool) = test_setup(2);

        let failing: JobFn = Arc::new(|_job, _stop| {
            Box::pin(async { Err(DubflowError::stage("decoder exploded")) })
        });
        let job = store.create("/media/a.mp4", "es").unwrap();
        pool.submit(job.clone(), failing).unwrap();

        assert!(pool.wait_idle(Duration::from_secs(2)).await);

        let failed = store.get(&job.id).unwrap();
        assert_eq!(failed.status, crate::core::JobStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("stage execution error: decoder exploded")
        );

        // The pool still runs subsequent jobs.
        let ok_fn = completing_fn(Arc::clone(&store), Duration::from_millis(5));
        let job2 = store.create("/media/b.mp4", "es").unwrap();
        pool.submit(job2.clone(), ok_fn).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(
            store.get(&job2.id).unwrap().status,
            crate::core::JobStatus::Completed
        );
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_worker_ownership_is_recorded() {
        let (_dir, store, pool) = test_setup(1);
        let func = completing_fn(Arc::clone(&store), Duration::from_millis(30));

        let job = store.create("/media/a.mp4", "es").unwrap();
        let task_id = pool.submit(job.clone(), func).unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get(&job.id).unwrap().worker_id, Some(task_id));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cooperative_cancel() {
        let (_dir, store, pool) = test_setup(1);

        let cancellable: JobFn = Arc::new(|_job, stop| {
            Box::pin(async move {
                for _ in 0..100 {
                    if stop.is_cancelled() {
                        return Err(DubflowError::Cancelled(
                            stop.reason().unwrap_or_default(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(PipelineOutcome::succeeded("out", 0.0, vec![]))
            })
        });

        let job = store.create("/media/a.mp4", "es").unwrap();
        pool.submit(job.clone(), cancellable).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.is_job_running(&job.id));

        assert!(pool.cancel(&job.id));
        assert!(pool.wait_idle(Duration::from_secs(2)).await);

        let cancelled = store.get(&job.id).unwrap();
        assert_eq!(cancelled.status, crate::core::JobStatus::Failed);
        assert!(!pool.is_job_running(&job.id));

        // Nothing left to cancel.
        assert!(!pool.cancel(&job.id));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (_dir, _store, pool) = test_setup(1);
        assert!(!pool.cancel("job_ghost"));
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let (_dir, store, pool) = test_setup(1);
        pool.shutdown(Duration::from_millis(50)).await;

        let job = store.create("/media/a.mp4", "es").unwrap();
        let func = completing_fn(Arc::clone(&store), Duration::from_millis(1));
        let err = pool.submit(job, func).unwrap_err();
        assert!(matches!(err, DubflowError::PoolShutdown));
    }

    #[tokio::test]
    async fn test_completed_units_are_retained_then_reaped() {
        let (_dir, store, pool) = test_setup(1);
        let func = completing_fn(Arc::clone(&store), Duration::from_millis(10));

        let job = store.create("/media/a.mp4", "es").unwrap();
        let task_id = pool.submit(job, func).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.unit_state(&task_id), Some(UnitState::Completed));
        assert_eq!(pool.units_info().len(), 1);

        // Past the grace period the cleanup pass removes it.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.unit_state(&task_id), None);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_fifo_admission_order() {
        let (_dir, store, pool) = test_setup(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let recording: JobFn = {
            let order = Arc::clone(&order);
            Arc::new(move |job, _stop| {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().push(job.input_path.clone());
                    Ok(PipelineOutcome::succeeded("out", 0.0, vec![]))
                })
            })
        };

        for name in ["first", "second", "third"] {
            let job = store.create(&format!("/media/{name}.mp4"), "es").unwrap();
            pool.submit(job, recording.clone()).unwrap();
        }

        assert!(pool.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(
            order.lock().clone(),
            vec![
                "/media/first.mp4".to_string(),
                "/media/second.mp4".to_string(),
                "/media/third.mp4".to_string()
            ]
        );
        pool.shutdown(Duration::from_secs(1)).await;
    }
}
