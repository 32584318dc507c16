//! Simulated job worker over the in-memory store.
//!
//! Stands in for the remote worker in tests and the demo: claims the oldest
//! queued job, holds it in `processing` for a while, then completes or fails
//! it according to the handler registered for its kind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jobwatch_core::{JobKind, JobRecord, ResultRecord, TenantId};

use crate::results::InMemoryResultStore;
use crate::store::InMemoryJobStore;

/// What a handler decided for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Success,
    /// Success, also storing the job's result.
    SuccessWithResult(ResultRecord),
    Failure(String),
}

pub type WorkHandler = Box<dyn Fn(&JobRecord) -> WorkOutcome + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle wait between claims when nothing is queued.
    pub poll_interval: Duration,
    /// Time a claimed job spends in `processing`.
    pub work_time: Duration,
    pub name: String,
    pub tenant_id: Option<TenantId>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            work_time: Duration::from_secs(2),
            name: "simulated-worker".to_string(),
            tenant_id: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_work_time(mut self, work_time: Duration) -> Self {
        self.work_time = work_time;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop after the current job (if any) and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.join.await {
            warn!(error = %err, "worker task ended abnormally");
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }
}

pub struct SimulatedWorker {
    store: Arc<InMemoryJobStore>,
    results: Option<Arc<InMemoryResultStore>>,
    handlers: HashMap<JobKind, WorkHandler>,
}

impl SimulatedWorker {
    pub fn new(store: Arc<InMemoryJobStore>) -> Self {
        Self {
            store,
            results: None,
            handlers: HashMap::new(),
        }
    }

    /// Where `SuccessWithResult` outcomes are stored.
    pub fn with_results(mut self, results: Arc<InMemoryResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn register_handler<F>(&mut self, kind: JobKind, handler: F)
    where
        F: Fn(&JobRecord) -> WorkOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Claim the oldest queued job (optionally for one tenant).
    pub fn claim(&self, tenant_id: Option<TenantId>) -> Option<JobRecord> {
        self.store.claim_next(tenant_id)
    }

    /// Finish a claimed job with its kind's handler.
    ///
    /// Returns the terminal record, or the failure reason.
    pub fn execute_one(&self, job: &JobRecord) -> Result<JobRecord, String> {
        let Some(handler) = self.handlers.get(&job.kind) else {
            let error = format!("no handler for job kind: {}", job.kind);
            warn!(job_id = %job.id, error = %error, "no handler for job");
            self.store
                .fail(job.tenant_id, &job.id, error.clone())
                .map_err(|e| e.to_string())?;
            return Err(error);
        };

        match handler(job) {
            WorkOutcome::Success => self.finish(job),
            WorkOutcome::SuccessWithResult(result) => {
                match &self.results {
                    Some(results) => results.put(result),
                    None => debug!(job_id = %job.id, "no result store configured; result dropped"),
                }
                self.finish(job)
            }
            WorkOutcome::Failure(error) => {
                self.store
                    .fail(job.tenant_id, &job.id, error.clone())
                    .map_err(|e| e.to_string())?;
                Err(error)
            }
        }
    }

    /// Claim and execute immediately; `None` when nothing is queued.
    pub fn run_next(&self, tenant_id: Option<TenantId>) -> Option<Result<JobRecord, String>> {
        let job = self.claim(tenant_id)?;
        Some(self.execute_one(&job))
    }

    fn finish(&self, job: &JobRecord) -> Result<JobRecord, String> {
        let done = self
            .store
            .complete(job.tenant_id, &job.id)
            .map_err(|e| e.to_string())?;
        debug!(job_id = %job.id, duration_ms = ?done.duration_ms, "job completed");
        Ok(done)
    }

    /// Run the worker loop on the tokio runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(self, config, shutdown_rx, stats.clone()));

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

async fn worker_loop(
    worker: SimulatedWorker,
    config: WorkerConfig,
    mut shutdown: oneshot::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, "worker started");
    let started = Instant::now();

    loop {
        lock(&stats).uptime_secs = started.elapsed().as_secs();

        let Some(job) = worker.claim(config.tenant_id) else {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
            continue;
        };

        debug!(worker = %config.name, job_id = %job.id, kind = %job.kind, "claimed job");
        lock(&stats).current_running += 1;

        let stopping = tokio::select! {
            _ = &mut shutdown => true,
            _ = tokio::time::sleep(config.work_time) => false,
        };

        let result = worker.execute_one(&job);
        {
            let mut s = lock(&stats);
            s.current_running = s.current_running.saturating_sub(1);
            s.jobs_processed += 1;
            match &result {
                Ok(_) => s.jobs_succeeded += 1,
                Err(_) => s.jobs_failed += 1,
            }
        }
        if let Err(e) = result {
            debug!(worker = %config.name, job_id = %job.id, error = %e, "job failed");
        }

        if stopping {
            break;
        }
    }

    info!(worker = %config.name, "worker stopped");
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::ResultStore;
    use crate::store::JobStore;
    use chrono::Utc;
    use jobwatch_core::{JobIdentity, JobPayload, JobStatus};

    fn queued(tenant: TenantId, id: &str, kind: JobKind) -> JobRecord {
        JobRecord::queued(JobIdentity::parse(id).unwrap(), tenant, kind, JobPayload::new(id), Utc::now())
    }

    #[tokio::test]
    async fn execute_successful_job_stores_result() {
        let store = InMemoryJobStore::arc();
        let results = InMemoryResultStore::arc();
        let mut worker = SimulatedWorker::new(store.clone()).with_results(results.clone());
        worker.register_handler(JobKind::Training, |job| {
            WorkOutcome::SuccessWithResult(
                ResultRecord::new(job.id.clone(), job.tenant_id, "model v1", Utc::now()).with_metric("accuracy", 0.91),
            )
        });

        let tenant = TenantId::new();
        store.create_queued(queued(tenant, "t", JobKind::Training)).await.unwrap();

        let done = worker.run_next(Some(tenant)).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.duration_ms.is_some());

        let stored = results.get(tenant, &done.id).await.unwrap();
        assert_eq!(stored.metrics["accuracy"], 0.91);
        assert!(worker.run_next(Some(tenant)).is_none());
    }

    #[tokio::test]
    async fn failures_and_missing_handlers_fail_the_job() {
        let store = InMemoryJobStore::arc();
        let mut worker = SimulatedWorker::new(store.clone());
        worker.register_handler(JobKind::Prediction, |_| WorkOutcome::Failure("bad input".into()));

        let tenant = TenantId::new();
        store.create_queued(queued(tenant, "p", JobKind::Prediction)).await.unwrap();
        store.create_queued(queued(tenant, "t", JobKind::Training)).await.unwrap();

        assert_eq!(worker.run_next(Some(tenant)).unwrap().unwrap_err(), "bad input");
        let err = worker.run_next(Some(tenant)).unwrap().unwrap_err();
        assert!(err.contains("no handler"));
        assert_eq!(store.stats(tenant).failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_worker_processes_and_shuts_down() {
        let store = InMemoryJobStore::arc();
        let mut worker = SimulatedWorker::new(store.clone());
        worker.register_handler(JobKind::Training, |_| WorkOutcome::Success);

        let tenant = TenantId::new();
        store.create_queued(queued(tenant, "a", JobKind::Training)).await.unwrap();
        store.create_queued(queued(tenant, "b", JobKind::Training)).await.unwrap();

        let handle = worker.spawn(
            WorkerConfig::default()
                .with_tenant(tenant)
                .with_work_time(Duration::from_secs(1))
                .with_poll_interval(Duration::from_millis(100)),
        );

        for _ in 0..100 {
            if handle.stats().jobs_processed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stats = handle.stats();
        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(stats.current_running, 0);
        handle.shutdown().await;
        assert_eq!(store.stats(tenant).completed, 2);
    }
}
