//! Task worker that drains the deferred queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use attache_core::defaults::{
    EVENT_BUS_CAPACITY, JOB_MAX_CONCURRENT, JOB_POLL_INTERVAL_MS, JOB_STALE_AFTER_SECS,
    JOB_TIMEOUT_SECS,
};
use attache_core::{Error, QueuedTask, Result, TaskKind, TaskQueue};

use crate::handler::{JobContext, JobHandler, JobResult};

type HandlerMap = Arc<HashMap<TaskKind, Arc<dyn JobHandler>>>;

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of tasks run concurrently.
    pub max_concurrent_jobs: usize,
    /// Per-task execution timeout.
    pub job_timeout: Duration,
    /// Running tasks claimed longer ago than this are treated as abandoned.
    pub stale_after: Duration,
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: JOB_MAX_CONCURRENT,
            job_timeout: Duration::from_secs(JOB_TIMEOUT_SECS),
            stale_after: Duration::from_secs(JOB_STALE_AFTER_SECS),
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ATTACHE_WORKER_ENABLED` | `true` | Enable/disable task processing |
    /// | `ATTACHE_WORKER_MAX_CONCURRENT` | `4` | Max concurrent tasks |
    /// | `ATTACHE_WORKER_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `ATTACHE_WORKER_STALE_AFTER_SECS` | `600` | Age at which a running task is reclaimed |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = lookup("ATTACHE_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = lookup("ATTACHE_WORKER_MAX_CONCURRENT")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = lookup("ATTACHE_WORKER_POLL_INTERVAL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_POLL_INTERVAL_MS);

        let stale_after = lookup("ATTACHE_WORKER_STALE_AFTER_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(JOB_STALE_AFTER_SECS));

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            stale_after,
            enabled,
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the task worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    TaskStarted { task_id: Uuid, kind: TaskKind },
    TaskCompleted { task_id: Uuid, kind: TaskKind },
    TaskFailed {
        task_id: Uuid,
        kind: TaskKind,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop and wait for its current batch to finish.
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the loop has already returned.
        let _ = self.shutdown_tx.send(()).await;
        self.join
            .await
            .map_err(|e| Error::Internal(format!("Task worker loop aborted: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Worker that claims deferred tasks and runs their handlers.
pub struct JobWorker {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        config: WorkerConfig,
        handlers: Vec<Arc<dyn JobHandler>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.kind(), handler))
            .collect();
        Self {
            queue,
            config,
            handlers: Arc::new(handlers),
            event_tx,
        }
    }

    /// Start the worker loop and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }

    /// Return abandoned running tasks to the queue.
    pub async fn requeue_stale(&self) -> Result<u64> {
        let requeued = self.queue.requeue_stale(self.config.stale_after).await?;
        if requeued > 0 {
            warn!(
                subsystem = "jobs",
                requeued,
                stale_after_secs = self.config.stale_after.as_secs(),
                "Reclaimed tasks left running by a lost worker"
            );
        }
        Ok(requeued)
    }

    /// Claim and run tasks until the queue has nothing pending.
    ///
    /// Stale running tasks are reclaimed first. Returns the number of task
    /// executions, retries included.
    pub async fn run_until_empty(&self) -> Result<usize> {
        self.requeue_stale().await?;
        let mut executed = 0;
        loop {
            let batch = self.run_batch().await?;
            if batch == 0 {
                return Ok(executed);
            }
            executed += batch;
        }
    }

    /// Claim up to `max_concurrent_jobs` tasks and run them to completion.
    async fn run_batch(&self) -> Result<usize> {
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..self.config.max_concurrent_jobs.max(1) {
            match self.queue.claim_next().await? {
                Some(task) => {
                    let worker = self.clone_refs();
                    tasks.spawn(async move { worker.execute_task(task).await });
                }
                None => break,
            }
        }

        let claimed = tasks.len();
        if claimed > 0 {
            debug!(claimed, "Processing concurrent task batch");
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Task execution panicked");
            }
        }
        Ok(claimed)
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Task worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "Task worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_reclaim: Option<Instant> = None;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Task worker received shutdown signal");
                break;
            }

            if last_reclaim.map_or(true, |at| at.elapsed() >= self.config.stale_after) {
                if let Err(e) = self.requeue_stale().await {
                    error!(error = %e, "Failed to reclaim stale tasks");
                }
                last_reclaim = Some(Instant::now());
            }

            let claimed = match self.run_batch().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Failed to claim task");
                    0
                }
            };

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Task worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Task worker stopped");
    }

    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            timeout: self.config.job_timeout,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.queue.pending_count().await
    }
}

/// References needed to execute one task in a spawned future.
struct JobWorkerRef {
    queue: Arc<dyn TaskQueue>,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    timeout: Duration,
}

impl JobWorkerRef {
    async fn execute_task(self, task: QueuedTask) {
        let start = Instant::now();
        let task_id = task.id;
        let kind = task.kind;

        debug!(%task_id, kind = kind.as_str(), attempt = task.attempts, "Processing task");
        let _ = self.event_tx.send(WorkerEvent::TaskStarted { task_id, kind });

        let result = match self.handlers.get(&kind).cloned() {
            Some(handler) => {
                match tokio::time::timeout(self.timeout, handler.execute(JobContext::new(task)))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(%task_id, kind = kind.as_str(), "Task exceeded timeout");
                        JobResult::Retry(format!(
                            "Task exceeded timeout of {}s",
                            self.timeout.as_secs()
                        ))
                    }
                }
            }
            None => {
                warn!(kind = kind.as_str(), "No handler registered for task kind");
                JobResult::Failed(format!("No handler for task kind: {}", kind.as_str()))
            }
        };

        match result {
            JobResult::Success(_) => {
                if let Err(e) = self.queue.complete(task_id).await {
                    error!(error = %e, %task_id, "Failed to mark task as completed");
                } else {
                    info!(
                        subsystem = "jobs",
                        %task_id,
                        kind = kind.as_str(),
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Task completed"
                    );
                    let _ = self
                        .event_tx
                        .send(WorkerEvent::TaskCompleted { task_id, kind });
                }
            }
            JobResult::Failed(error) | JobResult::Retry(error) => {
                if let Err(e) = self.queue.fail(task_id, &error).await {
                    error!(error = %e, %task_id, "Failed to record task failure");
                } else {
                    warn!(
                        subsystem = "jobs",
                        %task_id,
                        kind = kind.as_str(),
                        %error,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Task failed"
                    );
                    let _ = self.event_tx.send(WorkerEvent::TaskFailed {
                        task_id,
                        kind,
                        error,
                    });
                }
            }
        }
    }
}

/// Builder for a worker with its handlers.
pub struct WorkerBuilder {
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn JobHandler>>,
}

impl WorkerBuilder {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            queue,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> JobWorker {
        JobWorker::new(self.queue, self.config, self.handlers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Env;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: Env<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, JOB_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent_jobs, JOB_MAX_CONCURRENT);
        assert_eq!(config.job_timeout, Duration::from_secs(JOB_TIMEOUT_SECS));
        assert_eq!(config.stale_after, Duration::from_secs(JOB_STALE_AFTER_SECS));
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_max_concurrent(8)
            .with_timeout(Duration::from_secs(5))
            .with_stale_after(Duration::from_secs(30))
            .with_enabled(false);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_jobs, 8);
        assert_eq!(config.job_timeout, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(30));
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_config_with_max_concurrent_zero_clamps() {
        let config = WorkerConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent_jobs, 1);
    }

    #[test]
    fn test_worker_config_from_lookup_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[]));
        assert!(config.enabled);
        assert_eq!(config.max_concurrent_jobs, JOB_MAX_CONCURRENT);
        assert_eq!(config.poll_interval_ms, JOB_POLL_INTERVAL_MS);
    }

    #[test]
    fn test_worker_config_from_lookup_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("ATTACHE_WORKER_ENABLED", "false"),
            ("ATTACHE_WORKER_MAX_CONCURRENT", "0"),
            ("ATTACHE_WORKER_POLL_INTERVAL_MS", "25"),
            ("ATTACHE_WORKER_STALE_AFTER_SECS", "900"),
        ]));
        assert!(!config.enabled);
        assert_eq!(config.max_concurrent_jobs, 1);
        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.stale_after, Duration::from_secs(900));
    }

    #[test]
    fn test_worker_config_from_lookup_ignores_garbage() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("ATTACHE_WORKER_MAX_CONCURRENT", "lots"),
            ("ATTACHE_WORKER_POLL_INTERVAL_MS", "-3"),
        ]));
        assert_eq!(config.max_concurrent_jobs, JOB_MAX_CONCURRENT);
        assert_eq!(config.poll_interval_ms, JOB_POLL_INTERVAL_MS);
    }

    #[test]
    fn test_worker_event_clone() {
        let event = WorkerEvent::TaskFailed {
            task_id: Uuid::now_v7(),
            kind: TaskKind::PurgeBlob,
            error: "boom".into(),
        };
        assert_eq!(event.clone(), event);
    }
}
