//! Worker tests against the in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attache_db::{
    BlobRegistry, MemoryBlobRepository, MemoryContentStore, MemorySlotRepository, MemoryTaskQueue,
};
use attache_jobs::{
    Attachable, JobContext, JobHandler, JobResult, PurgeHandler, PurgeTask, SignedIdCodec,
    TaskKind, TaskQueue, TaskStatus, WorkerBuilder, WorkerConfig, WorkerEvent,
};
use uuid::Uuid;

struct Harness {
    registry: BlobRegistry,
    store: Arc<MemoryContentStore>,
    slots: Arc<MemorySlotRepository>,
    queue: Arc<MemoryTaskQueue>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryContentStore::new());
    let registry = BlobRegistry::new(
        Arc::new(MemoryBlobRepository::new()),
        store.clone(),
        SignedIdCodec::new("worker-test").unwrap(),
    );
    Harness {
        registry,
        store,
        slots: Arc::new(MemorySlotRepository::new()),
        queue: Arc::new(MemoryTaskQueue::with_max_attempts(3)),
    }
}

struct AlwaysRetry;

#[async_trait]
impl JobHandler for AlwaysRetry {
    fn kind(&self) -> TaskKind {
        TaskKind::PurgeBlob
    }

    async fn execute(&self, _ctx: JobContext) -> JobResult {
        JobResult::Retry("store offline".into())
    }
}

#[tokio::test]
async fn test_run_until_empty_purges_every_queued_blob() {
    let h = harness();
    for name in ["a.txt", "b.txt", "c.txt"] {
        let blob = h
            .registry
            .find_or_create(&Attachable::upload(name, "text/plain", name.as_bytes().to_vec()))
            .await
            .unwrap();
        h.queue.enqueue(PurgeTask::for_blob(&blob)).await.unwrap();
    }

    let worker = WorkerBuilder::new(h.queue.clone())
        .with_config(WorkerConfig::default().with_max_concurrent(2))
        .with_handler(PurgeHandler::new(h.registry.clone(), h.slots.clone()))
        .build();

    let executed = worker.run_until_empty().await.unwrap();
    assert_eq!(executed, 3);
    assert_eq!(worker.pending_count().await.unwrap(), 0);
    assert_eq!(h.store.object_count().await, 0);
    assert_eq!(h.queue.completed_count(), 3);
    assert!(h.queue.tasks().await.is_empty());
}

#[tokio::test]
async fn test_task_left_running_is_reclaimed_and_purged() {
    let h = harness();
    let blob = h
        .registry
        .find_or_create(&Attachable::upload("a.txt", "text/plain", b"a".to_vec()))
        .await
        .unwrap();
    h.queue.enqueue(PurgeTask::for_blob(&blob)).await.unwrap();

    // Claimed by a worker that never reports back.
    let abandoned = h.queue.claim_next().await.unwrap().unwrap();
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);

    let patient = WorkerBuilder::new(h.queue.clone())
        .with_handler(PurgeHandler::new(h.registry.clone(), h.slots.clone()))
        .build();
    assert_eq!(patient.run_until_empty().await.unwrap(), 0);
    assert_eq!(h.queue.tasks().await[0].status, TaskStatus::Running);

    let worker = WorkerBuilder::new(h.queue.clone())
        .with_config(WorkerConfig::default().with_stale_after(Duration::ZERO))
        .with_handler(PurgeHandler::new(h.registry.clone(), h.slots.clone()))
        .build();
    assert_eq!(worker.run_until_empty().await.unwrap(), 1);

    assert_eq!(h.queue.completed_count(), 1);
    assert!(h.queue.tasks().await.is_empty());
    assert!(!h.registry.exists_in_store(&blob).await.unwrap());
    assert_eq!(abandoned.attempts, 1);
}

#[tokio::test]
async fn test_reclaimed_task_out_of_attempts_fails() {
    let h = harness();
    h.queue
        .enqueue(PurgeTask {
            blob_id: Uuid::now_v7(),
            storage_key: "lost".into(),
        })
        .await
        .unwrap();
    for _ in 0..3 {
        h.queue.claim_next().await.unwrap().unwrap();
        h.queue.requeue_stale(Duration::ZERO).await.unwrap();
    }

    let tasks = h.queue.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].attempts, 3);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_retry_stops_at_max_attempts() {
    let h = harness();
    h.queue
        .enqueue(PurgeTask {
            blob_id: Uuid::now_v7(),
            storage_key: "gone".into(),
        })
        .await
        .unwrap();

    let worker = WorkerBuilder::new(h.queue.clone())
        .with_handler(AlwaysRetry)
        .build();

    let executed = worker.run_until_empty().await.unwrap();
    assert_eq!(executed, 3);

    let tasks = h.queue.tasks().await;
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].attempts, 3);
    assert_eq!(tasks[0].last_error.as_deref(), Some("store offline"));
}

#[tokio::test]
async fn test_missing_handler_fails_task() {
    let h = harness();
    h.queue
        .enqueue(PurgeTask {
            blob_id: Uuid::now_v7(),
            storage_key: "orphan".into(),
        })
        .await
        .unwrap();

    let worker = WorkerBuilder::new(h.queue.clone()).build();
    worker.run_until_empty().await.unwrap();

    let tasks = h.queue.tasks().await;
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert!(tasks[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("No handler"));
}

#[tokio::test]
async fn test_started_worker_emits_events_and_shuts_down() {
    let h = harness();
    let blob = h
        .registry
        .find_or_create(&Attachable::upload("a.txt", "text/plain", b"a".to_vec()))
        .await
        .unwrap();

    let worker = WorkerBuilder::new(h.queue.clone())
        .with_config(WorkerConfig::default().with_poll_interval(10))
        .with_handler(PurgeHandler::new(h.registry.clone(), h.slots.clone()))
        .build();
    let handle = worker.start();
    let mut events = handle.events();

    let task_id = h.queue.enqueue(PurgeTask::for_blob(&blob)).await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::TaskCompleted { task_id: id, .. }) => break id,
                Ok(_) => continue,
                Err(e) => panic!("event channel closed: {:?}", e),
            }
        }
    })
    .await
    .expect("task was not processed in time");
    assert_eq!(completed, task_id);
    assert!(!h.registry.exists_in_store(&blob).await.unwrap());

    handle.shutdown().await.unwrap();

    // The loop has returned by the time shutdown resolves.
    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        stopped |= event == WorkerEvent::WorkerStopped;
    }
    assert!(stopped);
}

#[tokio::test]
async fn test_shutdown_of_disabled_worker_returns() {
    let h = harness();
    let worker = WorkerBuilder::new(h.queue.clone())
        .with_config(WorkerConfig::default().with_enabled(false))
        .build();
    let handle = worker.start();
    handle.shutdown().await.unwrap();
}
