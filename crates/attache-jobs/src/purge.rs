//! Deferred blob purge.
//!
//! Eligibility is re-checked at execution time: a blob that some slot has
//! bound again since the task was scheduled is left alone and the task
//! completes as skipped. Repeated execution is harmless because registry
//! purges are idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use attache_core::{SlotRepository, TaskKind};
use attache_db::BlobRegistry;

use crate::handler::{JobContext, JobHandler, JobResult};

/// Handler for [`TaskKind::PurgeBlob`].
pub struct PurgeHandler {
    registry: BlobRegistry,
    slots: Arc<dyn SlotRepository>,
}

impl PurgeHandler {
    pub fn new(registry: BlobRegistry, slots: Arc<dyn SlotRepository>) -> Self {
        Self { registry, slots }
    }
}

#[async_trait]
impl JobHandler for PurgeHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::PurgeBlob
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let task_id = ctx.task_id();
        let payload = ctx.payload();

        let references = match self.slots.reference_count(payload.blob_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%task_id, blob_id = %payload.blob_id, error = %e, "Reference check failed");
                return JobResult::Retry(e.to_string());
            }
        };

        if references > 0 {
            debug!(
                subsystem = "jobs",
                component = "purge",
                %task_id,
                blob_id = %payload.blob_id,
                references,
                "Blob attached again since scheduling, skipping purge"
            );
            return JobResult::Success(Some(json!({
                "purged": false,
                "reason": "still_referenced",
            })));
        }

        match self
            .registry
            .purge_by_id(payload.blob_id, &payload.storage_key)
            .await
        {
            Ok(removed) => {
                info!(
                    subsystem = "jobs",
                    component = "purge",
                    %task_id,
                    blob_id = %payload.blob_id,
                    storage_key = %payload.storage_key,
                    row_removed = removed,
                    "Deferred purge finished"
                );
                JobResult::Success(Some(json!({ "purged": true, "row_removed": removed })))
            }
            Err(e) => JobResult::Retry(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attache_core::{
        Attachable, PurgeTask, QueuedTask, SignedIdCodec, SlotWrite, TaskStatus,
    };
    use attache_db::{MemoryBlobRepository, MemoryContentStore, MemorySlotRepository};
    use uuid::Uuid;

    fn context_for(payload: PurgeTask) -> JobContext {
        JobContext::new(QueuedTask {
            id: Uuid::now_v7(),
            kind: TaskKind::PurgeBlob,
            payload,
            status: TaskStatus::Running,
            attempts: 1,
            max_attempts: 5,
            last_error: None,
            enqueued_at: chrono::Utc::now(),
            started_at: None,
        })
    }

    fn setup() -> (BlobRegistry, Arc<MemoryContentStore>, Arc<MemorySlotRepository>) {
        let store = Arc::new(MemoryContentStore::new());
        let registry = BlobRegistry::new(
            Arc::new(MemoryBlobRepository::new()),
            store.clone(),
            SignedIdCodec::new("purge-test").unwrap(),
        );
        (registry, store, Arc::new(MemorySlotRepository::new()))
    }

    #[tokio::test]
    async fn test_purges_unreferenced_blob() {
        let (registry, store, slots) = setup();
        let blob = registry
            .find_or_create(&Attachable::upload("a.txt", "text/plain", b"a".to_vec()))
            .await
            .unwrap();
        let handler = PurgeHandler::new(registry.clone(), slots);

        let result = handler.execute(context_for(PurgeTask::for_blob(&blob))).await;
        assert!(matches!(result, JobResult::Success(_)));
        assert_eq!(store.object_count().await, 0);
        assert!(registry.find(blob.id).await.unwrap().is_none());

        // Second delivery of the same task.
        let result = handler.execute(context_for(PurgeTask::for_blob(&blob))).await;
        assert!(matches!(result, JobResult::Success(_)));
    }

    #[tokio::test]
    async fn test_skips_reattached_blob() {
        let (registry, store, slots) = setup();
        let blob = registry
            .find_or_create(&Attachable::upload("a.txt", "text/plain", b"a".to_vec()))
            .await
            .unwrap();
        slots
            .apply(
                "User",
                Uuid::now_v7(),
                &[SlotWrite::Bind {
                    slot_name: "avatar".into(),
                    blob_id: blob.id,
                }],
            )
            .await
            .unwrap();
        let handler = PurgeHandler::new(registry.clone(), slots);

        let result = handler.execute(context_for(PurgeTask::for_blob(&blob))).await;
        match result {
            JobResult::Success(Some(data)) => assert_eq!(data["purged"], false),
            other => panic!("expected skipped success, got {:?}", other),
        }
        assert_eq!(store.object_count().await, 1);
        assert!(registry.find(blob.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_store_outage_requests_retry() {
        let (registry, store, slots) = setup();
        let blob = registry
            .find_or_create(&Attachable::upload("a.txt", "text/plain", b"a".to_vec()))
            .await
            .unwrap();
        store.set_unavailable(true);
        let handler = PurgeHandler::new(registry.clone(), slots);

        let result = handler.execute(context_for(PurgeTask::for_blob(&blob))).await;
        assert!(matches!(result, JobResult::Retry(_)));
        assert!(registry.find(blob.id).await.unwrap().is_some());
    }
}
