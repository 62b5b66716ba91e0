//! Shared harness for lifecycle integration tests: in-memory backends, a
//! `User` owner with a validated name, and a purge worker to drain the queue.

#![allow(dead_code)]

use std::sync::Arc;

use attache_core::{
    Attachable, Blob, Error, Result, SignedIdCodec, SlotRepository, UploadBundle,
};
use attache_db::{
    BlobRegistry, MemoryBlobRepository, MemoryContentStore, MemorySlotRepository, MemoryTaskQueue,
};
use attache_jobs::{PurgeHandler, WorkerBuilder};
use attache_lifecycle::{AttachmentLifecycleManager, Owner, SlotDefinition};
use uuid::Uuid;

/// Owner type used throughout the lifecycle tests.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Option<Uuid>,
    pub name: String,
}

impl User {
    /// A user that has not been saved yet.
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }

    /// A user that already has a durable id.
    pub fn persisted(name: &str) -> Self {
        Self {
            id: Some(Uuid::now_v7()),
            name: name.to_string(),
        }
    }

    /// Assign an id, as the owning persistence layer would on insert.
    pub fn save(&mut self) -> Uuid {
        *self.id.get_or_insert_with(Uuid::now_v7)
    }
}

impl Owner for User {
    fn owner_type(&self) -> &str {
        "User"
    }

    fn owner_id(&self) -> Option<Uuid> {
        self.id
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("Name can't be blank".into()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub manager: AttachmentLifecycleManager,
    pub store: Arc<MemoryContentStore>,
    pub blobs: Arc<MemoryBlobRepository>,
    pub slots: Arc<MemorySlotRepository>,
    pub queue: Arc<MemoryTaskQueue>,
}

/// `User.avatar` is dependent, `User.cover_photo` is independent.
pub fn harness() -> Harness {
    let store = Arc::new(MemoryContentStore::new());
    let blobs = Arc::new(MemoryBlobRepository::new());
    let slots = Arc::new(MemorySlotRepository::linked(blobs.clone()));
    let queue = Arc::new(MemoryTaskQueue::new());

    let registry = BlobRegistry::new(
        blobs.clone(),
        store.clone(),
        SignedIdCodec::new("lifecycle-test-secret").unwrap(),
    );
    let manager = AttachmentLifecycleManager::builder(registry, slots.clone(), queue.clone())
        .slot(SlotDefinition::new("User", "avatar"))
        .unwrap()
        .slot(SlotDefinition::independent("User", "cover_photo"))
        .unwrap()
        .build();

    Harness {
        manager,
        store,
        blobs,
        slots,
        queue,
    }
}

impl Harness {
    /// Register and upload a blob outside of any slot.
    pub async fn create_blob(&self, filename: &str, data: &[u8]) -> Blob {
        self.manager
            .registry()
            .create_and_upload(&UploadBundle::new(filename, "image/jpeg", data.to_vec()))
            .await
            .unwrap()
    }

    /// Persisted user with `blob` bound to `slot`.
    pub async fn user_with(&self, slot: &str, blob: &Blob) -> User {
        let user = User::persisted("DHH");
        self.manager
            .attach(&user, slot, Some(Attachable::Blob(blob.clone())))
            .await
            .unwrap();
        user
    }

    pub async fn stored(&self, blob: &Blob) -> bool {
        self.manager.registry().exists_in_store(blob).await.unwrap()
    }

    pub async fn registered(&self, blob: &Blob) -> bool {
        self.manager.registry().find(blob.id).await.unwrap().is_some()
    }

    pub async fn references(&self, blob: &Blob) -> i64 {
        self.slots.reference_count(blob.id).await.unwrap()
    }

    /// Run every deferred task to completion, as a worker would.
    pub async fn perform_enqueued_jobs(&self) -> usize {
        let handler = PurgeHandler::new(self.manager.registry().clone(), self.slots.clone());
        WorkerBuilder::new(self.queue.clone())
            .with_handler(handler)
            .build()
            .run_until_empty()
            .await
            .unwrap()
    }
}
