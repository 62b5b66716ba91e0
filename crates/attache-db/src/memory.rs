//! In-process implementations of every backend trait.
//!
//! Used by tests and single-process deployments. Each type counts the
//! mutations it performs so callers can assert on write amplification.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use attache_core::defaults::{JOB_MAX_ATTEMPTS, MEMORY_FAILED_TASK_HISTORY};
use attache_core::{
    new_v7, AttachmentSlot, Blob, BlobRepository, ContentStore, Error, PurgeTask, QueuedTask,
    Result, SlotCommit, SlotKey, SlotRepository, SlotTransition, SlotWrite, TaskKind, TaskQueue,
    TaskStatus,
};

// =============================================================================
// CONTENT STORE
// =============================================================================

/// Content store holding objects in a hash map.
#[derive(Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that removed an object.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of objects currently stored.
    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Simulate an outage: every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("content store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.check_available()?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.check_available()?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no object stored under key {}", key)))
    }

    async fn exist(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        if self.objects.write().await.remove(key).is_some() {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// BLOB REPOSITORY
// =============================================================================

/// Blob rows held in a hash map.
#[derive(Default)]
pub struct MemoryBlobRepository {
    blobs: RwLock<HashMap<Uuid, Blob>>,
}

impl MemoryBlobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobRepository for MemoryBlobRepository {
    async fn insert(&self, blob: &Blob) -> Result<()> {
        let mut blobs = self.blobs.write().await;
        if blobs.contains_key(&blob.id) {
            return Err(Error::Internal(format!("blob {} already registered", blob.id)));
        }
        blobs.insert(blob.id, blob.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Blob>> {
        Ok(self.blobs.read().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.blobs.write().await.remove(&id).is_some())
    }

    async fn list_created_before(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<Blob>> {
        let blobs = self.blobs.read().await;
        let mut old: Vec<Blob> = blobs
            .values()
            .filter(|b| b.created_at < cutoff)
            .filter(|b| after.map_or(true, |cursor| (b.created_at, b.id) > cursor))
            .cloned()
            .collect();
        old.sort_by_key(|b| (b.created_at, b.id));
        old.truncate(limit.max(0) as usize);
        Ok(old)
    }
}

// =============================================================================
// SLOT REPOSITORY
// =============================================================================

/// Slot bindings held in a hash map. `apply` runs under one write lock.
///
/// [`linked`](Self::linked) attaches the blob repository whose rows
/// `apply_and_unregister` removes while that lock is held.
#[derive(Default)]
pub struct MemorySlotRepository {
    slots: RwLock<HashMap<SlotKey, AttachmentSlot>>,
    blobs: Option<Arc<MemoryBlobRepository>>,
    writes: AtomicUsize,
}

impl MemorySlotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(blobs: Arc<MemoryBlobRepository>) -> Self {
        Self {
            blobs: Some(blobs),
            ..Self::default()
        }
    }

    /// Number of row inserts, updates, and deletes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of bound slots.
    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    fn apply_locked(
        &self,
        slots: &mut HashMap<SlotKey, AttachmentSlot>,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
    ) -> Vec<SlotTransition> {
        let mut transitions = Vec::with_capacity(writes.len());

        for write in writes {
            let key = SlotKey::new(owner_type, owner_id, write.slot_name());
            let transition = match write {
                SlotWrite::Bind { slot_name, blob_id } => {
                    let previous = slots.get(&key).map(|s| s.blob_id);
                    if previous != Some(*blob_id) {
                        match slots.get_mut(&key) {
                            Some(row) => row.blob_id = *blob_id,
                            None => {
                                slots.insert(
                                    key.clone(),
                                    AttachmentSlot {
                                        id: new_v7(),
                                        owner_type: owner_type.to_string(),
                                        owner_id,
                                        slot_name: slot_name.clone(),
                                        blob_id: *blob_id,
                                        created_at: Utc::now(),
                                    },
                                );
                            }
                        }
                        self.writes.fetch_add(1, Ordering::SeqCst);
                    }
                    SlotTransition {
                        slot_name: slot_name.clone(),
                        previous,
                        current: Some(*blob_id),
                    }
                }
                SlotWrite::Clear { slot_name } => {
                    let previous = slots.remove(&key).map(|s| s.blob_id);
                    if previous.is_some() {
                        self.writes.fetch_add(1, Ordering::SeqCst);
                    }
                    SlotTransition {
                        slot_name: slot_name.clone(),
                        previous,
                        current: None,
                    }
                }
            };
            transitions.push(transition);
        }

        transitions
    }
}

#[async_trait]
impl SlotRepository for MemorySlotRepository {
    async fn get(&self, key: &SlotKey) -> Result<Option<AttachmentSlot>> {
        Ok(self.slots.read().await.get(key).cloned())
    }

    async fn list_for_owner(
        &self,
        owner_type: &str,
        owner_id: Uuid,
    ) -> Result<Vec<AttachmentSlot>> {
        let slots = self.slots.read().await;
        let mut rows: Vec<AttachmentSlot> = slots
            .values()
            .filter(|s| s.owner_type == owner_type && s.owner_id == owner_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.slot_name.cmp(&b.slot_name));
        Ok(rows)
    }

    async fn apply(
        &self,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
    ) -> Result<Vec<SlotTransition>> {
        let mut slots = self.slots.write().await;
        Ok(self.apply_locked(&mut slots, owner_type, owner_id, writes))
    }

    async fn apply_and_unregister(
        &self,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
        unregister_slots: &[String],
    ) -> Result<SlotCommit> {
        let blobs = match (&self.blobs, unregister_slots.is_empty()) {
            (Some(blobs), _) => Some(blobs),
            (None, true) => None,
            (None, false) => {
                return Err(Error::Config(
                    "memory slot repository has no linked blob repository".into(),
                ))
            }
        };

        let mut slots = self.slots.write().await;
        let transitions = self.apply_locked(&mut slots, owner_type, owner_id, writes);

        let mut unregistered = Vec::new();
        if let Some(blobs) = blobs {
            let mut rows = blobs.blobs.write().await;
            for transition in &transitions {
                if !unregister_slots.contains(&transition.slot_name) {
                    continue;
                }
                let Some(released) = transition.released() else {
                    continue;
                };
                if slots.values().any(|s| s.blob_id == released) {
                    continue;
                }
                if let Some(blob) = rows.remove(&released) {
                    unregistered.push(blob);
                }
            }
        }

        Ok(SlotCommit {
            transitions,
            unregistered,
        })
    }

    async fn delete_for_owner(
        &self,
        owner_type: &str,
        owner_id: Uuid,
    ) -> Result<Vec<AttachmentSlot>> {
        let mut slots = self.slots.write().await;
        let keys: Vec<SlotKey> = slots
            .keys()
            .filter(|k| k.owner_type == owner_type && k.owner_id == owner_id)
            .cloned()
            .collect();

        let mut removed: Vec<AttachmentSlot> =
            keys.iter().filter_map(|k| slots.remove(k)).collect();
        self.writes.fetch_add(removed.len(), Ordering::SeqCst);
        removed.sort_by(|a, b| a.slot_name.cmp(&b.slot_name));
        Ok(removed)
    }

    async fn reference_count(&self, blob_id: Uuid) -> Result<i64> {
        let slots = self.slots.read().await;
        Ok(slots.values().filter(|s| s.blob_id == blob_id).count() as i64)
    }
}

// =============================================================================
// TASK QUEUE
// =============================================================================

/// In-process task queue.
///
/// Completed tasks are dropped and only counted. Tasks that ran out of
/// attempts are kept in a bounded history for inspection.
pub struct MemoryTaskQueue {
    live: Mutex<Vec<QueuedTask>>,
    failed: Mutex<VecDeque<QueuedTask>>,
    completed: AtomicUsize,
    max_attempts: i32,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_max_attempts(JOB_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(max_attempts: i32) -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            failed: Mutex::new(VecDeque::new()),
            completed: AtomicUsize::new(0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Pending and running tasks in enqueue order, followed by retained
    /// failures, oldest first.
    pub async fn tasks(&self) -> Vec<QueuedTask> {
        let mut tasks = self.live.lock().await.clone();
        tasks.extend(self.failed.lock().await.iter().cloned());
        tasks
    }

    /// Payloads of tasks still waiting to run.
    pub async fn pending(&self) -> Vec<PurgeTask> {
        self.live
            .lock()
            .await
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.payload.clone())
            .collect()
    }

    /// Number of tasks completed so far.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Move a task that exhausted its attempts into the failure history.
    async fn retire_failed(&self, task: QueuedTask) {
        let mut failed = self.failed.lock().await;
        if failed.len() == MEMORY_FAILED_TASK_HISTORY {
            failed.pop_front();
        }
        failed.push_back(task);
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: PurgeTask) -> Result<Uuid> {
        let id = new_v7();
        self.live.lock().await.push(QueuedTask {
            id,
            kind: TaskKind::PurgeBlob,
            payload: task,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            enqueued_at: Utc::now(),
            started_at: None,
        });
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<QueuedTask>> {
        let mut live = self.live.lock().await;
        Ok(live
            .iter_mut()
            .find(|t| t.status == TaskStatus::Pending)
            .map(|t| {
                t.status = TaskStatus::Running;
                t.attempts += 1;
                t.started_at = Some(Utc::now());
                t.clone()
            }))
    }

    async fn complete(&self, task_id: Uuid) -> Result<()> {
        let mut live = self.live.lock().await;
        let index = live
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| Error::Job(format!("task {} not found", task_id)))?;
        live.remove(index);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let retired = {
            let mut live = self.live.lock().await;
            let index = live
                .iter()
                .position(|t| t.id == task_id)
                .ok_or_else(|| Error::Job(format!("task {} not found", task_id)))?;
            let task = &mut live[index];
            task.last_error = Some(error.to_string());
            task.started_at = None;
            if task.attempts < task.max_attempts {
                task.status = TaskStatus::Pending;
                None
            } else {
                task.status = TaskStatus::Failed;
                Some(live.remove(index))
            }
        };
        if let Some(task) = retired {
            self.retire_failed(task).await;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64> {
        let live = self.live.lock().await;
        Ok(live
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count() as i64)
    }

    async fn requeue_stale(&self, older_than: std::time::Duration) -> Result<u64> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::Job(format!("stale threshold out of range: {}", e)))?;
        let cutoff = Utc::now() - older_than;
        let mut retired = Vec::new();
        let mut touched = 0;
        {
            let mut live = self.live.lock().await;
            let mut index = 0;
            while index < live.len() {
                let task = &mut live[index];
                let stale = task.status == TaskStatus::Running
                    && task.started_at.map_or(true, |at| at <= cutoff);
                if !stale {
                    index += 1;
                    continue;
                }
                touched += 1;
                task.started_at = None;
                task.last_error = Some("worker lost while running".into());
                if task.attempts < task.max_attempts {
                    task.status = TaskStatus::Pending;
                    index += 1;
                } else {
                    task.status = TaskStatus::Failed;
                    retired.push(live.remove(index));
                }
            }
        }
        for task in retired {
            self.retire_failed(task).await;
        }
        Ok(touched)
    }
}
