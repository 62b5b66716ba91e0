//! The attachment lifecycle manager.
//!
//! Orchestrates attach, replace, detach, and purge across slot bindings and
//! the blob registry. Every mutating operation on a persisted owner runs as
//! one [`Transaction`]; purge scheduling happens only after the slot writes
//! succeed.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use attache_core::{
    Attachable, Blob, Error, PurgeTask, Result, SlotKey, SlotRepository, SlotTransition,
    TaskQueue,
};
use attache_db::BlobRegistry;

use crate::definitions::{SlotDefinition, SlotRegistry};
use crate::owner::Owner;
use crate::slot::SlotState;
use crate::transaction::{CommitOutcome, PendingEffect, Transaction};

/// Coordinates slots, blobs, and deferred purges.
pub struct AttachmentLifecycleManager {
    definitions: SlotRegistry,
    registry: BlobRegistry,
    slots: Arc<dyn SlotRepository>,
    queue: Arc<dyn TaskQueue>,
}

impl AttachmentLifecycleManager {
    pub fn new(
        definitions: SlotRegistry,
        registry: BlobRegistry,
        slots: Arc<dyn SlotRepository>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            definitions,
            registry,
            slots,
            queue,
        }
    }

    pub fn builder(
        registry: BlobRegistry,
        slots: Arc<dyn SlotRepository>,
        queue: Arc<dyn TaskQueue>,
    ) -> ManagerBuilder {
        ManagerBuilder {
            definitions: SlotRegistry::new(),
            registry,
            slots,
            queue,
        }
    }

    pub fn definitions(&self) -> &SlotRegistry {
        &self.definitions
    }

    pub fn registry(&self) -> &BlobRegistry {
        &self.registry
    }

    pub fn slots(&self) -> &dyn SlotRepository {
        self.slots.as_ref()
    }

    pub fn queue(&self) -> &dyn TaskQueue {
        self.queue.as_ref()
    }

    /// Start staging slot changes for `owner`.
    pub fn begin(&self, owner: &dyn Owner) -> Transaction<'_> {
        Transaction::new(self, owner)
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Bind `attachable` to the slot and commit.
    ///
    /// When this replaces a dependent slot's blob and nothing else references
    /// it, a deferred purge is enqueued after the commit.
    pub async fn attach(
        &self,
        owner: &dyn Owner,
        slot_name: &str,
        attachable: Option<Attachable>,
    ) -> Result<CommitOutcome> {
        let mut tx = self.begin(owner);
        tx.attach(slot_name, attachable).await?;
        tx.commit(owner).await
    }

    /// Owner update carrying a new value for the slot.
    ///
    /// `Some` behaves like [`attach`](Self::attach), `None` like
    /// [`detach_and_maybe_purge`](Self::detach_and_maybe_purge). Owner
    /// validation failure leaves the slot and any released blob untouched.
    pub async fn replace_via_owner_update(
        &self,
        owner: &dyn Owner,
        slot_name: &str,
        attachable: Option<Attachable>,
    ) -> Result<CommitOutcome> {
        let mut tx = self.begin(owner);
        tx.replace(slot_name, attachable).await?;
        tx.commit(owner).await
    }

    /// Unbind the slot, leaving the blob in place regardless of dependency.
    pub async fn detach(&self, owner: &dyn Owner, slot_name: &str) -> Result<CommitOutcome> {
        let mut tx = self.begin(owner);
        tx.detach(slot_name).await?;
        tx.commit(owner).await
    }

    /// Unbind the slot; a dependent slot's unreferenced blob is purged later.
    pub async fn detach_and_maybe_purge(
        &self,
        owner: &dyn Owner,
        slot_name: &str,
    ) -> Result<CommitOutcome> {
        let mut tx = self.begin(owner);
        tx.detach_and_maybe_purge(slot_name).await?;
        tx.commit(owner).await
    }

    /// Unbind the slot, then delete the blob's row and bytes before returning.
    ///
    /// The row goes in the same repository transaction as the slot write,
    /// and only if nothing else references the blob. The bytes are deleted
    /// after; a store failure is returned with the slot and row already gone.
    pub async fn purge_now(&self, owner: &dyn Owner, slot_name: &str) -> Result<CommitOutcome> {
        let mut tx = self.begin(owner);
        tx.purge_now(slot_name).await?;
        tx.commit(owner).await
    }

    /// Unbind the slot and enqueue a deferred purge of its blob.
    pub async fn purge_later(&self, owner: &dyn Owner, slot_name: &str) -> Result<CommitOutcome> {
        let mut tx = self.begin(owner);
        tx.purge_later(slot_name).await?;
        tx.commit(owner).await
    }

    /// Drop every slot binding of a destroyed owner.
    ///
    /// Blobs held by dependent slots are purged later once unreferenced;
    /// blobs held by independent slots survive.
    pub async fn on_owner_destroyed(&self, owner: &dyn Owner) -> Result<CommitOutcome> {
        let owner_type = owner.owner_type();
        let owner_id = owner
            .owner_id()
            .ok_or_else(|| Error::OwnerNotPersisted(owner_type.to_string()))?;

        let removed = self.slots.delete_for_owner(owner_type, owner_id).await?;

        let mut outcome = CommitOutcome::default();
        let mut effects = Vec::new();
        let mut scheduled = HashSet::new();
        for row in &removed {
            outcome.transitions.push(SlotTransition {
                slot_name: row.slot_name.clone(),
                previous: Some(row.blob_id),
                current: None,
            });

            let dependent = match self.definitions.get(owner_type, &row.slot_name) {
                Ok(definition) => definition.is_dependent(),
                Err(_) => {
                    warn!(
                        subsystem = "lifecycle",
                        owner_type,
                        slot = %row.slot_name,
                        "Removed binding for undeclared slot, keeping its blob"
                    );
                    false
                }
            };
            if !dependent {
                outcome.retained.push(row.blob_id);
                continue;
            }
            if !scheduled.insert(row.blob_id) {
                continue;
            }
            match self.purgeable_blob(row.blob_id).await? {
                Some(blob) => effects.push(PendingEffect::EnqueuePurge(blob)),
                None => outcome.retained.push(row.blob_id),
            }
        }

        self.flush_effects(effects, &mut outcome).await?;

        info!(
            subsystem = "lifecycle",
            op = "owner_destroyed",
            owner_type,
            %owner_id,
            removed = removed.len(),
            enqueued = outcome.enqueued.len(),
            "Owner slot bindings removed"
        );
        Ok(outcome)
    }

    // =========================================================================
    // EFFECTS
    // =========================================================================

    /// The blob, if it is registered and no slot references it.
    pub(crate) async fn purgeable_blob(&self, blob_id: Uuid) -> Result<Option<Blob>> {
        let references = self.slots().reference_count(blob_id).await?;
        if references > 0 {
            debug!(
                subsystem = "lifecycle",
                %blob_id,
                references,
                "Released blob still referenced, not purging"
            );
            return Ok(None);
        }
        self.registry().find(blob_id).await
    }

    /// Run post-commit effects, recording them in `outcome`.
    pub(crate) async fn flush_effects(
        &self,
        effects: Vec<PendingEffect>,
        outcome: &mut CommitOutcome,
    ) -> Result<()> {
        for effect in effects {
            match effect {
                PendingEffect::EnqueuePurge(blob) => {
                    let task_id = self.queue().enqueue(PurgeTask::for_blob(&blob)).await?;
                    debug!(
                        subsystem = "lifecycle",
                        blob_id = %blob.id,
                        %task_id,
                        "Deferred purge enqueued"
                    );
                    outcome.enqueued.push(task_id);
                }
                PendingEffect::PurgeInline(blob) => {
                    if let Err(e) = self.registry().delete_content(&blob).await {
                        warn!(
                            subsystem = "lifecycle",
                            blob_id = %blob.id,
                            storage_key = %blob.storage_key,
                            error = %e,
                            "Inline purge failed after slot and row were removed"
                        );
                        return Err(e);
                    }
                    outcome.purged.push(blob.id);
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Committed state of a slot. Unsaved owners have only empty slots.
    pub async fn slot_state(&self, owner: &dyn Owner, slot_name: &str) -> Result<SlotState> {
        self.definitions.get(owner.owner_type(), slot_name)?;
        let Some(owner_id) = owner.owner_id() else {
            return Ok(SlotState::Empty);
        };
        let key = SlotKey::new(owner.owner_type(), owner_id, slot_name);
        Ok(SlotState::from(self.slots.get(&key).await?.as_ref()))
    }

    /// The blob bound to a slot, if any.
    pub async fn blob_for(&self, owner: &dyn Owner, slot_name: &str) -> Result<Option<Blob>> {
        match self.slot_state(owner, slot_name).await? {
            SlotState::Empty => Ok(None),
            SlotState::Bound(blob_id) => {
                let blob = self.registry.find(blob_id).await?;
                if blob.is_none() {
                    debug!(%blob_id, slot = slot_name, "Bound blob missing from registry");
                }
                Ok(blob)
            }
        }
    }

    pub async fn is_attached(&self, owner: &dyn Owner, slot_name: &str) -> Result<bool> {
        Ok(self.slot_state(owner, slot_name).await?.is_bound())
    }

    /// Blob currently bound, by id only.
    pub async fn bound_blob_id(&self, owner: &dyn Owner, slot_name: &str) -> Result<Option<Uuid>> {
        Ok(self.slot_state(owner, slot_name).await?.blob_id())
    }
}

/// Builder collecting slot declarations.
pub struct ManagerBuilder {
    definitions: SlotRegistry,
    registry: BlobRegistry,
    slots: Arc<dyn SlotRepository>,
    queue: Arc<dyn TaskQueue>,
}

impl ManagerBuilder {
    /// Declare a slot.
    pub fn slot(mut self, definition: SlotDefinition) -> Result<Self> {
        self.definitions.register(definition)?;
        Ok(self)
    }

    pub fn build(self) -> AttachmentLifecycleManager {
        AttachmentLifecycleManager::new(self.definitions, self.registry, self.slots, self.queue)
    }
}
