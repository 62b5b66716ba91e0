//! Commit-gated slot changes.
//!
//! A [`Transaction`] stages slot bindings in memory. Nothing reaches the
//! slot repository until [`Transaction::commit`], and purge effects are only
//! resolved and flushed after the slot writes have been applied. Blob rows
//! released by a purge-now slot are deleted in the same repository
//! transaction as the slot writes; their bytes go after. Dropping a
//! transaction discards everything it staged; blobs it already uploaded stay
//! registered but unreferenced.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

use attache_core::{Attachable, Blob, Error, Result, SlotKey, SlotTransition, SlotWrite};

use crate::definitions::SlotDefinition;
use crate::manager::AttachmentLifecycleManager;
use crate::owner::Owner;
use crate::slot::SlotState;

/// What to do with the blob a slot releases when the transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Purge later if the slot is dependent, keep otherwise.
    FollowDependency,
    /// Keep the blob regardless of dependency.
    Keep,
    /// Unregister with the slot writes and delete the bytes before returning.
    PurgeNow,
    /// Enqueue a deferred purge.
    PurgeLater,
}

/// Side effect resolved after slot writes are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingEffect {
    /// Row already deleted with the slot writes; only the bytes remain.
    PurgeInline(Blob),
    EnqueuePurge(Blob),
}

#[derive(Debug, Clone)]
struct StagedSlot {
    definition: SlotDefinition,
    original: SlotState,
    current: SlotState,
    action: ReleaseAction,
}

/// What a commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Slot changes as applied by the repository.
    pub transitions: Vec<SlotTransition>,
    /// Ids of deferred purge tasks enqueued after commit.
    pub enqueued: Vec<Uuid>,
    /// Blobs purged inline.
    pub purged: Vec<Uuid>,
    /// Released blobs left in place (independent slot, plain detach, or
    /// still referenced elsewhere).
    pub retained: Vec<Uuid>,
}

impl CommitOutcome {
    /// Whether the commit wrote nothing.
    pub fn is_noop(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// Staged slot changes for one owner.
pub struct Transaction<'m> {
    manager: &'m AttachmentLifecycleManager,
    owner_type: String,
    owner_id: Option<Uuid>,
    staged: BTreeMap<String, StagedSlot>,
}

impl<'m> Transaction<'m> {
    pub(crate) fn new(manager: &'m AttachmentLifecycleManager, owner: &dyn Owner) -> Self {
        Self {
            manager,
            owner_type: owner.owner_type().to_string(),
            owner_id: owner.owner_id(),
            staged: BTreeMap::new(),
        }
    }

    pub fn owner_type(&self) -> &str {
        &self.owner_type
    }

    /// Whether any staged slot differs from its state at transaction start.
    pub fn is_dirty(&self) -> bool {
        self.staged.values().any(|s| s.current != s.original)
    }

    /// Current staged state of a slot.
    pub async fn slot_state(&mut self, slot_name: &str) -> Result<SlotState> {
        Ok(self.stage(slot_name).await?.current)
    }

    /// Resolve `attachable` and stage it into the slot.
    ///
    /// Uploads happen immediately, even for an owner that is not persisted
    /// yet; only the slot binding waits for commit. `None` is rejected with
    /// [`Error::Unattachable`] and leaves the slot unchanged.
    pub async fn attach(
        &mut self,
        slot_name: &str,
        attachable: Option<Attachable>,
    ) -> Result<Blob> {
        let definition = self.manager.definitions().get(&self.owner_type, slot_name)?;
        let attachable =
            attachable.ok_or_else(|| Error::Unattachable(definition.qualified_name()))?;

        let blob = self.manager.registry().find_or_create(&attachable).await?;

        let staged = self.stage(slot_name).await?;
        let transition = staged.current.attach(blob.id);
        if transition.is_noop() {
            debug!(
                subsystem = "lifecycle",
                op = "attach",
                slot = slot_name,
                blob_id = %blob.id,
                "Blob already bound, nothing to stage"
            );
        } else {
            staged.current = transition.to;
            staged.action = ReleaseAction::FollowDependency;
        }
        Ok(blob)
    }

    /// Stage the owner-update form: attach when given, detach-and-maybe-purge
    /// when `None`.
    pub async fn replace(
        &mut self,
        slot_name: &str,
        attachable: Option<Attachable>,
    ) -> Result<Option<Blob>> {
        match attachable {
            Some(attachable) => self.attach(slot_name, Some(attachable)).await.map(Some),
            None => {
                self.detach_and_maybe_purge(slot_name).await?;
                Ok(None)
            }
        }
    }

    /// Stage an unbind that never purges.
    pub async fn detach(&mut self, slot_name: &str) -> Result<Option<Uuid>> {
        self.stage_detach(slot_name, ReleaseAction::Keep).await
    }

    /// Stage an unbind that purges later when the slot is dependent.
    pub async fn detach_and_maybe_purge(&mut self, slot_name: &str) -> Result<Option<Uuid>> {
        self.stage_detach(slot_name, ReleaseAction::FollowDependency)
            .await
    }

    /// Stage an unbind whose blob is purged inline on commit.
    pub async fn purge_now(&mut self, slot_name: &str) -> Result<Option<Uuid>> {
        self.stage_detach(slot_name, ReleaseAction::PurgeNow).await
    }

    /// Stage an unbind whose blob is purged by a deferred task after commit.
    pub async fn purge_later(&mut self, slot_name: &str) -> Result<Option<Uuid>> {
        self.stage_detach(slot_name, ReleaseAction::PurgeLater).await
    }

    async fn stage_detach(
        &mut self,
        slot_name: &str,
        action: ReleaseAction,
    ) -> Result<Option<Uuid>> {
        let staged = self.stage(slot_name).await?;
        let previous = staged.current.blob_id();
        staged.current = staged.current.detach().to;
        staged.action = action;
        Ok(previous)
    }

    /// Fetch (loading on first use) the staged entry for a slot.
    async fn stage(&mut self, slot_name: &str) -> Result<&mut StagedSlot> {
        if !self.staged.contains_key(slot_name) {
            let definition = self
                .manager
                .definitions()
                .get(&self.owner_type, slot_name)?
                .clone();
            let original = match self.owner_id {
                Some(owner_id) => {
                    let key = SlotKey::new(self.owner_type.clone(), owner_id, slot_name);
                    SlotState::from(self.manager.slots().get(&key).await?.as_ref())
                }
                None => SlotState::Empty,
            };
            self.staged.insert(
                slot_name.to_string(),
                StagedSlot {
                    definition,
                    original,
                    current: original,
                    action: ReleaseAction::FollowDependency,
                },
            );
        }
        self.staged
            .get_mut(slot_name)
            .ok_or_else(|| Error::Internal(format!("slot {} not staged", slot_name)))
    }

    /// Discard everything staged.
    pub fn rollback(self) {
        debug!(
            subsystem = "lifecycle",
            op = "rollback",
            owner_type = %self.owner_type,
            staged = self.staged.len(),
            "Transaction rolled back"
        );
    }

    /// Validate the owner, apply all slot writes at once, then flush effects.
    ///
    /// Validation failure or a missing owner id discards the transaction
    /// with no slot writes and no purge scheduled.
    pub async fn commit(self, owner: &dyn Owner) -> Result<CommitOutcome> {
        let start = Instant::now();

        if owner.owner_type() != self.owner_type {
            return Err(Error::Internal(format!(
                "transaction for {} committed with {} owner",
                self.owner_type,
                owner.owner_type()
            )));
        }

        if let Err(e) = owner.validate() {
            debug!(
                subsystem = "lifecycle",
                op = "commit",
                owner_type = %self.owner_type,
                error = %e,
                "Owner validation failed, discarding staged slot changes"
            );
            return Err(e);
        }

        let owner_id = owner
            .owner_id()
            .ok_or_else(|| Error::OwnerNotPersisted(self.owner_type.clone()))?;
        if let Some(begun_with) = self.owner_id {
            if begun_with != owner_id {
                return Err(Error::Internal(format!(
                    "transaction begun for {} {} committed with {}",
                    self.owner_type, begun_with, owner_id
                )));
            }
        }

        let writes: Vec<SlotWrite> = self
            .staged
            .iter()
            .filter(|(_, s)| s.current != s.original)
            .map(|(name, s)| match s.current {
                SlotState::Bound(blob_id) => SlotWrite::Bind {
                    slot_name: name.clone(),
                    blob_id,
                },
                SlotState::Empty => SlotWrite::Clear {
                    slot_name: name.clone(),
                },
            })
            .collect();

        if writes.is_empty() {
            return Ok(CommitOutcome::default());
        }

        let inline_slots: Vec<String> = self
            .staged
            .iter()
            .filter(|(_, s)| s.current != s.original && s.action == ReleaseAction::PurgeNow)
            .map(|(name, _)| name.clone())
            .collect();

        let commit = self
            .manager
            .slots()
            .apply_and_unregister(&self.owner_type, owner_id, &writes, &inline_slots)
            .await?;

        // Two slots may release the same blob; it gets at most one effect.
        let mut outcome = CommitOutcome::default();
        let mut effects = Vec::new();
        let mut scheduled = HashSet::new();
        let mut kept = Vec::new();
        for transition in &commit.transitions {
            let Some(released) = transition.released() else {
                continue;
            };
            if scheduled.contains(&released) {
                continue;
            }
            let effect = match commit.unregistered(released) {
                Some(blob) => Some(PendingEffect::PurgeInline(blob.clone())),
                None => match self.staged.get(&transition.slot_name) {
                    Some(staged) => self.resolve_effect(staged, released).await?,
                    None => None,
                },
            };
            match effect {
                Some(effect) => {
                    scheduled.insert(released);
                    effects.push(effect);
                }
                None => kept.push(released),
            }
        }
        for blob_id in kept {
            if !scheduled.contains(&blob_id) && !outcome.retained.contains(&blob_id) {
                outcome.retained.push(blob_id);
            }
        }
        outcome.transitions = commit.transitions;

        self.manager.flush_effects(effects, &mut outcome).await?;

        info!(
            subsystem = "lifecycle",
            op = "commit",
            owner_type = %self.owner_type,
            %owner_id,
            writes = writes.len(),
            enqueued = outcome.enqueued.len(),
            purged = outcome.purged.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Slot changes committed"
        );
        Ok(outcome)
    }

    /// Decide whether a released blob gets a deferred purge.
    ///
    /// Purge-now slots are settled by the repository; a blob they release
    /// that was not unregistered is still referenced and stays.
    async fn resolve_effect(
        &self,
        staged: &StagedSlot,
        released: Uuid,
    ) -> Result<Option<PendingEffect>> {
        match staged.action {
            ReleaseAction::Keep | ReleaseAction::PurgeNow => return Ok(None),
            ReleaseAction::FollowDependency if !staged.definition.is_dependent() => {
                return Ok(None)
            }
            ReleaseAction::FollowDependency | ReleaseAction::PurgeLater => {}
        }

        Ok(self
            .manager
            .purgeable_blob(released)
            .await?
            .map(PendingEffect::EnqueuePurge))
    }
}
