//! # attache-lifecycle
//!
//! Single-slot attachment lifecycle for attache.
//!
//! Maps one named slot on an owner to at most one blob, handles
//! attach/replace/detach transitions, and decides between inline and
//! deferred purging of released blobs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use attache_lifecycle::{AttachmentLifecycleManager, SlotDefinition};
//!
//! let manager = AttachmentLifecycleManager::builder(registry, slots, queue)
//!     .slot(SlotDefinition::new("User", "avatar"))?
//!     .slot(SlotDefinition::independent("User", "cover_photo"))?
//!     .build();
//!
//! // New owner: the blob uploads now, the binding waits for the owner.
//! let mut tx = manager.begin(&user);
//! tx.attach("avatar", Some(Attachable::upload("racecar.jpg", "image/jpeg", bytes))).await?;
//! user.save().await?;
//! tx.commit(&user).await?;
//!
//! // Persisted owner: one call, purge of the old avatar enqueued after commit.
//! manager.attach(&user, "avatar", Some(new_avatar)).await?;
//! ```

pub mod definitions;
pub mod manager;
pub mod owner;
pub mod slot;
pub mod transaction;

pub use definitions::{Dependency, SlotDefinition, SlotRegistry};
pub use manager::{AttachmentLifecycleManager, ManagerBuilder};
pub use owner::Owner;
pub use slot::{SlotState, Transition};
pub use transaction::{CommitOutcome, PendingEffect, ReleaseAction, Transaction};
