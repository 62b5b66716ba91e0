//! The owning entity seam.

use uuid::Uuid;

use attache_core::Result;

/// An entity that holds attachment slots.
///
/// The owning persistence layer implements this for its records. An owner
/// with no id has not been persisted yet; slot changes staged against it are
/// held in memory until it has one.
pub trait Owner: Send + Sync {
    /// Type name slots are declared against, e.g. `"User"`.
    fn owner_type(&self) -> &str;

    /// Durable identity, once persisted.
    fn owner_id(&self) -> Option<Uuid>;

    /// Run owner validation before a combined write commits.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}
