//! Identifier generation.
//!
//! Blob, slot, and task ids are UUIDv7 so rows sort by creation time. The
//! sweep pages through blobs by `(created_at, id)` and relies on that.

use uuid::Uuid;

/// Generate a new time-ordered identifier.
///
/// ```
/// use attache_core::uuid_utils::new_v7;
///
/// assert_eq!(new_v7().get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
