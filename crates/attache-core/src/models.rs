//! Data model shared by every attache crate.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// BLOBS
// =============================================================================

/// Durable record describing one piece of stored content.
///
/// Immutable after creation. `storage_key` names the bytes in the content
/// store and is never reused for different content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub id: Uuid,
    pub storage_key: String,
    pub filename: String,
    pub content_type: String,
    pub byte_size: i64,
    /// Base64-encoded MD5 digest of the stored bytes.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Raw bytes plus the metadata needed to register them as a new blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadBundle {
    pub filename: String,
    /// Declared MIME type. When absent the registry identifies it from the bytes.
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl UploadBundle {
    /// Create a bundle with a declared content type.
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: Some(content_type.into()),
            data: data.into(),
        }
    }

    /// Create a bundle whose content type will be identified from the bytes.
    pub fn untyped(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            data: data.into(),
        }
    }
}

/// Anything that can be bound to an attachment slot.
///
/// Resolved exactly once, at the blob registry boundary.
#[derive(Debug, Clone)]
pub enum Attachable {
    /// An already registered blob.
    Blob(Blob),
    /// A signed reference to a registered blob.
    SignedId(String),
    /// New content to register and upload.
    Upload(UploadBundle),
}

impl Attachable {
    /// Shorthand for an upload with a declared content type.
    pub fn upload(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Attachable::Upload(UploadBundle::new(filename, content_type, data))
    }

    /// Parse loosely typed input (form parameters, JSON bodies).
    ///
    /// `null` and `""` mean "nothing to attach" and yield `Ok(None)`. Strings
    /// are signed IDs, objects carrying `data` + `filename` are uploads with
    /// base64 content, and objects shaped like a [`Blob`] are blob references.
    /// Everything else is rejected with [`Error::InvalidAttachable`].
    pub fn from_json(value: &JsonValue) -> Result<Option<Self>> {
        match value {
            JsonValue::Null => Ok(None),
            JsonValue::String(s) if s.is_empty() => Ok(None),
            JsonValue::String(s) => Ok(Some(Attachable::SignedId(s.clone()))),
            JsonValue::Object(map) if map.contains_key("data") && map.contains_key("filename") => {
                let invalid = || Error::InvalidAttachable(value.to_string());
                let filename = map
                    .get("filename")
                    .and_then(JsonValue::as_str)
                    .filter(|f| !f.is_empty())
                    .ok_or_else(invalid)?;
                let encoded = map
                    .get("data")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(invalid)?;
                let data = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|_| invalid())?;
                let content_type = match map.get("content_type") {
                    None | Some(JsonValue::Null) => None,
                    Some(JsonValue::String(ct)) => Some(ct.clone()),
                    Some(_) => return Err(invalid()),
                };
                Ok(Some(Attachable::Upload(UploadBundle {
                    filename: filename.to_string(),
                    content_type,
                    data,
                })))
            }
            JsonValue::Object(_) => serde_json::from_value::<Blob>(value.clone())
                .map(|blob| Some(Attachable::Blob(blob)))
                .map_err(|_| Error::InvalidAttachable(value.to_string())),
            other => Err(Error::InvalidAttachable(other.to_string())),
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Attachable::Blob(_) => "blob",
            Attachable::SignedId(_) => "signed_id",
            Attachable::Upload(_) => "upload",
        }
    }
}

impl From<Blob> for Attachable {
    fn from(blob: Blob) -> Self {
        Attachable::Blob(blob)
    }
}

impl From<UploadBundle> for Attachable {
    fn from(bundle: UploadBundle) -> Self {
        Attachable::Upload(bundle)
    }
}

// =============================================================================
// SLOTS
// =============================================================================

/// Identity of one slot on one persisted owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub owner_type: String,
    pub owner_id: Uuid,
    pub slot_name: String,
}

impl SlotKey {
    pub fn new(owner_type: impl Into<String>, owner_id: Uuid, slot_name: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id,
            slot_name: slot_name.into(),
        }
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}.{}", self.owner_type, self.owner_id, self.slot_name)
    }
}

/// Persisted join row binding an owner slot to a blob.
///
/// A row exists only while the slot is bound; clearing the slot deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSlot {
    pub id: Uuid,
    pub owner_type: String,
    pub owner_id: Uuid,
    pub slot_name: String,
    pub blob_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl AttachmentSlot {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.owner_type.clone(), self.owner_id, self.slot_name.clone())
    }
}

/// A single slot mutation applied as part of an owner's commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotWrite {
    /// Bind the slot to a blob, replacing any existing binding.
    Bind { slot_name: String, blob_id: Uuid },
    /// Remove the slot's binding.
    Clear { slot_name: String },
}

impl SlotWrite {
    pub fn slot_name(&self) -> &str {
        match self {
            SlotWrite::Bind { slot_name, .. } | SlotWrite::Clear { slot_name } => slot_name,
        }
    }
}

/// What a [`SlotWrite`] actually changed, as observed by the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTransition {
    pub slot_name: String,
    pub previous: Option<Uuid>,
    pub current: Option<Uuid>,
}

impl SlotTransition {
    /// The blob that lost this binding, if any.
    pub fn released(&self) -> Option<Uuid> {
        match (self.previous, self.current) {
            (Some(prev), Some(cur)) if prev == cur => None,
            (prev, _) => prev,
        }
    }
}

/// Result of applying slot writes together with in-transaction blob removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotCommit {
    pub transitions: Vec<SlotTransition>,
    /// Blobs whose registry rows were deleted in the same transaction. Their
    /// bytes are still in the content store.
    pub unregistered: Vec<Blob>,
}

impl SlotCommit {
    pub fn unregistered(&self, blob_id: Uuid) -> Option<&Blob> {
        self.unregistered.iter().find(|b| b.id == blob_id)
    }
}

// =============================================================================
// DEFERRED TASKS
// =============================================================================

/// Kind of deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Delete an orphaned blob's bytes and registry row.
    PurgeBlob,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::PurgeBlob => "purge_blob",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "purge_blob" => Ok(Self::PurgeBlob),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Payload of a deferred purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeTask {
    pub blob_id: Uuid,
    pub storage_key: String,
}

impl PurgeTask {
    pub fn for_blob(blob: &Blob) -> Self {
        Self {
            blob_id: blob.id,
            storage_key: blob.storage_key.clone(),
        }
    }
}

/// A task as held by a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: PurgeTask,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// When the current attempt was claimed; `None` unless running.
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_blob() -> Blob {
        Blob {
            id: Uuid::now_v7(),
            storage_key: "abc123".to_string(),
            filename: "racecar.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            byte_size: 10,
            checksum: "x".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_json_null_is_nothing() {
        assert!(Attachable::from_json(&JsonValue::Null).unwrap().is_none());
        assert!(Attachable::from_json(&json!("")).unwrap().is_none());
    }

    #[test]
    fn test_from_json_string_is_signed_id() {
        match Attachable::from_json(&json!("token--abc")).unwrap() {
            Some(Attachable::SignedId(s)) => assert_eq!(s, "token--abc"),
            other => panic!("expected signed id, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_upload_bundle() {
        let value = json!({
            "data": base64::engine::general_purpose::STANDARD.encode(b"STUFF"),
            "filename": "town.jpg",
            "content_type": "image/jpeg",
        });
        match Attachable::from_json(&value).unwrap() {
            Some(Attachable::Upload(bundle)) => {
                assert_eq!(bundle.filename, "town.jpg");
                assert_eq!(bundle.content_type.as_deref(), Some("image/jpeg"));
                assert_eq!(bundle.data, b"STUFF");
            }
            other => panic!("expected upload, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_blob_reference() {
        let blob = sample_blob();
        let value = serde_json::to_value(&blob).unwrap();
        match Attachable::from_json(&value).unwrap() {
            Some(Attachable::Blob(parsed)) => assert_eq!(parsed, blob),
            other => panic!("expected blob, got {:?}", other),
        }
    }

    #[test]
    fn test_from_json_rejects_unrecognized_shapes_naming_value() {
        let err = Attachable::from_json(&json!(42)).unwrap_err();
        assert!(matches!(err, Error::InvalidAttachable(_)));
        assert!(err.to_string().contains("42"));

        let err = Attachable::from_json(&json!({"nope": true})).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_from_json_rejects_bad_base64() {
        let value = json!({"data": "***", "filename": "a.txt"});
        assert!(matches!(
            Attachable::from_json(&value),
            Err(Error::InvalidAttachable(_))
        ));
    }

    #[test]
    fn test_transition_released() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let replace = SlotTransition {
            slot_name: "avatar".into(),
            previous: Some(a),
            current: Some(b),
        };
        assert_eq!(replace.released(), Some(a));

        let same = SlotTransition {
            slot_name: "avatar".into(),
            previous: Some(a),
            current: Some(a),
        };
        assert_eq!(same.released(), None);

        let fresh = SlotTransition {
            slot_name: "avatar".into(),
            previous: None,
            current: Some(b),
        };
        assert_eq!(fresh.released(), None);
    }

    #[test]
    fn test_task_kind_round_trip_str() {
        let kind: TaskKind = TaskKind::PurgeBlob.as_str().parse().unwrap();
        assert_eq!(kind, TaskKind::PurgeBlob);
        assert!("bogus".parse::<TaskKind>().is_err());
    }
}
