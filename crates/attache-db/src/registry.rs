//! Blob registry: resolves attachables to durable blobs and purges them.
//!
//! The registry is independent of owners and slots. It pairs a
//! [`BlobRepository`] with a [`ContentStore`] and is the single place where an
//! [`Attachable`] is turned into a [`Blob`].

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use attache_core::{
    compute_checksum, generate_storage_key, identify_content_type, new_v7, Attachable, Blob,
    BlobRepository, ContentStore, Error, Result, SignedIdCodec, SlotRepository, UploadBundle,
};

/// Page size used when the sweep walks the blob table.
pub const SWEEP_BATCH_SIZE: i64 = 500;

/// Durable blob records plus the content store holding their bytes.
#[derive(Clone)]
pub struct BlobRegistry {
    blobs: Arc<dyn BlobRepository>,
    store: Arc<dyn ContentStore>,
    codec: SignedIdCodec,
}

impl BlobRegistry {
    pub fn new(
        blobs: Arc<dyn BlobRepository>,
        store: Arc<dyn ContentStore>,
        codec: SignedIdCodec,
    ) -> Self {
        Self {
            blobs,
            store,
            codec,
        }
    }

    /// The content store this registry uploads to.
    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Resolve an attachable to a registered blob.
    ///
    /// Blob references and signed IDs resolve to existing rows without
    /// touching the store. Upload bundles register and upload new content.
    pub async fn find_or_create(&self, attachable: &Attachable) -> Result<Blob> {
        match attachable {
            Attachable::Blob(blob) => self.get(blob.id).await,
            Attachable::SignedId(token) => self.find_signed(token).await,
            Attachable::Upload(bundle) => self.create_and_upload(bundle).await,
        }
    }

    /// Fetch a blob by id, if registered.
    pub async fn find(&self, id: Uuid) -> Result<Option<Blob>> {
        self.blobs.get(id).await
    }

    /// Fetch a blob by id, failing with `BlobNotFound` when missing.
    pub async fn get(&self, id: Uuid) -> Result<Blob> {
        self.blobs.get(id).await?.ok_or(Error::BlobNotFound(id))
    }

    /// Issue a signed ID for a blob.
    pub fn signed_id(&self, blob: &Blob) -> String {
        self.codec.encode(blob.id)
    }

    /// Resolve a signed ID to the blob it names.
    pub async fn find_signed(&self, token: &str) -> Result<Blob> {
        let id = self.codec.decode(token)?;
        self.get(id).await
    }

    /// Register new content: insert the row, then upload the bytes.
    ///
    /// A failed upload removes the row again before the error is returned.
    pub async fn create_and_upload(&self, bundle: &UploadBundle) -> Result<Blob> {
        let start = Instant::now();
        let blob = Blob {
            id: new_v7(),
            storage_key: generate_storage_key(),
            filename: bundle.filename.clone(),
            content_type: identify_content_type(bundle.content_type.as_deref(), &bundle.data),
            byte_size: bundle.data.len() as i64,
            checksum: compute_checksum(&bundle.data),
            created_at: Utc::now(),
        };

        self.blobs.insert(&blob).await?;

        if let Err(e) = self.store.put(&blob.storage_key, &bundle.data).await {
            warn!(
                subsystem = "registry",
                op = "create_and_upload",
                blob_id = %blob.id,
                storage_key = %blob.storage_key,
                error = %e,
                "Upload failed, removing blob row"
            );
            if let Err(cleanup) = self.blobs.delete(blob.id).await {
                warn!(
                    subsystem = "registry",
                    blob_id = %blob.id,
                    error = %cleanup,
                    "Failed to remove blob row after upload failure"
                );
            }
            return Err(e);
        }

        info!(
            subsystem = "registry",
            op = "create_and_upload",
            blob_id = %blob.id,
            storage_key = %blob.storage_key,
            filename = %blob.filename,
            content_type = %blob.content_type,
            byte_size = blob.byte_size,
            duration_ms = start.elapsed().as_millis() as u64,
            "Blob registered"
        );
        Ok(blob)
    }

    /// Whether the blob's bytes are present in the content store.
    pub async fn exists_in_store(&self, blob: &Blob) -> Result<bool> {
        self.store.exist(&blob.storage_key).await
    }

    /// Read the blob's bytes.
    pub async fn download(&self, blob: &Blob) -> Result<Vec<u8>> {
        self.store.read(&blob.storage_key).await
    }

    /// Delete the blob's bytes, then its row. Safe to repeat.
    pub async fn purge(&self, blob: &Blob) -> Result<()> {
        self.purge_by_id(blob.id, &blob.storage_key).await?;
        Ok(())
    }

    /// Delete only the bytes of a blob whose row is already gone.
    pub async fn delete_content(&self, blob: &Blob) -> Result<()> {
        self.store.delete(&blob.storage_key).await?;
        info!(
            subsystem = "registry",
            op = "delete_content",
            blob_id = %blob.id,
            storage_key = %blob.storage_key,
            "Blob content deleted"
        );
        Ok(())
    }

    /// Purge by identity alone, for callers that may outlive the row.
    ///
    /// Returns `true` if a registry row was removed.
    pub async fn purge_by_id(&self, blob_id: Uuid, storage_key: &str) -> Result<bool> {
        self.store.delete(storage_key).await?;
        let removed = self.blobs.delete(blob_id).await?;
        if removed {
            info!(
                subsystem = "registry",
                op = "purge",
                %blob_id,
                storage_key,
                "Blob purged"
            );
        } else {
            debug!(
                subsystem = "registry",
                op = "purge",
                %blob_id,
                storage_key,
                "Blob row already gone"
            );
        }
        Ok(removed)
    }

    /// Purge blobs older than `min_age` that no slot references.
    ///
    /// Walks every candidate in pages of [`SWEEP_BATCH_SIZE`], oldest first,
    /// and returns how many were purged.
    pub async fn sweep_unattached(
        &self,
        slots: &dyn SlotRepository,
        min_age: Duration,
    ) -> Result<usize> {
        let start = Instant::now();
        let cutoff = Utc::now() - min_age;

        let mut cursor = None;
        let mut examined = 0;
        let mut purged = 0;
        loop {
            let page = self
                .blobs
                .list_created_before(cutoff, cursor, SWEEP_BATCH_SIZE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some((last.created_at, last.id));
            examined += page.len();

            for blob in &page {
                if slots.reference_count(blob.id).await? > 0 {
                    continue;
                }
                if self.purge_by_id(blob.id, &blob.storage_key).await? {
                    purged += 1;
                }
            }

            if (page.len() as i64) < SWEEP_BATCH_SIZE {
                break;
            }
        }

        info!(
            subsystem = "registry",
            op = "sweep",
            examined,
            purged,
            duration_ms = start.elapsed().as_millis() as u64,
            "Unattached blob sweep finished"
        );
        Ok(purged)
    }
}
