//! Slot binding repository implementation.
//!
//! `apply` runs every write for one owner in a single database transaction.
//! Each affected row is locked with `FOR UPDATE` before it is rewritten so
//! the reported previous binding is the one actually replaced.
//!
//! `apply_and_unregister` also deletes, in that same transaction, the blob
//! rows that a released binding left without any reference. The blob row is
//! locked first, so a concurrent bind of the same blob either commits before
//! the count or fails on the foreign key afterwards.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use attache_core::{
    new_v7, AttachmentSlot, Blob, Error, Result, SlotCommit, SlotKey, SlotRepository,
    SlotTransition, SlotWrite,
};

use crate::blobs::{PgBlobRepository, BLOB_COLUMNS};

const SLOT_COLUMNS: &str = "id, owner_type, owner_id, slot_name, blob_id, created_at";

/// PostgreSQL implementation of SlotRepository.
#[derive(Clone)]
pub struct PgSlotRepository {
    pool: Pool<Postgres>,
}

impl PgSlotRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_slot_row(row: sqlx::postgres::PgRow) -> AttachmentSlot {
        AttachmentSlot {
            id: row.get("id"),
            owner_type: row.get("owner_type"),
            owner_id: row.get("owner_id"),
            slot_name: row.get("slot_name"),
            blob_id: row.get("blob_id"),
            created_at: row.get("created_at"),
        }
    }

    async fn apply_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
    ) -> Result<Vec<SlotTransition>> {
        let mut transitions = Vec::with_capacity(writes.len());

        for write in writes {
            let previous: Option<Uuid> = sqlx::query_scalar(
                "SELECT blob_id FROM attache_slots
                 WHERE owner_type = $1 AND owner_id = $2 AND slot_name = $3
                 FOR UPDATE",
            )
            .bind(owner_type)
            .bind(owner_id)
            .bind(write.slot_name())
            .fetch_optional(&mut **tx)
            .await
            .map_err(Error::Database)?;

            let transition = match write {
                SlotWrite::Bind { slot_name, blob_id } => {
                    if previous != Some(*blob_id) {
                        sqlx::query(
                            "INSERT INTO attache_slots (id, owner_type, owner_id, slot_name, blob_id, created_at)
                             VALUES ($1, $2, $3, $4, $5, $6)
                             ON CONFLICT (owner_type, owner_id, slot_name)
                             DO UPDATE SET blob_id = EXCLUDED.blob_id",
                        )
                        .bind(new_v7())
                        .bind(owner_type)
                        .bind(owner_id)
                        .bind(slot_name)
                        .bind(blob_id)
                        .bind(Utc::now())
                        .execute(&mut **tx)
                        .await
                        .map_err(Error::Database)?;
                    }
                    SlotTransition {
                        slot_name: slot_name.clone(),
                        previous,
                        current: Some(*blob_id),
                    }
                }
                SlotWrite::Clear { slot_name } => {
                    if previous.is_some() {
                        sqlx::query(
                            "DELETE FROM attache_slots
                             WHERE owner_type = $1 AND owner_id = $2 AND slot_name = $3",
                        )
                        .bind(owner_type)
                        .bind(owner_id)
                        .bind(slot_name)
                        .execute(&mut **tx)
                        .await
                        .map_err(Error::Database)?;
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

        Ok(transitions)
    }

    /// Delete the blob row if no slot references it any more.
    async fn unregister_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        blob_id: Uuid,
    ) -> Result<Option<Blob>> {
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM attache_blobs WHERE id = $1 FOR UPDATE")
                .bind(blob_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;
        if locked.is_none() {
            return Ok(None);
        }

        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM attache_slots WHERE blob_id = $1")
                .bind(blob_id)
                .fetch_one(&mut **tx)
                .await
                .map_err(Error::Database)?;
        if references > 0 {
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "DELETE FROM attache_blobs WHERE id = $1 RETURNING {}",
            BLOB_COLUMNS
        ))
        .bind(blob_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(PgBlobRepository::parse_blob_row))
    }
}

#[async_trait]
impl SlotRepository for PgSlotRepository {
    async fn get(&self, key: &SlotKey) -> Result<Option<AttachmentSlot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM attache_slots
             WHERE owner_type = $1 AND owner_id = $2 AND slot_name = $3",
            SLOT_COLUMNS
        ))
        .bind(&key.owner_type)
        .bind(key.owner_id)
        .bind(&key.slot_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(Self::parse_slot_row))
    }

    async fn list_for_owner(
        &self,
        owner_type: &str,
        owner_id: Uuid,
    ) -> Result<Vec<AttachmentSlot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM attache_slots
             WHERE owner_type = $1 AND owner_id = $2
             ORDER BY slot_name",
            SLOT_COLUMNS
        ))
        .bind(owner_type)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(Self::parse_slot_row).collect())
    }

    async fn apply(
        &self,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
    ) -> Result<Vec<SlotTransition>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let transitions = Self::apply_in_tx(&mut tx, owner_type, owner_id, writes).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "slots",
            op = "apply",
            owner_type,
            %owner_id,
            writes = writes.len(),
            "Applied slot writes"
        );
        Ok(transitions)
    }

    async fn apply_and_unregister(
        &self,
        owner_type: &str,
        owner_id: Uuid,
        writes: &[SlotWrite],
        unregister_slots: &[String],
    ) -> Result<SlotCommit> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let transitions = Self::apply_in_tx(&mut tx, owner_type, owner_id, writes).await?;

        let mut unregistered: Vec<Blob> = Vec::new();
        for transition in &transitions {
            if !unregister_slots.contains(&transition.slot_name) {
                continue;
            }
            let Some(released) = transition.released() else {
                continue;
            };
            if unregistered.iter().any(|b| b.id == released) {
                continue;
            }
            if let Some(blob) = Self::unregister_in_tx(&mut tx, released).await? {
                unregistered.push(blob);
            }
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "slots",
            op = "apply_and_unregister",
            owner_type,
            %owner_id,
            writes = writes.len(),
            unregistered = unregistered.len(),
            "Applied slot writes"
        );
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
        let rows = sqlx::query(&format!(
            "DELETE FROM attache_slots
             WHERE owner_type = $1 AND owner_id = $2
             RETURNING {}",
            SLOT_COLUMNS
        ))
        .bind(owner_type)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut removed: Vec<AttachmentSlot> =
            rows.into_iter().map(Self::parse_slot_row).collect();
        removed.sort_by(|a, b| a.slot_name.cmp(&b.slot_name));
        Ok(removed)
    }

    async fn reference_count(&self, blob_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attache_slots WHERE blob_id = $1")
            .bind(blob_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }
}
