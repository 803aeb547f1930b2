//! Local cache persistence
//!
//! SQLite mirror of lists and items the UI reads from. Writes here are
//! optimistic; the sync engine reconciles them with remote outcomes.

use sqlx::SqlitePool;

use super::types::{ResourceData, ResourceRecord};
use crate::db::{decode_time, encode_time};
use crate::error::{Result, SyncError};
use crate::queue::{ItemOrder, ResourceKind};

const RESOURCE_COLUMNS: &str =
    "id, kind, parent_id, version, data, updated_at, pending, deleted, provisional";

/// Repository for cached resources
pub struct CacheRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CacheRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a record, tombstoned or not
    pub async fn get(&self, id: &str) -> Result<Option<ResourceRecord>> {
        let row = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE id = ?",
            RESOURCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_record()).transpose()
    }

    /// Get a record unless it is tombstoned
    pub async fn get_visible(&self, id: &str) -> Result<Option<ResourceRecord>> {
        Ok(self.get(id).await?.filter(|r| !r.deleted))
    }

    /// Visible lists
    pub async fn lists(&self) -> Result<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE kind = 'list' AND deleted = 0 ORDER BY rowid ASC",
            RESOURCE_COLUMNS
        ))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    /// Visible items of a list, in display order
    pub async fn items(&self, list_id: &str) -> Result<Vec<ResourceRecord>> {
        let rows = sqlx::query_as::<_, ResourceRow>(&format!(
            "SELECT {} FROM resources WHERE kind = 'item' AND parent_id = ? AND deleted = 0 \
             ORDER BY rowid ASC",
            RESOURCE_COLUMNS
        ))
        .bind(list_id)
        .fetch_all(self.pool)
        .await?;

        let mut items = rows
            .into_iter()
            .map(|r| r.into_record())
            .collect::<Result<Vec<_>>>()?;
        items.sort_by_key(|r| r.item_fields().map(|f| f.order).unwrap_or_default());
        Ok(items)
    }

    /// Insert or replace a record
    pub async fn put(&self, record: &ResourceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resources (id, kind, parent_id, version, data, updated_at, pending, deleted, provisional)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                parent_id = excluded.parent_id,
                version = excluded.version,
                data = excluded.data,
                updated_at = excluded.updated_at,
                pending = excluded.pending,
                deleted = excluded.deleted,
                provisional = excluded.provisional
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(&record.parent_id)
        .bind(record.version as i64)
        .bind(serde_json::to_string(&record.data)?)
        .bind(encode_time(&record.updated_at))
        .bind(record.pending)
        .bind(record.deleted)
        .bind(record.provisional)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Remove a record
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove every child record of a list
    pub async fn remove_children(&self, parent_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM resources WHERE parent_id = ?")
            .bind(parent_id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Hide a record and its children until the pending delete settles
    pub async fn tombstone(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET deleted = 1, pending = 1 WHERE id = ? OR parent_id = ?",
        )
        .bind(id)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Bring a tombstoned record and its hidden children back as settled
    pub async fn untombstone(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resources SET deleted = 0, pending = 0 WHERE deleted = 1 AND (id = ? OR parent_id = ?)",
        )
        .bind(id)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_pending(&self, id: &str, pending: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE resources SET pending = ? WHERE id = ?")
            .bind(pending)
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Swap a provisional id for the server-assigned one, children included
    pub async fn rename_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE resources SET id = ?, provisional = 0 WHERE id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE resources SET parent_id = ? WHERE parent_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Write new positions onto cached items of a list
    pub async fn apply_orders(&self, list_id: &str, orders: &[ItemOrder]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut applied = 0;

        for order in orders {
            let row = sqlx::query_as::<_, ResourceRow>(&format!(
                "SELECT {} FROM resources WHERE id = ? AND parent_id = ?",
                RESOURCE_COLUMNS
            ))
            .bind(&order.id)
            .bind(list_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tracing::debug!("Reorder skips unknown item {}", order.id);
                continue;
            };

            let mut record = row.into_record()?;
            if let ResourceData::Item(fields) = &mut record.data {
                fields.order = order.order;
            }

            sqlx::query("UPDATE resources SET data = ? WHERE id = ?")
                .bind(serde_json::to_string(&record.data)?)
                .bind(&record.id)
                .execute(&mut *tx)
                .await?;
            applied += 1;
        }

        tx.commit().await?;

        Ok(applied)
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: String,
    kind: String,
    parent_id: Option<String>,
    version: i64,
    data: String,
    updated_at: String,
    pending: bool,
    deleted: bool,
    provisional: bool,
}

impl ResourceRow {
    fn into_record(self) -> Result<ResourceRecord> {
        let kind = ResourceKind::parse(&self.kind)
            .ok_or_else(|| SyncError::Internal(format!("unknown resource kind '{}'", self.kind)))?;
        let data: ResourceData = serde_json::from_str(&self.data)?;
        let updated_at = decode_time(&self.updated_at)
            .map_err(|e| SyncError::Internal(format!("bad updated_at on {}: {}", self.id, e)))?;

        Ok(ResourceRecord {
            id: self.id,
            kind,
            parent_id: self.parent_id,
            version: self.version.max(0) as u64,
            data,
            updated_at,
            pending: self.pending,
            deleted: self.deleted,
            provisional: self.provisional,
        })
    }
}
