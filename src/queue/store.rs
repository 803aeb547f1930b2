//! Operation queue persistence
//!
//! SQLite storage for pending mutation intents. Every write that must keep the
//! one-operation-per-resource invariant runs inside a single transaction.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use super::types::{
    Operation, OperationKind, OperationPayload, OperationStatus, QueueCounts, ResourceKey,
    ResourceKind,
};
use crate::clock::{Clock, SystemClock};
use crate::db::{decode_time, encode_time};
use crate::error::{Result, SyncError};

const OPERATION_COLUMNS: &str = "id, seq, created_at, kind, resource_kind, resource_id, \
     parent_id, payload, base_version, retry_count, status, last_error, next_attempt_at";

const OUTSTANDING: &str = "('pending', 'in_flight', 'failed')";

/// Repository for queued operations
pub struct QueueRepository<'a> {
    pool: &'a SqlitePool,
    clock: &'a dyn Clock,
}

impl<'a> QueueRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self {
            pool,
            clock: &SystemClock,
        }
    }

    pub fn with_clock(pool: &'a SqlitePool, clock: &'a dyn Clock) -> Self {
        Self { pool, clock }
    }

    /// Queue a mutation, collapsing it with outstanding work for the same resource.
    ///
    /// - a delete removes every outstanding operation for the resource
    /// - an update replaces an outstanding update, keeping the first base version
    ///   and overlaying the payloads; it folds into a create that has not been
    ///   sent yet
    /// - a create or reorder replaces a previous one of the same kind
    ///
    /// The returned operation is committed before this returns.
    pub async fn add_operation(
        &self,
        payload: OperationPayload,
        resource_id: &str,
        base_version: u64,
        parent_id: Option<&str>,
    ) -> Result<Operation> {
        let now = self.clock.now();
        let key = ResourceKey {
            resource_kind: payload.resource_kind(),
            resource_id: resource_id.to_string(),
            parent_id: parent_id.map(str::to_string),
        };

        let mut tx = self.pool.begin().await?;
        let existing = outstanding_for_key(&mut tx, &key).await?;

        let mut operation = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            kind: payload.kind(),
            resource_kind: key.resource_kind,
            resource_id: key.resource_id.clone(),
            parent_id: key.parent_id.clone(),
            payload,
            base_version,
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        };

        match operation.kind {
            OperationKind::Delete => {
                let removed = delete_outstanding_for_key(&mut tx, &key).await?;
                if removed > 0 {
                    tracing::debug!(
                        "Delete of {} superseded {} queued operation(s)",
                        key.resource_id,
                        removed
                    );
                }
            }
            OperationKind::Update => {
                if existing.iter().any(|op| op.kind == OperationKind::Delete) {
                    return Err(SyncError::ResourceDeleted(key.resource_id));
                }

                if let Some(create) = existing.iter().find(|op| {
                    op.kind == OperationKind::Create && op.status != OperationStatus::InFlight
                }) {
                    let mut create = create.clone();
                    if create.payload.absorb(&operation.payload) {
                        write_payload(&mut tx, &create.id, &create.payload).await?;
                        tx.commit().await?;
                        tracing::debug!("Folded update into queued create {}", create.id);
                        return Ok(create);
                    }
                }

                if let Some(previous) = existing.iter().find(|op| op.kind == OperationKind::Update) {
                    let mut merged = previous.payload.clone();
                    if merged.absorb(&operation.payload) {
                        operation.payload = merged;
                    }
                    operation.base_version = previous.base_version;
                    delete_by_id(&mut tx, &previous.id).await?;
                    tracing::debug!(
                        "Update {} replaces {} (base version {})",
                        operation.id,
                        previous.id,
                        operation.base_version
                    );
                }
            }
            OperationKind::Create => {
                for previous in existing.iter().filter(|op| {
                    op.kind == OperationKind::Create && op.status != OperationStatus::InFlight
                }) {
                    tracing::warn!("Replacing duplicate create {} for {}", previous.id, key.resource_id);
                    delete_by_id(&mut tx, &previous.id).await?;
                }
            }
            OperationKind::Reorder => {
                for previous in existing.iter().filter(|op| op.kind == OperationKind::Reorder) {
                    delete_by_id(&mut tx, &previous.id).await?;
                }
            }
        }

        insert_operation(&mut tx, &operation).await?;
        tx.commit().await?;

        Ok(operation)
    }

    /// Pending operations in FIFO order
    pub async fn get_pending(&self) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {} FROM operations WHERE status = 'pending' ORDER BY created_at ASC, seq ASC",
            OPERATION_COLUMNS
        ))
        .fetch_all(self.pool)
        .await?;

        self.decode_rows(rows).await
    }

    /// Pending operations whose backoff has elapsed, in FIFO order
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            r#"
            SELECT {} FROM operations
            WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY created_at ASC, seq ASC
            "#,
            OPERATION_COLUMNS
        ))
        .bind(encode_time(&now))
        .fetch_all(self.pool)
        .await?;

        self.decode_rows(rows).await
    }

    /// Number of pending operations whose backoff has elapsed
    pub async fn count_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM operations
            WHERE status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            "#,
        )
        .bind(encode_time(&now))
        .fetch_one(self.pool)
        .await?;

        Ok(count.0 as usize)
    }

    /// Get an operation by id
    pub async fn get(&self, id: &str) -> Result<Option<Operation>> {
        let row = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {} FROM operations WHERE id = ?",
            OPERATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        row.map(|r| r.into_operation()).transpose()
    }

    /// Outstanding (pending, in-flight or failed) operations for a resource
    pub async fn ops_for_key(&self, key: &ResourceKey) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        outstanding_for_key(&mut conn, key).await
    }

    /// Outstanding operations touching a resource id, whatever the parent
    pub async fn ops_for_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {} FROM operations WHERE resource_kind = ? AND resource_id = ? AND status IN {} \
             ORDER BY created_at ASC, seq ASC",
            OPERATION_COLUMNS, OUTSTANDING
        ))
        .bind(kind.as_str())
        .bind(resource_id)
        .fetch_all(self.pool)
        .await?;

        self.decode_rows(rows).await
    }

    /// Ids of resources whose create has not reached the remote yet
    pub async fn unsynced_creates(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT resource_id FROM operations WHERE kind = 'create' AND status IN {}",
            OUTSTANDING
        ))
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Mark an operation as handed to the remote
    pub async fn mark_in_flight(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE operations SET status = 'in_flight' WHERE id = ? AND status = 'pending'",
        )
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Put an operation back to pending without touching its retry budget
    pub async fn mark_pending(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE operations SET status = 'pending' WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed attempt and schedule the next one
    pub async fn reschedule(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'pending', retry_count = ?, next_attempt_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(retry_count as i64)
        .bind(encode_time(&next_attempt_at))
        .bind(error)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Park an operation as failed; it stays in the queue for manual handling
    pub async fn mark_failed(&self, id: &str, retry_count: Option<u32>, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'failed', retry_count = COALESCE(?, retry_count), last_error = ?,
                next_attempt_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(retry_count.map(|c| c as i64))
        .bind(error)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Swap an operation's payload and base version and make it pending again
    pub async fn replace_payload(
        &self,
        id: &str,
        payload: &OperationPayload,
        base_version: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET payload = ?, kind = ?, base_version = ?, status = 'pending',
                next_attempt_at = NULL, last_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(serde_json::to_string(payload)?)
        .bind(payload.kind().as_str())
        .bind(base_version as i64)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Move an operation onto a newer base version
    pub async fn rebase(&self, id: &str, base_version: u64) -> Result<bool> {
        let result = sqlx::query("UPDATE operations SET base_version = ? WHERE id = ?")
            .bind(base_version as i64)
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an operation
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(delete_by_id(&mut conn, id).await? > 0)
    }

    /// Remove every outstanding operation for a resource
    pub async fn remove_for_key(&self, key: &ResourceKey) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        delete_outstanding_for_key(&mut conn, key).await
    }

    /// Remove queued operations of a list's children that are not on the wire
    pub async fn remove_for_parent(&self, parent_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM operations WHERE parent_id = ? AND status IN ('pending', 'failed')",
        )
        .bind(parent_id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Point queued work at the server-assigned id of a freshly created resource
    pub async fn rewrite_resource_id(&self, old_id: &str, new_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let by_resource = sqlx::query("UPDATE operations SET resource_id = ? WHERE resource_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let by_parent = sqlx::query("UPDATE operations SET parent_id = ? WHERE parent_id = ?")
            .bind(new_id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let reorders = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {} FROM operations WHERE kind = 'reorder'",
            OPERATION_COLUMNS
        ))
        .fetch_all(&mut *tx)
        .await?;

        let mut by_payload = 0;
        for row in reorders {
            let Ok(mut op) = row.into_operation() else {
                continue;
            };
            if op.payload.rewrite_id(old_id, new_id) {
                write_payload(&mut tx, &op.id, &op.payload).await?;
                by_payload += 1;
            }
        }

        tx.commit().await?;

        Ok(by_resource + by_parent + by_payload)
    }

    /// Reset operations left in flight by a previous run
    pub async fn recover_in_flight(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE operations SET status = 'pending' WHERE status = 'in_flight'")
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Operations that exhausted their retries or were parked with an error
    pub async fn list_failed(&self) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(&format!(
            "SELECT {} FROM operations WHERE status = 'failed' ORDER BY created_at ASC, seq ASC",
            OPERATION_COLUMNS
        ))
        .fetch_all(self.pool)
        .await?;

        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_operation() {
                Ok(op) => operations.push(op),
                Err(e) => tracing::warn!("Skipping unreadable failed operation: {}", e),
            }
        }
        Ok(operations)
    }

    /// Give a failed operation a fresh retry budget
    pub async fn retry_failed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE operations
            SET status = 'pending', retry_count = 0, next_attempt_at = NULL, last_error = NULL
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Queue size by status
    pub async fn counts(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM operations GROUP BY status")
                .fetch_all(self.pool)
                .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            match OperationStatus::parse(&status) {
                Some(OperationStatus::Pending) => counts.pending = count as usize,
                Some(OperationStatus::InFlight) => counts.in_flight = count as usize,
                Some(OperationStatus::Failed) => counts.failed = count as usize,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Clean up failed operations queued before `older_than`
    pub async fn purge_failed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM operations WHERE status = 'failed' AND created_at < ?")
            .bind(encode_time(&older_than))
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn decode_rows(&self, rows: Vec<OperationRow>) -> Result<Vec<Operation>> {
        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_operation() {
                Ok(op) => operations.push(op),
                Err(e) => self.quarantine(&id, &e).await?,
            }
        }
        Ok(operations)
    }

    /// Park a corrupt entry so it cannot wedge the drain
    async fn quarantine(&self, id: &str, error: &SyncError) -> Result<()> {
        tracing::error!("Skipping corrupt queue entry {}: {}", id, error);
        sqlx::query(
            "UPDATE operations SET status = 'failed', last_error = ?, next_attempt_at = NULL WHERE id = ?",
        )
        .bind(error.to_string())
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }
}

async fn outstanding_for_key(conn: &mut SqliteConnection, key: &ResourceKey) -> Result<Vec<Operation>> {
    let rows = sqlx::query_as::<_, OperationRow>(&format!(
        "SELECT {} FROM operations \
         WHERE resource_kind = ? AND resource_id = ? AND parent_id IS ? AND status IN {} \
         ORDER BY created_at ASC, seq ASC",
        OPERATION_COLUMNS, OUTSTANDING
    ))
    .bind(key.resource_kind.as_str())
    .bind(&key.resource_id)
    .bind(&key.parent_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut operations = Vec::with_capacity(rows.len());
    for row in rows {
        match row.into_operation() {
            Ok(op) => operations.push(op),
            Err(e) => tracing::error!("Ignoring corrupt queue entry: {}", e),
        }
    }
    Ok(operations)
}

async fn delete_outstanding_for_key(conn: &mut SqliteConnection, key: &ResourceKey) -> Result<u64> {
    let result = sqlx::query(&format!(
        "DELETE FROM operations \
         WHERE resource_kind = ? AND resource_id = ? AND parent_id IS ? AND status IN {}",
        OUTSTANDING
    ))
    .bind(key.resource_kind.as_str())
    .bind(&key.resource_id)
    .bind(&key.parent_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn delete_by_id(conn: &mut SqliteConnection, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM operations WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected())
}

async fn write_payload(conn: &mut SqliteConnection, id: &str, payload: &OperationPayload) -> Result<()> {
    sqlx::query("UPDATE operations SET payload = ? WHERE id = ?")
        .bind(serde_json::to_string(payload)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_operation(conn: &mut SqliteConnection, op: &Operation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO operations (
            id, seq, created_at, kind, resource_kind, resource_id, parent_id,
            payload, base_version, retry_count, status, last_error, next_attempt_at
        ) VALUES (
            ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM operations), ?, ?, ?, ?, ?,
            ?, ?, ?, ?, ?, ?
        )
        "#,
    )
    .bind(&op.id)
    .bind(encode_time(&op.created_at))
    .bind(op.kind.as_str())
    .bind(op.resource_kind.as_str())
    .bind(&op.resource_id)
    .bind(&op.parent_id)
    .bind(serde_json::to_string(&op.payload)?)
    .bind(op.base_version as i64)
    .bind(op.retry_count as i64)
    .bind(op.status.as_str())
    .bind(&op.last_error)
    .bind(op.next_attempt_at.as_ref().map(encode_time))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    #[allow(dead_code)]
    seq: i64,
    created_at: String,
    kind: String,
    resource_kind: String,
    resource_id: String,
    parent_id: Option<String>,
    payload: String,
    base_version: i64,
    retry_count: i64,
    status: String,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
}

impl OperationRow {
    fn into_operation(self) -> Result<Operation> {
        let corrupt = |reason: String| SyncError::QueueCorruption {
            id: self.id.clone(),
            reason,
        };

        let kind = OperationKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown kind '{}'", self.kind)))?;
        let resource_kind = ResourceKind::parse(&self.resource_kind)
            .ok_or_else(|| corrupt(format!("unknown resource kind '{}'", self.resource_kind)))?;
        let status = OperationStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", self.status)))?;
        let payload: OperationPayload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("undecodable payload: {}", e)))?;

        if payload.kind() != kind || payload.resource_kind() != resource_kind {
            return Err(corrupt(format!(
                "payload does not match {} {}",
                self.kind, self.resource_kind
            )));
        }

        let created_at = decode_time(&self.created_at)
            .map_err(|e| corrupt(format!("bad created_at: {}", e)))?;
        let next_attempt_at = self
            .next_attempt_at
            .as_deref()
            .map(decode_time)
            .transpose()
            .map_err(|e| corrupt(format!("bad next_attempt_at: {}", e)))?;

        Ok(Operation {
            id: self.id,
            created_at,
            kind,
            resource_kind,
            resource_id: self.resource_id,
            parent_id: self.parent_id,
            payload,
            base_version: self.base_version.max(0) as u64,
            retry_count: self.retry_count.max(0) as u32,
            status,
            last_error: self.last_error,
            next_attempt_at,
        })
    }
}
