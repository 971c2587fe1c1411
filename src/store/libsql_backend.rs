//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every state transition is a
//! single guarded `UPDATE`, so the `status` column itself is the only lock a
//! worker holds while it waits on slow collaborators.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{Analysis, Priority};
use crate::store::migrations;
use crate::store::traits::{
    Claim, Database, InsertOutcome, ListQuery, NewWorkItem, QueueStats, ReplyStatus, WorkItem,
    WorkOutcome, WorkStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        set_busy_timeout(&conn).await?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_items(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<WorkItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut items = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// How long a write waits for another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Make lock contention from other processes on the same file wait instead
/// of failing with "database is locked".
async fn set_busy_timeout(conn: &Connection) -> Result<(), DatabaseError> {
    let pragma = format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT.as_millis());
    let mut rows = conn
        .query(&pragma, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
    rows.next()
        .await
        .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
    Ok(())
}

/// Error stored on a record recovery gave up on.
const ABANDONED_ERROR: &str = "abandoned by worker; retry budget spent";

/// Canonical write format: fixed-width UTC, so text order is time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn corrupt(column: &str, e: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Serialization(format!("work_items.{column}: {e}"))
}

const ITEM_COLUMNS: &str = "id, external_id, sender, subject, body, received_at, ingested_at, \
     status, redacted_body, redacted_entities, analysis, priority, priority_reason, \
     generated_reply, reply_audit_reason, policy_version, reply_status, final_reply, \
     send_error, error, retry_count, retry_at, claim_token, updated_at, processed_at";

/// Map a libsql Row to a WorkItem. Column order matches `ITEM_COLUMNS`.
fn row_to_item(row: &libsql::Row) -> Result<WorkItem, DatabaseError> {
    let text = |idx: i32, column: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx).map_err(|e| corrupt(column, e))
    };

    let id = text(0, "id")?;
    let status = text(7, "status")?;
    let analysis: Option<String> = row.get(10).ok();
    let priority: Option<String> = row.get(11).ok();
    let reply_status = text(16, "reply_status")?;
    let retry_at: Option<String> = row.get(21).ok();
    let processed_at: Option<String> = row.get(24).ok();

    Ok(WorkItem {
        id: Uuid::parse_str(&id).map_err(|e| corrupt("id", e))?,
        external_id: text(1, "external_id")?,
        sender: text(2, "sender")?,
        subject: text(3, "subject")?,
        body: text(4, "body")?,
        received_at: parse_datetime(&text(5, "received_at")?),
        ingested_at: parse_datetime(&text(6, "ingested_at")?),
        status: status.parse::<WorkStatus>().map_err(|e| corrupt("status", e))?,
        redacted_body: row.get(8).ok(),
        redacted_entities: row.get::<i64>(9).ok().map(|n| n as u32),
        analysis: analysis
            .map(|raw| serde_json::from_str::<Analysis>(&raw))
            .transpose()
            .map_err(|e| corrupt("analysis", e))?,
        priority: priority
            .map(|p| p.parse::<Priority>())
            .transpose()
            .map_err(|e| corrupt("priority", e))?,
        priority_reason: row.get(12).ok(),
        generated_reply: row.get(13).ok(),
        reply_audit_reason: row.get(14).ok(),
        policy_version: row.get(15).ok(),
        reply_status: reply_status
            .parse::<ReplyStatus>()
            .map_err(|e| corrupt("reply_status", e))?,
        final_reply: row.get(17).ok(),
        send_error: row.get(18).ok(),
        error: row.get(19).ok(),
        retry_count: row.get::<i64>(20).unwrap_or(0) as u32,
        retry_at: parse_optional_datetime(&retry_at),
        updated_at: parse_datetime(&text(23, "updated_at")?),
        processed_at: parse_optional_datetime(&processed_at),
    })
}

fn count(row: &libsql::Row, idx: i32) -> u64 {
    row.get::<i64>(idx).unwrap_or(0).max(0) as u64
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Ingestion ───────────────────────────────────────────────────

    async fn insert_item(&self, item: &NewWorkItem) -> Result<InsertOutcome, DatabaseError> {
        let id = Uuid::new_v4();
        let now = ts(Utc::now());
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO work_items (id, external_id, sender, subject, body, received_at,
                    ingested_at, status, reply_status, retry_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', 'PENDING_REVIEW', 0, ?7)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    id.to_string(),
                    item.external_id.as_str(),
                    item.sender.as_str(),
                    item.subject.as_str(),
                    item.body.as_str(),
                    ts(item.received_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_item: {e}")))?;

        if inserted == 0 {
            debug!(external_id = %item.external_id, "Duplicate external id, skipped");
            return Ok(InsertOutcome::Duplicate);
        }
        debug!(id = %id, external_id = %item.external_id, "Work item inserted");
        Ok(InsertOutcome::Inserted(id))
    }

    async fn insert_items(
        &self,
        items: &[NewWorkItem],
    ) -> Result<Vec<InsertOutcome>, DatabaseError> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push(self.insert_item(item).await?);
        }
        Ok(outcomes)
    }

    // ── Processing state machine ────────────────────────────────────

    async fn claim_next_pending(&self) -> Result<Option<Claim>, DatabaseError> {
        let token = Uuid::new_v4();
        let now = ts(Utc::now());

        // One statement: the subquery picks the oldest PENDING row and the
        // outer guard re-checks the status, so no two callers get the same id.
        let claimed = self
            .query_items(
                "claim_next_pending",
                &format!(
                    "UPDATE work_items
                     SET status = 'PROCESSING', claim_token = ?1, updated_at = ?2
                     WHERE id = (
                         SELECT id FROM work_items
                         WHERE status = 'PENDING'
                         ORDER BY received_at ASC, ingested_at ASC
                         LIMIT 1
                     ) AND status = 'PENDING'
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![token.to_string(), now],
            )
            .await?;

        Ok(claimed.into_iter().next().map(|item| {
            debug!(id = %item.id, retry_count = item.retry_count, "Work item claimed");
            Claim { item, token }
        }))
    }

    async fn update_result(
        &self,
        id: Uuid,
        claim_token: Uuid,
        outcome: &WorkOutcome,
    ) -> Result<bool, DatabaseError> {
        let now = ts(Utc::now());
        let updated = match outcome {
            WorkOutcome::Completed(result) => {
                let analysis = serde_json::to_string(&result.analysis)
                    .map_err(|e| DatabaseError::Serialization(format!("analysis: {e}")))?;
                self.conn()
                    .execute(
                        "UPDATE work_items
                         SET status = 'COMPLETED', redacted_body = ?3, redacted_entities = ?4,
                             analysis = ?5, priority = ?6, priority_reason = ?7,
                             generated_reply = ?8, reply_audit_reason = ?9, policy_version = ?10,
                             error = NULL, retry_at = NULL,
                             processed_at = COALESCE(processed_at, ?11), updated_at = ?11
                         WHERE id = ?1 AND claim_token = ?2
                           AND status IN ('PROCESSING', 'COMPLETED')",
                        params![
                            id.to_string(),
                            claim_token.to_string(),
                            result.redacted_body.as_str(),
                            result.redacted_entities as i64,
                            analysis,
                            result.priority.as_str(),
                            result.priority_reason.as_str(),
                            result.generated_reply.as_str(),
                            result.reply_audit_reason.as_str(),
                            result.policy_version.as_str(),
                            now,
                        ],
                    )
                    .await
            }
            WorkOutcome::Failed { error, retry_at } => {
                self.conn()
                    .execute(
                        "UPDATE work_items
                         SET status = 'FAILED', error = ?3, retry_at = ?4,
                             processed_at = ?5, updated_at = ?5
                         WHERE id = ?1 AND claim_token = ?2
                           AND status IN ('PROCESSING', 'FAILED')",
                        params![
                            id.to_string(),
                            claim_token.to_string(),
                            error.as_str(),
                            opt_text(retry_at.map(ts).as_deref()),
                            now,
                        ],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("update_result: {e}")))?;

        if updated == 0 {
            warn!(id = %id, status = %outcome.status(), "Result discarded, claim no longer held");
            return Ok(false);
        }
        debug!(id = %id, status = %outcome.status(), "Work item result stored");
        Ok(true)
    }

    async fn release_stuck(
        &self,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        // An out-of-range timeout means nothing can be old enough.
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(0);
        };

        let abandoned = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'FAILED', claim_token = NULL, retry_at = NULL,
                     error = ?3, processed_at = ?1, updated_at = ?1
                 WHERE status = 'PROCESSING' AND updated_at < ?2 AND retry_count >= ?4",
                params![ts(now), ts(cutoff), ABANDONED_ERROR, max_retries as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_stuck: {e}")))?;

        let released = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'PENDING', claim_token = NULL,
                     retry_count = retry_count + 1, updated_at = ?1
                 WHERE status = 'PROCESSING' AND updated_at < ?2",
                params![ts(now), ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_stuck: {e}")))?;

        if abandoned > 0 {
            warn!(count = abandoned, "Stuck work items out of retries, left FAILED");
        }
        if released > 0 {
            info!(count = released, "Released stuck work items back to PENDING");
        }
        Ok((abandoned + released) as usize)
    }

    async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let requeued = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET status = 'PENDING', claim_token = NULL, retry_at = NULL,
                     retry_count = retry_count + 1, updated_at = ?1
                 WHERE status = 'FAILED' AND retry_at IS NOT NULL AND retry_at <= ?1",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_failed: {e}")))?;

        if requeued > 0 {
            info!(count = requeued, "Requeued failed work items for retry");
        }
        Ok(requeued as usize)
    }

    // ── Queries ─────────────────────────────────────────────────────

    async fn get_item(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError> {
        let items = self
            .query_items(
                "get_item",
                &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(items.into_iter().next())
    }

    async fn list_items(&self, query: &ListQuery) -> Result<Vec<WorkItem>, DatabaseError> {
        self.query_items(
            "list_items",
            &format!(
                "SELECT {ITEM_COLUMNS} FROM work_items
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR priority = ?2)
                 ORDER BY ingested_at DESC, received_at DESC
                 LIMIT ?3 OFFSET ?4"
            ),
            params![
                opt_text(query.status.map(|s| s.as_str())),
                opt_text(query.priority.map(|p| p.as_str())),
                query.limit as i64,
                query.offset as i64,
            ],
        )
        .await
    }

    async fn all_items(&self) -> Result<Vec<WorkItem>, DatabaseError> {
        self.query_items(
            "all_items",
            &format!("SELECT {ITEM_COLUMNS} FROM work_items ORDER BY received_at ASC"),
            (),
        )
        .await
    }

    async fn stats(&self) -> Result<QueueStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    COUNT(*),
                    SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'PROCESSING' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'COMPLETED' AND generated_reply = 'NO_REPLY' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'COMPLETED' AND reply_status = 'PENDING_REVIEW'
                             AND generated_reply != 'NO_REPLY' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN reply_status = 'SENT' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN reply_status = 'REJECTED' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN priority = 'HIGH' THEN 1 ELSE 0 END),
                    AVG(CASE WHEN status = 'COMPLETED'
                        THEN (julianday(processed_at) - julianday(ingested_at)) * 86400.0 END)
                 FROM work_items",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?
        else {
            return Ok(QueueStats::default());
        };

        Ok(QueueStats {
            total: count(&row, 0),
            pending: count(&row, 1),
            processing: count(&row, 2),
            completed: count(&row, 3),
            failed: count(&row, 4),
            no_reply: count(&row, 5),
            awaiting_review: count(&row, 6),
            sent: count(&row, 7),
            rejected: count(&row, 8),
            high_priority: count(&row, 9),
            avg_processing_secs: row.get::<f64>(10).ok(),
        })
    }

    // ── Reply review ────────────────────────────────────────────────

    async fn set_reply_status(
        &self,
        id: Uuid,
        to: ReplyStatus,
        final_reply: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE work_items
                 SET reply_status = ?2, final_reply = ?3, send_error = NULL, updated_at = ?4
                 WHERE id = ?1 AND status = 'COMPLETED' AND reply_status = 'PENDING_REVIEW'
                   AND (?2 != 'SENT' OR generated_reply != 'NO_REPLY')",
                params![id.to_string(), to.as_str(), opt_text(final_reply), ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_reply_status: {e}")))?;

        if updated > 0 {
            info!(id = %id, reply_status = %to, "Reply status updated");
        }
        Ok(updated > 0)
    }

    async fn revert_reply_dispatch(
        &self,
        id: Uuid,
        send_error: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE work_items
                 SET reply_status = 'PENDING_REVIEW', final_reply = NULL,
                     send_error = ?2, updated_at = ?3
                 WHERE id = ?1 AND reply_status = 'SENT'",
                params![id.to_string(), send_error, ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("revert_reply_dispatch: {e}")))?;
        warn!(id = %id, error = send_error, "Reply dispatch failed, returned to review");
        Ok(())
    }
}
