//! `Database` trait: single async interface for work-item persistence.
//!
//! Every method that moves a record between states is a single guarded
//! statement, so concurrent workers, the recovery loop and human reply
//! actions coordinate through the store alone.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::{Analysis, Priority};

/// Processing status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl FromStr for WorkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human review state of the drafted reply. Only reply actions change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    PendingReview,
    Sent,
    Rejected,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "PENDING_REVIEW",
            Self::Sent => "SENT",
            Self::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ReplyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_REVIEW" => Ok(Self::PendingReview),
            "SENT" => Ok(Self::Sent),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown reply status '{other}'")),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable input of a new work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// One inbound message and everything the pipeline learned about it.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub status: WorkStatus,
    pub redacted_body: Option<String>,
    pub redacted_entities: Option<u32>,
    pub analysis: Option<Analysis>,
    pub priority: Option<Priority>,
    pub priority_reason: Option<String>,
    pub generated_reply: Option<String>,
    pub reply_audit_reason: Option<String>,
    pub policy_version: Option<String>,
    pub reply_status: ReplyStatus,
    /// Reply text actually sent, when the reviewer edited the draft.
    pub final_reply: Option<String>,
    pub send_error: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A record held in PROCESSING by one worker.
///
/// The token identifies this particular claim. Results are only accepted
/// while the row still carries it, so a worker whose claim was released as
/// stuck cannot overwrite the row after another worker reclaimed it.
#[derive(Debug, Clone)]
pub struct Claim {
    pub item: WorkItem,
    pub token: Uuid,
}

/// Fields written when a record completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedResult {
    pub redacted_body: String,
    pub redacted_entities: u32,
    pub analysis: Analysis,
    pub priority: Priority,
    pub priority_reason: String,
    pub generated_reply: String,
    pub reply_audit_reason: String,
    pub policy_version: String,
}

/// Terminal outcome of one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Completed(CompletedResult),
    /// `retry_at` is `None` when the retry budget is spent.
    Failed {
        error: String,
        retry_at: Option<DateTime<Utc>>,
    },
}

impl WorkOutcome {
    pub fn status(&self) -> WorkStatus {
        match self {
            Self::Completed(_) => WorkStatus::Completed,
            Self::Failed { .. } => WorkStatus::Failed,
        }
    }
}

/// Result of an insert that deduplicates by external id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    Duplicate,
}

/// Filters and pagination for listing.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub status: Option<WorkStatus>,
    pub priority: Option<Priority>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            priority: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub no_reply: u64,
    pub awaiting_review: u64,
    pub sent: u64,
    pub rejected: u64,
    pub high_priority: u64,
    /// Mean seconds from ingestion to completion over COMPLETED records.
    pub avg_processing_secs: Option<f64>,
}

/// Backend-agnostic work-item store.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Ingestion ───────────────────────────────────────────────────

    /// Insert a PENDING record unless one with the same external id exists.
    async fn insert_item(&self, item: &NewWorkItem) -> Result<InsertOutcome, DatabaseError>;

    /// Insert a batch. Duplicates are skipped, not errors.
    async fn insert_items(&self, items: &[NewWorkItem])
    -> Result<Vec<InsertOutcome>, DatabaseError>;

    // ── Processing state machine ────────────────────────────────────

    /// Atomically move the oldest-received PENDING record to PROCESSING.
    ///
    /// Two concurrent callers never receive the same record. Returns `None`
    /// without blocking when nothing is pending.
    async fn claim_next_pending(&self) -> Result<Option<Claim>, DatabaseError>;

    /// Write the outcome of a claim and move the record to COMPLETED or FAILED.
    ///
    /// Returns `false` when the claim is no longer held (released as stuck and
    /// possibly reclaimed). Re-applying the same outcome for the same claim is
    /// a no-op that still returns `true`.
    async fn update_result(
        &self,
        id: Uuid,
        claim_token: Uuid,
        outcome: &WorkOutcome,
    ) -> Result<bool, DatabaseError>;

    /// Take records stuck in PROCESSING for longer than `timeout` away from
    /// their (presumed dead) worker.
    ///
    /// Records with retries left go back to PENDING with their retry count
    /// incremented; records that already used `max_retries` retries end
    /// FAILED with no `retry_at`. Returns how many left PROCESSING.
    async fn release_stuck(&self, timeout: Duration, max_retries: u32)
    -> Result<usize, DatabaseError>;

    /// Move FAILED records whose `retry_at` has passed back to PENDING,
    /// incrementing their retry count. Returns how many moved.
    async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Queries ─────────────────────────────────────────────────────

    async fn get_item(&self, id: Uuid) -> Result<Option<WorkItem>, DatabaseError>;

    /// Records matching the filters, newest ingested first.
    async fn list_items(&self, query: &ListQuery) -> Result<Vec<WorkItem>, DatabaseError>;

    /// Every record, oldest received first.
    async fn all_items(&self) -> Result<Vec<WorkItem>, DatabaseError>;

    async fn stats(&self) -> Result<QueueStats, DatabaseError>;

    // ── Reply review ────────────────────────────────────────────────

    /// Guarded transition of a COMPLETED record's reply from PENDING_REVIEW.
    ///
    /// Returns `false` and changes nothing unless the record is COMPLETED and
    /// its reply is still PENDING_REVIEW.
    async fn set_reply_status(
        &self,
        id: Uuid,
        to: ReplyStatus,
        final_reply: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Put a SENT reply back to PENDING_REVIEW after a failed dispatch.
    async fn revert_reply_dispatch(&self, id: Uuid, send_error: &str)
    -> Result<(), DatabaseError>;
}
