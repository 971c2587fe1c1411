//! Error types for inbox-triage.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail transport errors (IMAP fetch, SMTP dispatch).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Fetch from {name} failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send reply on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Failures of a pipeline stage for one record.
///
/// Every variant fails the record closed: it ends up FAILED, never
/// COMPLETED with partial analysis.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Redaction unavailable: {0}")]
    RedactionUnavailable(String),

    #[error("Analysis engine unavailable: {0}")]
    AnalysisUnavailable(String),

    #[error("Analysis engine timed out after {0:?}")]
    AnalysisTimeout(Duration),

    #[error("Malformed analysis: {0}")]
    MalformedAnalysis(String),
}

/// Policy configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse policy: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid policy: {0}")]
    Invalid(String),
}

/// Rejected human reply actions. The record is left unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Work item {0} not found")]
    NotFound(Uuid),

    #[error("Work item {id} is {status}, reply actions need a COMPLETED item")]
    NotCompleted { id: Uuid, status: String },

    #[error("Reply for work item {id} is already {reply_status}")]
    AlreadyReviewed { id: Uuid, reply_status: String },

    #[error("Work item {0} has no safe reply draft (NO_REPLY), it can only be rejected")]
    NoDraft(Uuid),

    #[error("Edited reply for work item {0} is empty")]
    EmptyEdit(Uuid),

    #[error("Reply dispatch failed for work item {id}: {reason}")]
    DispatchFailed { id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
