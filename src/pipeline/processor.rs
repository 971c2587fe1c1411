//! Record processor: drives one claimed work item to a terminal status.
//!
//! **Core invariant: fail closed.** A record only reaches COMPLETED with a
//! full analysis, a priority and a gate decision. Any collaborator failure
//! (redaction, analysis, timeout, malformed output) ends the attempt as
//! FAILED with the error captured and, budget permitting, a retry time.
//!
//! Flow (strictly sequential per record):
//! 1. Redact the raw body
//! 2. Analyze the redacted text
//! 3. Classify priority (pure)
//! 4. Reply safety gate (pure)
//! 5. Persist, guarded by the claim token
//!
//! No store lock is held while collaborators run; the PROCESSING status is
//! the only hold.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::collaborators::{Analyzer, Redactor};
use crate::pipeline::gate::{GateInput, ReplyGate};
use crate::pipeline::policy::TriagePolicy;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::rules::{PriorityClassifier, PriorityInput};
use crate::pipeline::types::{Analysis, Priority, Redaction};
use crate::store::{Claim, CompletedResult, Database, WorkOutcome, WorkStatus};

/// Default upper bound on one analysis call.
const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(60);

/// Summary of one processing attempt, for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedRecord {
    pub id: Uuid,
    pub status: WorkStatus,
    /// `false` when the claim was lost before the result could be stored.
    pub stored: bool,
    pub priority: Option<Priority>,
    pub no_reply: bool,
    pub error: Option<String>,
}

/// Processes claimed work items.
pub struct RecordProcessor {
    db: Arc<dyn Database>,
    redactor: Arc<dyn Redactor>,
    analyzer: Arc<dyn Analyzer>,
    policy: Arc<TriagePolicy>,
    classifier: PriorityClassifier,
    gate: ReplyGate,
    retry: RetryPolicy,
    analysis_timeout: Duration,
}

impl RecordProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        redactor: Arc<dyn Redactor>,
        analyzer: Arc<dyn Analyzer>,
        policy: Arc<TriagePolicy>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            redactor,
            analyzer,
            classifier: PriorityClassifier::new(Arc::clone(&policy)),
            gate: ReplyGate::new(Arc::clone(&policy)),
            policy,
            retry,
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
        }
    }

    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout = timeout;
        self
    }

    /// Claim the next PENDING record and process it.
    ///
    /// Returns `Ok(None)` when the queue is empty. Stage failures become a
    /// FAILED record, not an `Err`; only store errors propagate.
    pub async fn process_next(&self) -> Result<Option<ProcessedRecord>, DatabaseError> {
        match self.db.claim_next_pending().await? {
            Some(claim) => self.process_claim(claim).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run all stages for a claimed record and store the outcome.
    pub async fn process_claim(&self, claim: Claim) -> Result<ProcessedRecord, DatabaseError> {
        let item = &claim.item;
        info!(
            id = %item.id,
            sender = %item.sender,
            retry_count = item.retry_count,
            "Processing work item"
        );

        let outcome = match self.run_stages(&item.body).await {
            Ok(result) => WorkOutcome::Completed(result),
            Err(e) => {
                let retry_at = self.retry.schedule(item.retry_count, Utc::now());
                warn!(
                    id = %item.id,
                    error = %e,
                    retry_count = item.retry_count,
                    retry_at = ?retry_at,
                    "Work item failed"
                );
                if retry_at.is_none() {
                    warn!(id = %item.id, "Retry budget spent, left FAILED for manual review");
                }
                WorkOutcome::Failed {
                    error: e.to_string(),
                    retry_at,
                }
            }
        };

        let stored = self.db.update_result(item.id, claim.token, &outcome).await?;

        let record = match &outcome {
            WorkOutcome::Completed(result) => ProcessedRecord {
                id: item.id,
                status: WorkStatus::Completed,
                stored,
                priority: Some(result.priority),
                no_reply: result.generated_reply == crate::pipeline::gate::NO_REPLY,
                error: None,
            },
            WorkOutcome::Failed { error, .. } => ProcessedRecord {
                id: item.id,
                status: WorkStatus::Failed,
                stored,
                priority: None,
                no_reply: false,
                error: Some(error.clone()),
            },
        };

        if stored {
            info!(
                id = %record.id,
                status = %record.status,
                priority = ?record.priority,
                no_reply = record.no_reply,
                "Work item finished"
            );
        }
        Ok(record)
    }

    /// Redact → analyze → classify → gate. Pure apart from the two collaborators.
    async fn run_stages(&self, body: &str) -> Result<CompletedResult, PipelineError> {
        let redaction = self.redactor.redact(body).await?;
        debug!(entities = redaction.entity_count, "Body redacted");

        let analysis = tokio::time::timeout(
            self.analysis_timeout,
            self.analyzer.analyze(&redaction.text),
        )
        .await
        .map_err(|_| PipelineError::AnalysisTimeout(self.analysis_timeout))??;

        Ok(self.decide(body, redaction, analysis))
    }

    /// Priority and reply decision for an analyzed record.
    ///
    /// Priority markers are looked up in the raw `body`, so a risk word
    /// inside a redacted span (an address like `claims@…`) still counts.
    /// The reply gate only ever sees the redacted text.
    pub fn decide(&self, body: &str, redaction: Redaction, analysis: Analysis) -> CompletedResult {
        let priority = self.classifier.classify(&PriorityInput {
            intent: &analysis.intent,
            sentiment: analysis.sentiment,
            summary: &analysis.summary,
            body,
        });

        let decision = self.gate.decide(&GateInput {
            intent: &analysis.intent,
            priority: priority.priority,
            confidence: analysis.confidence,
            sentiment: analysis.sentiment,
            redacted_body: &redaction.text,
        });

        CompletedResult {
            generated_reply: decision.reply_text().to_string(),
            reply_audit_reason: decision.audit_reason().to_string(),
            policy_version: self.policy.version.clone(),
            priority: priority.priority,
            priority_reason: priority.reason,
            redacted_entities: redaction.entity_count,
            redacted_body: redaction.text,
            analysis,
        }
    }
}
