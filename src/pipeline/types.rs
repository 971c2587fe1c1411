//! Shared types for the triage pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

// ── Intent ──────────────────────────────────────────────────────────

/// Classified intent of an inbound message.
///
/// The analysis engine is free-form, so anything it returns that is not one
/// of the known intents is kept verbatim (normalized) in `Other`. Unknown
/// intents are never answered and default to MEDIUM priority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Intent {
    GeneralEnquiry,
    Request,
    DocumentSubmission,
    Appreciation,
    Complaint,
    ClaimRelated,
    PaymentIssue,
    Surrender,
    PolicyStatus,
    Other(String),
}

impl Intent {
    pub fn as_str(&self) -> &str {
        match self {
            Self::GeneralEnquiry => "GENERAL_ENQUIRY",
            Self::Request => "REQUEST",
            Self::DocumentSubmission => "DOCUMENT_SUBMISSION",
            Self::Appreciation => "APPRECIATION",
            Self::Complaint => "COMPLAINT",
            Self::ClaimRelated => "CLAIM_RELATED",
            Self::PaymentIssue => "PAYMENT_ISSUE",
            Self::Surrender => "SURRENDER",
            Self::PolicyStatus => "POLICY_STATUS",
            Self::Other(s) => s,
        }
    }

    /// Normalize a free-form label: "Claim Related" / "claim-related" → `CLAIM_RELATED`.
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "GENERAL_ENQUIRY" | "GENERAL_INQUIRY" | "ENQUIRY" | "INQUIRY" => Self::GeneralEnquiry,
            "REQUEST" => Self::Request,
            "DOCUMENT_SUBMISSION" => Self::DocumentSubmission,
            "APPRECIATION" | "FEEDBACK" => Self::Appreciation,
            "COMPLAINT" => Self::Complaint,
            "CLAIM_RELATED" | "CLAIM" | "CLAIM_ENQUIRY" => Self::ClaimRelated,
            "PAYMENT_ISSUE" | "PAYMENT" => Self::PaymentIssue,
            "SURRENDER" => Self::Surrender,
            "POLICY_STATUS" => Self::PolicyStatus,
            _ => Self::Other(normalized),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Intent {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<Intent> for String {
    fn from(i: Intent) -> Self {
        i.as_str().to_string()
    }
}

// ── Sentiment / confidence / priority ───────────────────────────────

/// Sentiment reported by the analysis engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "POSITIVE",
            Self::Neutral => "NEUTRAL",
            Self::Negative => "NEGATIVE",
        }
    }
}

impl FromStr for Sentiment {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Ok(Self::Positive),
            "NEUTRAL" => Ok(Self::Neutral),
            "NEGATIVE" => Ok(Self::Negative),
            other => Err(PipelineError::MalformedAnalysis(format!(
                "unknown sentiment '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported confidence of the analysis. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        }
    }
}

impl FromStr for Confidence {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(PipelineError::MalformedAnalysis(format!(
                "unknown confidence '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Analysis ────────────────────────────────────────────────────────

/// Structured output of the analysis engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: Intent,
    pub sentiment: Sentiment,
    pub summary: String,
    pub confidence: Confidence,
}

/// Output of the redaction collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redaction {
    pub text: String,
    pub entity_count: u32,
}

// ── Mail ────────────────────────────────────────────────────────────

/// One message returned by the mail fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedMail {
    /// Stable id from the source system, used for deduplication.
    pub external_id: String,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}
