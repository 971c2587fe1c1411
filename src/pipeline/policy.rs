//! Versioned triage policy: keyword lists, intent sets and reply templates.
//!
//! The policy is plain data. It is built once (built-in defaults or a JSON
//! file), validated, and shared read-only through `Arc<TriagePolicy>` by the
//! priority classifier and the reply safety gate. Nothing mutates it at
//! runtime, so a given policy version always yields the same decisions.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::pipeline::types::{Confidence, Intent};

/// Complete triage policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriagePolicy {
    /// Version label, persisted with every processed record.
    pub version: String,
    /// Urgency markers shared by priority rule 3 and gate layer 3.
    pub urgency_markers: Vec<String>,
    pub priority: PriorityPolicy,
    pub reply: ReplyPolicy,
}

/// Inputs of the priority rule engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityPolicy {
    /// Rule 1: any of these in the body → HIGH.
    pub risk_keywords: Vec<String>,
    /// Rule 2: these intents → HIGH.
    pub restricted_intents: Vec<Intent>,
    /// Rule 4: these intents → MEDIUM.
    pub actionable_intents: Vec<Intent>,
    /// Rule 5: these intents with non-negative sentiment → LOW.
    /// Also exempt from the negative-sentiment escalation of rule 3.
    pub routine_intents: Vec<Intent>,
}

/// Inputs of the five-layer reply safety gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyPolicy {
    /// Layer 1: intents that are never answered.
    pub restricted_intents: Vec<Intent>,
    /// Layer 1: analyses below this confidence are never answered.
    pub min_confidence: Confidence,
    /// Layers 2 and 5: unconditionally disqualifying terms.
    pub hard_block_keywords: Vec<String>,
    /// Layer 3: disqualifying only with negative sentiment or urgency.
    pub soft_indicators: Vec<String>,
    /// Layer 4: intent → template, first match wins.
    pub patterns: Vec<ReplyPattern>,
    /// Layer 4: the closed set of approved response texts.
    pub templates: Vec<ReplyTemplate>,
    /// Layer 5: terms a template must never contain, on top of the hard list.
    pub forbidden_output_terms: Vec<String>,
}

/// Maps one intent onto an approved template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPattern {
    pub intent: Intent,
    pub template_id: String,
}

/// A pre-approved static response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTemplate {
    pub id: String,
    pub text: String,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for TriagePolicy {
    fn default() -> Self {
        Self {
            version: "2025.1".into(),
            urgency_markers: words(&[
                "urgent",
                "immediately",
                "immediate",
                "asap",
                "overdue",
                "past due",
            ]),
            priority: PriorityPolicy::default(),
            reply: ReplyPolicy::default(),
        }
    }
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            risk_keywords: words(&[
                "claim", "payment", "refund", "fraud", "legal", "court", "lawsuit",
            ]),
            restricted_intents: vec![Intent::Complaint, Intent::ClaimRelated, Intent::PaymentIssue],
            actionable_intents: vec![Intent::Request, Intent::DocumentSubmission],
            routine_intents: vec![Intent::GeneralEnquiry, Intent::Appreciation],
        }
    }
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self {
            restricted_intents: vec![
                Intent::Complaint,
                Intent::ClaimRelated,
                Intent::PaymentIssue,
                Intent::Surrender,
            ],
            min_confidence: Confidence::Medium,
            hard_block_keywords: words(&[
                "claim",
                "payment",
                "paid",
                "refund",
                "fraud",
                "legal",
                "lawyer",
                "attorney",
                "court",
                "lawsuit",
                "surrender",
                "cancellation",
                "cancel",
                "maturity",
                "complaint",
                "escalat",
            ]),
            soft_indicators: words(&[
                "timeline",
                "deadline",
                "due date",
                "due by",
                "approval",
                "when will",
                "how long",
                "processing time",
                "amount",
            ]),
            patterns: vec![
                ReplyPattern {
                    intent: Intent::GeneralEnquiry,
                    template_id: "PATTERN_B".into(),
                },
                ReplyPattern {
                    intent: Intent::Request,
                    template_id: "PATTERN_A".into(),
                },
                ReplyPattern {
                    intent: Intent::Appreciation,
                    template_id: "PATTERN_C".into(),
                },
            ],
            templates: vec![
                ReplyTemplate {
                    id: "PATTERN_A".into(),
                    text: "Thank you for contacting us.\nWe have received your message and it has been noted for review.".into(),
                },
                ReplyTemplate {
                    id: "PATTERN_B".into(),
                    text: "Thank you for your query.\nOur team is reviewing the information and will respond with the relevant details.".into(),
                },
                ReplyTemplate {
                    id: "PATTERN_C".into(),
                    text: "Thank you for your feedback.\nWe appreciate you taking the time to share your experience.".into(),
                },
            ],
            forbidden_output_terms: words(&[
                "guarantee",
                "will process",
                "will be processed",
                "authoriz",
                "approved",
                "settled",
                "timeframe",
            ]),
        }
    }
}

impl TriagePolicy {
    /// Load a policy from a JSON file. Missing sections fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PolicyError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a policy from JSON.
    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        let policy: Self = serde_json::from_str(raw)?;
        policy.validated()
    }

    /// Normalize keyword lists to lowercase and check internal consistency.
    pub fn validated(mut self) -> Result<Self, PolicyError> {
        if self.version.trim().is_empty() {
            return Err(PolicyError::Invalid("version must not be empty".into()));
        }

        for list in [
            &mut self.urgency_markers,
            &mut self.priority.risk_keywords,
            &mut self.reply.hard_block_keywords,
            &mut self.reply.soft_indicators,
            &mut self.reply.forbidden_output_terms,
        ] {
            for term in list.iter_mut() {
                *term = term.trim().to_lowercase();
            }
            if list.iter().any(|t| t.is_empty()) {
                return Err(PolicyError::Invalid("keyword lists must not contain empty terms".into()));
            }
        }

        if self.reply.hard_block_keywords.is_empty() {
            return Err(PolicyError::Invalid("reply.hard_block_keywords must not be empty".into()));
        }

        // Replies are never less conservative than priority: every risk
        // keyword must also be caught by the hard block list.
        if let Some(term) = self
            .priority
            .risk_keywords
            .iter()
            .find(|term| first_match(term, &self.reply.hard_block_keywords).is_none())
        {
            return Err(PolicyError::Invalid(format!(
                "priority risk keyword '{term}' is not covered by reply.hard_block_keywords"
            )));
        }

        for pattern in &self.reply.patterns {
            if self.template(&pattern.template_id).is_none() {
                return Err(PolicyError::Invalid(format!(
                    "pattern for {} references unknown template {}",
                    pattern.intent, pattern.template_id
                )));
            }
        }

        Ok(self)
    }

    /// Look up a template by id.
    pub fn template(&self, id: &str) -> Option<&ReplyTemplate> {
        self.reply.templates.iter().find(|t| t.id == id)
    }
}

/// First term of `terms` contained in the already-lowercased `haystack`.
pub fn first_match<'a>(haystack: &str, terms: &'a [String]) -> Option<&'a str> {
    terms
        .iter()
        .map(String::as_str)
        .find(|term| haystack.contains(term))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = TriagePolicy::default().validated().unwrap();
        assert_eq!(policy.reply.patterns.len(), 3);
        assert!(policy.template("PATTERN_A").is_some());
    }

    #[test]
    fn default_templates_pass_their_own_post_validation() {
        let policy = TriagePolicy::default();
        for template in &policy.reply.templates {
            let text = template.text.to_lowercase();
            assert_eq!(first_match(&text, &policy.reply.hard_block_keywords), None);
            assert_eq!(first_match(&text, &policy.reply.forbidden_output_terms), None);
        }
    }

    #[test]
    fn hard_list_is_broader_than_priority_risk_list() {
        let policy = TriagePolicy::default();
        for term in &policy.priority.risk_keywords {
            assert!(
                first_match(term, &policy.reply.hard_block_keywords).is_some(),
                "risk keyword '{term}' must also block replies"
            );
        }
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let policy = TriagePolicy::from_json(r#"{"version": "custom-7"}"#).unwrap();
        assert_eq!(policy.version, "custom-7");
        assert_eq!(policy.reply, ReplyPolicy::default());
    }

    #[test]
    fn json_keywords_are_lowercased() {
        let policy = TriagePolicy::from_json(
            r#"{"version": "v2",
                "priority": {"risk_keywords": ["FRAUD"]},
                "reply": {"hard_block_keywords": ["  Fraud "]}}"#,
        )
        .unwrap();
        assert_eq!(policy.reply.hard_block_keywords, vec!["fraud".to_string()]);
        assert_eq!(policy.priority.risk_keywords, vec!["fraud".to_string()]);
    }

    #[test]
    fn json_hard_list_must_cover_risk_keywords() {
        let err = TriagePolicy::from_json(
            r#"{"version": "v2", "reply": {"hard_block_keywords": ["fraud"]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("'claim'"), "{err}");
    }

    #[test]
    fn unknown_template_reference_is_rejected() {
        let raw = r#"{
            "version": "broken",
            "reply": {
                "patterns": [{"intent": "REQUEST", "template_id": "MISSING"}],
                "templates": []
            }
        }"#;
        assert!(matches!(
            TriagePolicy::from_json(raw),
            Err(PolicyError::Invalid(_))
        ));
    }

    #[test]
    fn empty_version_is_rejected() {
        assert!(TriagePolicy::from_json(r#"{"version": ""}"#).is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{"version": "file-1"}"#).unwrap();
        assert_eq!(TriagePolicy::from_file(&path).unwrap().version, "file-1");
        assert!(TriagePolicy::from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn first_match_respects_list_order() {
        let terms = words(&["refund", "claim"]);
        assert_eq!(first_match("claim and refund", &terms), Some("refund"));
        assert_eq!(first_match("nothing here", &terms), None);
    }
}
