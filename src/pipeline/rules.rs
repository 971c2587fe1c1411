//! Priority rule engine.
//!
//! An explicit, ordered list of rules evaluated top to bottom; the first
//! rule that matches decides the priority. The order is fixed:
//! 1. risk keyword in the body → HIGH
//! 2. restricted intent → HIGH
//! 3. negative sentiment (non-routine intent) → HIGH with urgency, else MEDIUM
//! 4. actionable intent → MEDIUM
//! 5. routine intent, sentiment not negative → LOW
//!
//! Anything else falls through to MEDIUM. The policy supplies the keyword
//! lists and intent sets, never the order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::policy::{TriagePolicy, first_match};
use crate::pipeline::types::{Intent, Priority, Sentiment};

/// Inputs to priority classification.
#[derive(Debug, Clone)]
pub struct PriorityInput<'a> {
    pub intent: &'a Intent,
    pub sentiment: Sentiment,
    pub summary: &'a str,
    pub body: &'a str,
}

/// A priority and the human-readable reason that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityDecision {
    pub priority: Priority,
    pub reason: String,
}

impl PriorityDecision {
    fn new(priority: Priority, reason: impl Into<String>) -> Self {
        Self {
            priority,
            reason: reason.into(),
        }
    }
}

/// One rule of the engine.
#[derive(Debug, Clone)]
enum PriorityRule {
    RiskKeyword { keywords: Vec<String> },
    RestrictedIntent { intents: Vec<Intent> },
    NegativeSentiment { exempt: Vec<Intent>, urgency_markers: Vec<String> },
    ActionableIntent { intents: Vec<Intent> },
    RoutineIntent { intents: Vec<Intent> },
}

impl PriorityRule {
    fn evaluate(&self, input: &PriorityInput<'_>, body_lower: &str) -> Option<PriorityDecision> {
        match self {
            Self::RiskKeyword { keywords } => first_match(body_lower, keywords)
                .map(|term| PriorityDecision::new(Priority::High, format!("risk keyword: {term}"))),
            Self::RestrictedIntent { intents } => intents
                .contains(input.intent)
                .then(|| PriorityDecision::new(Priority::High, "restricted intent")),
            Self::NegativeSentiment {
                exempt,
                urgency_markers,
            } => {
                if input.sentiment != Sentiment::Negative || exempt.contains(input.intent) {
                    return None;
                }
                Some(match first_match(body_lower, urgency_markers) {
                    Some(marker) => PriorityDecision::new(
                        Priority::High,
                        format!("negative sentiment with urgency marker: {marker}"),
                    ),
                    None => PriorityDecision::new(Priority::Medium, "negative sentiment"),
                })
            }
            Self::ActionableIntent { intents } => intents.contains(input.intent).then(|| {
                PriorityDecision::new(Priority::Medium, format!("actionable intent: {}", input.intent))
            }),
            Self::RoutineIntent { intents } => (intents.contains(input.intent)
                && input.sentiment != Sentiment::Negative)
                .then(|| {
                    PriorityDecision::new(Priority::Low, format!("routine intent: {}", input.intent))
                }),
        }
    }
}

/// Deterministic priority classifier.
pub struct PriorityClassifier {
    rules: Vec<PriorityRule>,
}

impl PriorityClassifier {
    /// Build the rule list from a policy.
    pub fn new(policy: Arc<TriagePolicy>) -> Self {
        let p = &policy.priority;
        let rules = vec![
            PriorityRule::RiskKeyword {
                keywords: p.risk_keywords.clone(),
            },
            PriorityRule::RestrictedIntent {
                intents: p.restricted_intents.clone(),
            },
            PriorityRule::NegativeSentiment {
                exempt: p.routine_intents.clone(),
                urgency_markers: policy.urgency_markers.clone(),
            },
            PriorityRule::ActionableIntent {
                intents: p.actionable_intents.clone(),
            },
            PriorityRule::RoutineIntent {
                intents: p.routine_intents.clone(),
            },
        ];
        Self { rules }
    }

    /// Classify a message. Pure: same input, same decision.
    pub fn classify(&self, input: &PriorityInput<'_>) -> PriorityDecision {
        let body_lower = input.body.to_lowercase();

        let decision = self
            .rules
            .iter()
            .find_map(|rule| rule.evaluate(input, &body_lower))
            .unwrap_or_else(|| {
                PriorityDecision::new(
                    Priority::Medium,
                    format!("default: unclassified intent {}", input.intent),
                )
            });

        debug!(
            intent = %input.intent,
            sentiment = %input.sentiment,
            summary = input.summary,
            priority = %decision.priority,
            reason = %decision.reason,
            "Priority classified"
        );
        decision
    }
}
