//! Reply safety gate: decides whether a draft reply may be shown at all.
//!
//! Five layers run strictly in order and the first layer that blocks ends
//! evaluation with `NO_REPLY`:
//!
//! 1. Entry conditions: HIGH priority, restricted intent, low confidence
//! 2. Hard keyword block on the redacted body
//! 3. Soft indicator combined with a risk signal (negative sentiment or urgency)
//! 4. Deterministic intent → template selection; unmapped intents are not answered
//! 5. Post-validation of the selected template against the hard and forbidden lists
//!
//! The gate never generates text. A passing decision carries one of the
//! policy's static templates; every decision carries an audit reason naming
//! the layer and rule that decided it. Drafts are only ever shown to a human
//! for review, never sent from here.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::pipeline::policy::{TriagePolicy, first_match};
use crate::pipeline::types::{Confidence, Intent, Priority, Sentiment};

/// Sentinel stored in place of a reply when no draft is safe.
pub const NO_REPLY: &str = "NO_REPLY";

/// Inputs to the gate.
#[derive(Debug, Clone)]
pub struct GateInput<'a> {
    pub intent: &'a Intent,
    pub priority: Priority,
    pub confidence: Confidence,
    pub sentiment: Sentiment,
    pub redacted_body: &'a str,
}

/// Gate layer that decided an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateLayer {
    EntryConditions,
    HardKeyword,
    SoftIndicator,
    PatternSelection,
    PostValidation,
}

impl GateLayer {
    pub fn number(&self) -> u8 {
        match self {
            Self::EntryConditions => 1,
            Self::HardKeyword => 2,
            Self::SoftIndicator => 3,
            Self::PatternSelection => 4,
            Self::PostValidation => 5,
        }
    }
}

impl fmt::Display for GateLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Layer {}", self.number())
    }
}

/// Rule keys recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockRule {
    HighPriority,
    RestrictedIntent,
    LowConfidence,
    HardBlockKeyword,
    SoftIndicatorWithRisk,
    PatternNotFound,
    PostValidationFail,
}

impl BlockRule {
    pub fn key(&self) -> &'static str {
        match self {
            Self::HighPriority => "HIGH_PRIORITY",
            Self::RestrictedIntent => "RESTRICTED_INTENT",
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::HardBlockKeyword => "HARD_BLOCK_KEYWORD",
            Self::SoftIndicatorWithRisk => "SOFT_INDICATOR_WITH_RISK",
            Self::PatternNotFound => "PATTERN_NOT_FOUND",
            Self::PostValidationFail => "POST_VALIDATION_FAIL",
        }
    }

    fn layer(&self) -> GateLayer {
        match self {
            Self::HighPriority | Self::RestrictedIntent | Self::LowConfidence => {
                GateLayer::EntryConditions
            }
            Self::HardBlockKeyword => GateLayer::HardKeyword,
            Self::SoftIndicatorWithRisk => GateLayer::SoftIndicator,
            Self::PatternNotFound => GateLayer::PatternSelection,
            Self::PostValidationFail => GateLayer::PostValidation,
        }
    }
}

/// Outcome of the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyDecision {
    /// An approved template, ready for human review.
    Draft {
        template_id: String,
        text: String,
        audit_reason: String,
    },
    /// No draft is safe; route to a human.
    NoReply {
        layer: GateLayer,
        rule: BlockRule,
        audit_reason: String,
    },
}

impl ReplyDecision {
    /// Reply text as persisted: the template, or the `NO_REPLY` sentinel.
    pub fn reply_text(&self) -> &str {
        match self {
            Self::Draft { text, .. } => text,
            Self::NoReply { .. } => NO_REPLY,
        }
    }

    pub fn audit_reason(&self) -> &str {
        match self {
            Self::Draft { audit_reason, .. } | Self::NoReply { audit_reason, .. } => audit_reason,
        }
    }

    pub fn is_no_reply(&self) -> bool {
        matches!(self, Self::NoReply { .. })
    }

    fn block(rule: BlockRule, detail: String) -> Self {
        let layer = rule.layer();
        let audit_reason = format!("{layer}: {} ({detail})", rule.key());
        info!(
            layer = layer.number(),
            rule = rule.key(),
            detail = %detail,
            "NO_REPLY decision"
        );
        Self::NoReply {
            layer,
            rule,
            audit_reason,
        }
    }
}

/// The five-layer reply safety gate.
pub struct ReplyGate {
    policy: Arc<TriagePolicy>,
}

impl ReplyGate {
    pub fn new(policy: Arc<TriagePolicy>) -> Self {
        Self { policy }
    }

    /// Run all layers in order. Pure apart from audit logging.
    pub fn decide(&self, input: &GateInput<'_>) -> ReplyDecision {
        let body_lower = input.redacted_body.to_lowercase();

        if let Some(blocked) = self
            .entry_conditions(input)
            .or_else(|| self.hard_keywords(&body_lower))
            .or_else(|| self.soft_indicators(input, &body_lower))
        {
            return blocked;
        }

        let (template_id, text) = match self.select_pattern(input.intent) {
            Ok(found) => found,
            Err(blocked) => return blocked,
        };

        if let Some(blocked) = self.post_validate(template_id, text) {
            return blocked;
        }

        debug!(intent = %input.intent, template_id, "Reply draft approved by gate");
        ReplyDecision::Draft {
            template_id: template_id.to_string(),
            text: text.to_string(),
            audit_reason: format!("{}: pattern matched, no blocks", GateLayer::PatternSelection),
        }
    }

    // Layer 1
    fn entry_conditions(&self, input: &GateInput<'_>) -> Option<ReplyDecision> {
        let reply = &self.policy.reply;
        if input.priority == Priority::High {
            return Some(ReplyDecision::block(
                BlockRule::HighPriority,
                format!("priority {}, intent {}", input.priority, input.intent),
            ));
        }
        if reply.restricted_intents.contains(input.intent) {
            return Some(ReplyDecision::block(
                BlockRule::RestrictedIntent,
                format!("intent {}", input.intent),
            ));
        }
        if input.confidence < reply.min_confidence {
            return Some(ReplyDecision::block(
                BlockRule::LowConfidence,
                format!("confidence {}, minimum {}", input.confidence, reply.min_confidence),
            ));
        }
        None
    }

    // Layer 2
    fn hard_keywords(&self, body_lower: &str) -> Option<ReplyDecision> {
        first_match(body_lower, &self.policy.reply.hard_block_keywords).map(|term| {
            ReplyDecision::block(BlockRule::HardBlockKeyword, format!("keyword '{term}'"))
        })
    }

    // Layer 3
    fn soft_indicators(&self, input: &GateInput<'_>, body_lower: &str) -> Option<ReplyDecision> {
        let soft = first_match(body_lower, &self.policy.reply.soft_indicators)?;

        let risk = if input.sentiment == Sentiment::Negative {
            Some("negative sentiment".to_string())
        } else {
            first_match(body_lower, &self.policy.urgency_markers)
                .map(|marker| format!("urgency marker '{marker}'"))
        };

        risk.map(|risk| {
            ReplyDecision::block(BlockRule::SoftIndicatorWithRisk, format!("'{soft}' + {risk}"))
        })
    }

    // Layer 4
    fn select_pattern(&self, intent: &Intent) -> Result<(&str, &str), ReplyDecision> {
        let pattern = self
            .policy
            .reply
            .patterns
            .iter()
            .find(|p| &p.intent == intent)
            .ok_or_else(|| {
                ReplyDecision::block(BlockRule::PatternNotFound, format!("intent {intent}"))
            })?;

        let template = self.policy.template(&pattern.template_id).ok_or_else(|| {
            ReplyDecision::block(
                BlockRule::PatternNotFound,
                format!("template {} missing for intent {intent}", pattern.template_id),
            )
        })?;

        Ok((template.id.as_str(), template.text.as_str()))
    }

    // Layer 5
    fn post_validate(&self, template_id: &str, text: &str) -> Option<ReplyDecision> {
        let reply = &self.policy.reply;
        let text_lower = text.to_lowercase();
        first_match(&text_lower, &reply.hard_block_keywords)
            .or_else(|| first_match(&text_lower, &reply.forbidden_output_terms))
            .map(|term| {
                ReplyDecision::block(
                    BlockRule::PostValidationFail,
                    format!("template {template_id} contains '{term}'"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ReplyGate {
        ReplyGate::new(Arc::new(TriagePolicy::default()))
    }

    fn input<'a>(
        intent: &'a Intent,
        priority: Priority,
        confidence: Confidence,
        sentiment: Sentiment,
        body: &'a str,
    ) -> GateInput<'a> {
        GateInput {
            intent,
            priority,
            confidence,
            sentiment,
            redacted_body: body,
        }
    }

    fn assert_blocked(decision: &ReplyDecision, expected: BlockRule) {
        match decision {
            ReplyDecision::NoReply { rule, layer, .. } => {
                assert_eq!(*rule, expected);
                assert_eq!(*layer, expected.layer());
            }
            other => panic!("expected NO_REPLY via {expected:?}, got {other:?}"),
        }
        assert_eq!(decision.reply_text(), NO_REPLY);
    }

    #[test]
    fn clean_general_enquiry_gets_template() {
        let intent = Intent::GeneralEnquiry;
        let d = gate().decide(&input(
            &intent,
            Priority::Low,
            Confidence::High,
            Sentiment::Neutral,
            "Can you tell me more about your policies?",
        ));
        match &d {
            ReplyDecision::Draft { template_id, text, audit_reason } => {
                assert_eq!(template_id, "PATTERN_B");
                assert!(text.starts_with("Thank you for your query."));
                assert_eq!(audit_reason, "Layer 4: pattern matched, no blocks");
            }
            other => panic!("expected draft, got {other:?}"),
        }
    }

    #[test]
    fn each_mapped_intent_gets_its_template() {
        for (intent, id) in [
            (Intent::Request, "PATTERN_A"),
            (Intent::GeneralEnquiry, "PATTERN_B"),
            (Intent::Appreciation, "PATTERN_C"),
        ] {
            let d = gate().decide(&input(
                &intent,
                Priority::Low,
                Confidence::High,
                Sentiment::Positive,
                "hello",
            ));
            assert!(matches!(d, ReplyDecision::Draft { ref template_id, .. } if template_id == id));
        }
    }

    #[test]
    fn layer1_blocks_high_priority() {
        let intent = Intent::GeneralEnquiry;
        let d = gate().decide(&input(&intent, Priority::High, Confidence::High, Sentiment::Neutral, "hi"));
        assert_blocked(&d, BlockRule::HighPriority);
        assert!(d.audit_reason().starts_with("Layer 1: HIGH_PRIORITY"));
    }

    #[test]
    fn layer1_blocks_restricted_intent() {
        for intent in [Intent::Complaint, Intent::ClaimRelated, Intent::PaymentIssue, Intent::Surrender] {
            let d = gate().decide(&input(&intent, Priority::Medium, Confidence::High, Sentiment::Neutral, "hi"));
            assert_blocked(&d, BlockRule::RestrictedIntent);
        }
    }

    #[test]
    fn layer1_blocks_low_confidence_only() {
        let intent = Intent::Request;
        let d = gate().decide(&input(&intent, Priority::Low, Confidence::Low, Sentiment::Neutral, "hi"));
        assert_blocked(&d, BlockRule::LowConfidence);

        let d = gate().decide(&input(&intent, Priority::Low, Confidence::Medium, Sentiment::Neutral, "hi"));
        assert!(!d.is_no_reply());
    }

    #[test]
    fn stricter_confidence_floor_from_policy() {
        let mut policy = TriagePolicy::default();
        policy.reply.min_confidence = Confidence::High;
        let gate = ReplyGate::new(Arc::new(policy));
        let intent = Intent::Request;
        let d = gate.decide(&input(&intent, Priority::Low, Confidence::Medium, Sentiment::Neutral, "hi"));
        assert_blocked(&d, BlockRule::LowConfidence);
    }

    #[test]
    fn layer1_block_is_final_even_when_later_layers_would_pass() {
        // Clean body, mapped intent: only the entry condition can block.
        let intent = Intent::GeneralEnquiry;
        for (priority, confidence) in [
            (Priority::High, Confidence::High),
            (Priority::Low, Confidence::Low),
        ] {
            let d = gate().decide(&input(&intent, priority, confidence, Sentiment::Positive, "hello"));
            assert!(d.is_no_reply());
            assert!(matches!(d, ReplyDecision::NoReply { layer: GateLayer::EntryConditions, .. }));
        }
    }

    #[test]
    fn layer1_reported_before_layer2() {
        let intent = Intent::Complaint;
        let d = gate().decide(&input(&intent, Priority::High, Confidence::Low, Sentiment::Negative, "refund now"));
        assert_blocked(&d, BlockRule::HighPriority);
    }

    #[test]
    fn layer2_blocks_hard_keyword_case_insensitive() {
        let intent = Intent::Request;
        let d = gate().decide(&input(
            &intent,
            Priority::Medium,
            Confidence::High,
            Sentiment::Neutral,
            "I would like a REFUND for last month.",
        ));
        assert_blocked(&d, BlockRule::HardBlockKeyword);
        assert_eq!(d.audit_reason(), "Layer 2: HARD_BLOCK_KEYWORD (keyword 'refund')");
    }

    #[test]
    fn layer2_covers_terms_outside_priority_list() {
        let intent = Intent::GeneralEnquiry;
        for body in ["What is the surrender value?", "Maturity date of my plan", "cancellation form"] {
            let d = gate().decide(&input(&intent, Priority::Low, Confidence::High, Sentiment::Positive, body));
            assert_blocked(&d, BlockRule::HardBlockKeyword);
        }
    }

    #[test]
    fn layer3_soft_with_urgency_blocks() {
        let intent = Intent::Request;
        let d = gate().decide(&input(
            &intent,
            Priority::Medium,
            Confidence::High,
            Sentiment::Negative,
            "The deadline is tomorrow, this is urgent.",
        ));
        assert_blocked(&d, BlockRule::SoftIndicatorWithRisk);
        assert!(d.audit_reason().contains("'deadline'"));
    }

    #[test]
    fn layer3_soft_with_urgency_and_neutral_sentiment_blocks() {
        let intent = Intent::GeneralEnquiry;
        let d = gate().decide(&input(
            &intent,
            Priority::Medium,
            Confidence::High,
            Sentiment::Neutral,
            "I need to know the timeline for processing immediately.",
        ));
        assert_blocked(&d, BlockRule::SoftIndicatorWithRisk);
        assert!(d.audit_reason().contains("urgency marker 'immediately'"));
    }

    #[test]
    fn layer3_soft_with_negative_sentiment_blocks() {
        let intent = Intent::Request;
        let d = gate().decide(&input(
            &intent,
            Priority::Medium,
            Confidence::High,
            Sentiment::Negative,
            "Why hasn't my approval request moved yet?",
        ));
        assert_blocked(&d, BlockRule::SoftIndicatorWithRisk);
        assert!(d.audit_reason().contains("negative sentiment"));
    }

    #[test]
    fn layer3_soft_alone_passes() {
        let intent = Intent::GeneralEnquiry;
        let d = gate().decide(&input(
            &intent,
            Priority::Low,
            Confidence::High,
            Sentiment::Positive,
            "Just wondering about general timelines for policy registration.",
        ));
        assert!(!d.is_no_reply());
    }

    #[test]
    fn layer4_unmapped_intent_blocks() {
        for intent in [Intent::DocumentSubmission, Intent::Other("POLICY_LOAN".into())] {
            let d = gate().decide(&input(&intent, Priority::Medium, Confidence::High, Sentiment::Neutral, "hello"));
            assert_blocked(&d, BlockRule::PatternNotFound);
        }
    }

    #[test]
    fn layer5_catches_template_regression() {
        let mut policy = TriagePolicy::default();
        for template in &mut policy.reply.templates {
            if template.id == "PATTERN_B" {
                template.text = "Thank you. Your claim has been noted.".into();
            }
        }
        let gate = ReplyGate::new(Arc::new(policy));
        let intent = Intent::GeneralEnquiry;
        let d = gate.decide(&input(&intent, Priority::Low, Confidence::High, Sentiment::Neutral, "hello"));
        assert_blocked(&d, BlockRule::PostValidationFail);
        assert_eq!(
            d.audit_reason(),
            "Layer 5: POST_VALIDATION_FAIL (template PATTERN_B contains 'claim')"
        );
    }

    #[test]
    fn layer5_checks_forbidden_output_terms() {
        let mut policy = TriagePolicy::default();
        policy.reply.templates[0].text = "We guarantee a response.".into();
        let template_id = policy.reply.templates[0].id.clone();
        let intent = policy
            .reply
            .patterns
            .iter()
            .find(|p| p.template_id == template_id)
            .map(|p| p.intent.clone())
            .unwrap();
        let gate = ReplyGate::new(Arc::new(policy));
        let d = gate.decide(&input(&intent, Priority::Low, Confidence::High, Sentiment::Neutral, "hello"));
        assert_blocked(&d, BlockRule::PostValidationFail);
    }

    #[test]
    fn decision_serializes_with_outcome_tag() {
        let intent = Intent::Complaint;
        let d = gate().decide(&input(&intent, Priority::Medium, Confidence::High, Sentiment::Neutral, "hi"));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["outcome"], "no_reply");
        assert_eq!(json["rule"], "RESTRICTED_INTENT");
    }
}
