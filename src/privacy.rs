//! Default PII redaction: pattern based.
//!
//! Recognizes email addresses, payment card numbers and phone numbers and
//! replaces each occurrence with `[REDACTED]`. Patterns run in a fixed
//! order (cards before phones, since a card number also looks like a long
//! phone number). Over-redaction is acceptable; the analysis engine never
//! sees the original body.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::collaborators::Redactor;
use crate::pipeline::types::Redaction;

/// Replacement text for every redacted entity.
pub const REDACTED: &str = "[REDACTED]";

static PII_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        (
            "EMAIL_ADDRESS",
            Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap(),
        ),
        (
            "CREDIT_CARD",
            Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").unwrap(),
        ),
        (
            "PHONE_NUMBER",
            Regex::new(r"\+?\(?\d[\d\s().-]{7,}\d").unwrap(),
        ),
    ]
});

/// Regex-backed [`Redactor`].
#[derive(Debug, Default, Clone)]
pub struct PatternRedactor;

impl PatternRedactor {
    pub fn new() -> Self {
        Self
    }

    /// Redact synchronously. Total: empty input yields empty output.
    pub fn redact_text(&self, text: &str) -> Redaction {
        let mut redacted = text.to_string();
        let mut entity_count = 0u32;

        for (kind, pattern) in PII_PATTERNS.iter() {
            let found = pattern.find_iter(&redacted).count() as u32;
            if found == 0 {
                continue;
            }
            debug!(entity = kind, count = found, "Redacting PII");
            entity_count += found;
            redacted = pattern.replace_all(&redacted, REDACTED).into_owned();
        }

        Redaction {
            text: redacted,
            entity_count,
        }
    }
}

#[async_trait]
impl Redactor for PatternRedactor {
    async fn redact(&self, text: &str) -> Result<Redaction, PipelineError> {
        Ok(self.redact_text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redact(text: &str) -> Redaction {
        PatternRedactor::new().redact_text(text)
    }

    #[test]
    fn empty_input_is_fine() {
        let r = redact("");
        assert_eq!(r.text, "");
        assert_eq!(r.entity_count, 0);
    }

    #[test]
    fn plain_text_passes_through() {
        let r = redact("What are your office hours?");
        assert_eq!(r.text, "What are your office hours?");
        assert_eq!(r.entity_count, 0);
    }

    #[test]
    fn email_and_phone_are_redacted() {
        let r = redact("Email me at john.doe@example.com or call +44 20 7946 0958.");
        assert_eq!(r.text, "Email me at [REDACTED] or call [REDACTED].");
        assert_eq!(r.entity_count, 2);
    }

    #[test]
    fn card_number_counts_once() {
        let r = redact("My card is 4111 1111 1111 1111, please update it");
        assert_eq!(r.text, "My card is [REDACTED], please update it");
        assert_eq!(r.entity_count, 1);
    }

    #[test]
    fn short_numbers_are_kept() {
        let r = redact("Policy year 2024, 3 questions");
        assert_eq!(r.entity_count, 0);
    }

    #[tokio::test]
    async fn trait_impl_never_fails() {
        let r = PatternRedactor::new().redact("reach me at a@b.co").await.unwrap();
        assert_eq!(r.text, "reach me at [REDACTED]");
        assert_eq!(r.entity_count, 1);
    }
}
