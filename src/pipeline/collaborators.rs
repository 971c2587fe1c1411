//! External collaborators consumed by the pipeline.
//!
//! The orchestrator only knows these traits. Production implementations
//! live in `privacy` (redaction), `analysis` (HTTP analysis engine) and
//! `channels::email` (IMAP fetch, SMTP dispatch); tests plug in stubs.

use async_trait::async_trait;

use crate::error::{ChannelError, PipelineError};
use crate::pipeline::types::{Analysis, FetchedMail, Redaction};

/// Removes personal data before anything leaves the process.
///
/// Must accept empty input and never return partially redacted text: it
/// either redacts everything it recognizes or fails.
#[async_trait]
pub trait Redactor: Send + Sync {
    async fn redact(&self, text: &str) -> Result<Redaction, PipelineError>;
}

/// Turns redacted text into a structured analysis.
///
/// Any failure (unreachable, timeout, missing or unknown fields) fails the
/// record. Implementations never substitute defaults.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, redacted_text: &str) -> Result<Analysis, PipelineError>;
}

/// Source of inbound mail. One finite batch per call.
///
/// A fetched message stays "new" at the source until it is acknowledged, so
/// mail that could not be persisted is offered again on the next call.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn fetch_new(&self) -> Result<Vec<FetchedMail>, ChannelError>;

    /// Mark messages as durably stored so later fetches skip them.
    async fn acknowledge(&self, _external_ids: &[String]) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Delivers a human-approved reply.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    async fn send_reply(&self, to: &str, subject: &str, body: &str) -> Result<(), ChannelError>;
}
