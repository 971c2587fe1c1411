//! Mail channels: inbound fetch, outbound replies, and the ingestion scheduler.

pub mod email;
pub mod email_poller;

pub use email::{EmailConfig, ImapFetcher, SmtpDispatcher};
pub use email_poller::{IngestReport, ingest_once, spawn_email_poller};
