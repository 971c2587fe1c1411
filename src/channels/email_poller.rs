//! Ingestion scheduler: polls a [`MailFetcher`] and persists new mail.
//!
//! Each tick:
//! 1. Fetches one batch from the mail source
//! 2. Inserts every message as a PENDING work item
//! 3. Skips messages whose external id is already stored
//! 4. Acknowledges stored messages to the source; anything the store refused
//!    stays new there and is fetched again on the next tick
//!
//! Workers pick PENDING items up from the store; the poller never talks to
//! them directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ChannelError;
use crate::pipeline::collaborators::MailFetcher;
use crate::store::{Database, InsertOutcome, NewWorkItem};

/// Result of one ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Messages the store refused for a reason other than a duplicate id.
    pub failed: usize,
}

/// Spawn a background task that polls `fetcher` every `interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_email_poller(
    fetcher: Arc<dyn MailFetcher>,
    db: Arc<dyn Database>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            source = fetcher.name(),
            interval_secs = interval.as_secs(),
            "Ingestion scheduler started"
        );

        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Ingestion scheduler shutting down");
                return;
            }

            match ingest_once(fetcher.as_ref(), db.as_ref()).await {
                Ok(report) if report.fetched > 0 => {
                    info!(
                        source = fetcher.name(),
                        fetched = report.fetched,
                        inserted = report.inserted,
                        duplicates = report.duplicates,
                        failed = report.failed,
                        "Ingestion pass complete"
                    );
                }
                Ok(_) => debug!(source = fetcher.name(), "No new mail"),
                Err(e) => error!(error = %e, "Mail fetch failed"),
            }
        }
    });

    (handle, shutdown_flag)
}

/// Run a single ingestion pass: fetch → insert (deduplicated) → acknowledge.
///
/// A fetch failure aborts the pass. A store failure on one message is
/// logged and counted; the rest of the batch is still inserted, and the
/// failed message is left unacknowledged.
pub async fn ingest_once(
    fetcher: &dyn MailFetcher,
    db: &dyn Database,
) -> Result<IngestReport, ChannelError> {
    let batch = fetcher.fetch_new().await?;
    let mut report = IngestReport {
        fetched: batch.len(),
        ..IngestReport::default()
    };

    let mut stored = Vec::with_capacity(batch.len());

    for mail in batch {
        let external_id = mail.external_id.clone();
        let item = NewWorkItem {
            external_id: mail.external_id,
            sender: mail.sender,
            subject: mail.subject,
            body: mail.body,
            received_at: mail.received_at,
        };

        match db.insert_item(&item).await {
            Ok(InsertOutcome::Inserted(id)) => {
                debug!(id = %id, external_id = %external_id, "Persisted new mail");
                report.inserted += 1;
                stored.push(external_id);
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!(external_id = %external_id, "Already ingested, skipping");
                report.duplicates += 1;
                stored.push(external_id);
            }
            Err(e) => {
                error!(external_id = %external_id, error = %e, "Failed to persist mail");
                report.failed += 1;
            }
        }
    }

    // Stored mail is safe either way: a re-fetch after a failed
    // acknowledgement is absorbed as a duplicate.
    if let Err(e) = fetcher.acknowledge(&stored).await {
        warn!(source = fetcher.name(), error = %e, "Failed to acknowledge stored mail");
    }

    Ok(report)
}
