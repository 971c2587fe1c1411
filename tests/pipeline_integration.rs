//! End-to-end pipeline tests over a file-backed store: ingestion, the
//! worker pool, crash recovery and retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;

use inbox_triage::channels::{ingest_once, spawn_email_poller};
use inbox_triage::error::{ChannelError, PipelineError};
use inbox_triage::pipeline::types::{Analysis, Confidence, FetchedMail, Intent, Sentiment};
use inbox_triage::pipeline::worker::{WorkerConfig, drain, recover_once, spawn_workers};
use inbox_triage::pipeline::{Analyzer, MailFetcher, RecordProcessor, RetryPolicy, TriagePolicy};
use inbox_triage::privacy::PatternRedactor;
use inbox_triage::store::{Database, LibSqlBackend, WorkStatus};

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Answers every message as a neutral general enquiry. Fails the first
/// `fail_first` calls.
struct FlakyAnalyzer {
    fail_first: usize,
    calls: AtomicUsize,
}

impl FlakyAnalyzer {
    fn reliable() -> Self {
        Self::failing_first(0)
    }

    fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Analyzer for FlakyAnalyzer {
    async fn analyze(&self, _redacted_text: &str) -> Result<Analysis, PipelineError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(PipelineError::AnalysisUnavailable("connection refused".into()));
        }
        // Slow enough for workers to overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Analysis {
            intent: Intent::GeneralEnquiry,
            sentiment: Sentiment::Neutral,
            summary: "asks for office hours".into(),
            confidence: Confidence::High,
        })
    }
}

struct InboxFetcher {
    count: usize,
}

#[async_trait]
impl MailFetcher for InboxFetcher {
    fn name(&self) -> &str {
        "inbox"
    }

    async fn fetch_new(&self) -> Result<Vec<FetchedMail>, ChannelError> {
        Ok((0..self.count)
            .map(|i| FetchedMail {
                external_id: format!("<{i}@customers.test>"),
                sender: format!("customer{i}@customers.test"),
                subject: "Office hours".into(),
                body: format!("Hi, what are your office hours? Call me on +44 20 7946 09{i:02}"),
                received_at: Utc::now(),
            })
            .collect())
    }
}

fn processor(db: Arc<dyn Database>, analyzer: FlakyAnalyzer, max_retries: u32) -> RecordProcessor {
    RecordProcessor::new(
        db,
        Arc::new(PatternRedactor::new()),
        Arc::new(analyzer),
        Arc::new(TriagePolicy::default()),
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            jitter: 0.0,
            ..RetryPolicy::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ingested_mail_is_processed_exactly_once_by_the_pool() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn Database> =
            Arc::new(LibSqlBackend::new_local(&dir.path().join("triage.db")).await.unwrap());

        let fetcher = InboxFetcher { count: 20 };
        let report = ingest_once(&fetcher, db.as_ref()).await.unwrap();
        assert_eq!(report.inserted, 20);
        let again = ingest_once(&fetcher, db.as_ref()).await.unwrap();
        assert_eq!(again.duplicates, 20);

        let pool_processor = Arc::new(processor(Arc::clone(&db), FlakyAnalyzer::reliable(), 3));
        let config = WorkerConfig {
            workers: 4,
            idle_poll: Duration::from_millis(10),
            ..WorkerConfig::default()
        };
        let (handles, shutdown) = spawn_workers(pool_processor, &config);

        loop {
            if db.stats().await.unwrap().completed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.store(true, Ordering::Relaxed);
        futures::future::join_all(handles).await;

        let items = db.all_items().await.unwrap();
        assert_eq!(items.len(), 20);
        for item in &items {
            assert_eq!(item.status, WorkStatus::Completed);
            assert_eq!(item.retry_count, 0);
            let redacted = item.redacted_body.as_deref().unwrap();
            assert!(redacted.contains("[REDACTED]"), "phone not redacted: {redacted}");
            assert!(!redacted.contains("7946"));
            assert!(item.processed_at.is_some());
        }
        assert!(db.stats().await.unwrap().avg_processing_secs.is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abandoned_claim_is_recovered_and_completed() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.db");
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        ingest_once(&InboxFetcher { count: 1 }, db.as_ref()).await.unwrap();

        // A worker claims the record and crashes.
        let abandoned = db.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(abandoned.item.status, WorkStatus::Processing);
        assert!(db.claim_next_pending().await.unwrap().is_none());

        // Restart: a fresh backend over the same file.
        drop(db);
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());

        let (released, requeued) = recover_once(db.as_ref(), Duration::ZERO, 3).await;
        assert_eq!((released, requeued), (1, 0));
        let (released, _) = recover_once(db.as_ref(), Duration::from_secs(300), 3).await;
        assert_eq!(released, 0);

        let processor = processor(Arc::clone(&db), FlakyAnalyzer::reliable(), 3);
        assert_eq!(drain(&processor).await, 1);

        let item = db.get_item(abandoned.item.id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.retry_count, 1);

        // The crashed worker's late result is ignored.
        let late = inbox_triage::store::WorkOutcome::Failed {
            error: "late".into(),
            retry_at: None,
        };
        assert!(!db.update_result(item.id, abandoned.token, &late).await.unwrap());
        assert_eq!(
            db.get_item(item.id).await.unwrap().unwrap().status,
            WorkStatus::Completed
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn transient_analysis_failure_recovers_through_retry() {
    timeout(TEST_TIMEOUT, async {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        ingest_once(&InboxFetcher { count: 1 }, db.as_ref()).await.unwrap();

        let processor = processor(Arc::clone(&db), FlakyAnalyzer::failing_first(2), 3);

        for _ in 0..2 {
            assert_eq!(drain(&processor).await, 1);
            let items = db.all_items().await.unwrap();
            assert_eq!(items[0].status, WorkStatus::Failed);
            assert!(items[0].error.as_deref().unwrap().contains("connection refused"));
            assert!(items[0].retry_at.is_some());
            let (_, requeued) = recover_once(db.as_ref(), Duration::from_secs(300), 3).await;
            assert_eq!(requeued, 1);
        }

        assert_eq!(drain(&processor).await, 1);
        let items = db.all_items().await.unwrap();
        assert_eq!(items[0].status, WorkStatus::Completed);
        assert_eq!(items[0].retry_count, 2);
        assert!(items[0].error.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn scheduler_feeds_the_store_periodically() {
    timeout(TEST_TIMEOUT, async {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let fetcher: Arc<dyn MailFetcher> = Arc::new(InboxFetcher { count: 3 });

        let (handle, shutdown) =
            spawn_email_poller(fetcher, Arc::clone(&db), Duration::from_millis(10));
        loop {
            if db.stats().await.unwrap().pending == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Several more passes, still no duplicates.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::Relaxed);
        handle.await.unwrap();

        assert_eq!(db.stats().await.unwrap().total, 3);
    })
    .await
    .expect("test timed out");
}
