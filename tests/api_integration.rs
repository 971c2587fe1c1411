//! Integration tests for the REST surface.
//!
//! Each test spins up the Axum router on a random port over an in-memory
//! store, injects mail through the API, runs the pipeline with a stub
//! analysis engine, and exercises the real HTTP contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use inbox_triage::api::{AppState, api_routes};
use inbox_triage::error::PipelineError;
use inbox_triage::pipeline::types::{Analysis, Confidence, Intent, Sentiment};
use inbox_triage::pipeline::worker::drain;
use inbox_triage::pipeline::{Analyzer, RecordProcessor, RetryPolicy, TriagePolicy};
use inbox_triage::privacy::PatternRedactor;
use inbox_triage::review::ReviewService;
use inbox_triage::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Picks an analysis from words in the (redacted) body.
struct KeywordAnalyzer;

#[async_trait]
impl Analyzer for KeywordAnalyzer {
    async fn analyze(&self, redacted_text: &str) -> Result<Analysis, PipelineError> {
        let text = redacted_text.to_lowercase();
        if text.contains("explode") {
            return Err(PipelineError::AnalysisUnavailable("engine down".into()));
        }
        let (intent, sentiment) = if text.contains("refund") {
            (Intent::Request, Sentiment::Neutral)
        } else if text.contains("complain") {
            (Intent::Complaint, Sentiment::Negative)
        } else {
            (Intent::GeneralEnquiry, Sentiment::Neutral)
        };
        Ok(Analysis {
            intent,
            sentiment,
            summary: "stub".into(),
            confidence: Confidence::High,
        })
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    processor: RecordProcessor,
}

impl TestServer {
    async fn start() -> Self {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let review = Arc::new(ReviewService::new(Arc::clone(&db), None));
        let app = api_routes(AppState {
            db: Arc::clone(&db),
            review,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let processor = RecordProcessor::new(
            db,
            Arc::new(PatternRedactor::new()),
            Arc::new(KeywordAnalyzer),
            Arc::new(TriagePolicy::default()),
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        );

        Self {
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            processor,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn inject(&self, external_id: &str, body: &str) -> String {
        let (status, created) = self
            .post(
                "/api/ingest",
                json!({
                    "external_id": external_id,
                    "sender": "jane@customers.test",
                    "subject": "Question",
                    "body": body,
                }),
            )
            .await;
        assert_eq!(status, 201, "ingest failed: {created}");
        created["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn injected_mail_is_triaged_and_queryable() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        let enquiry = server.inject("e1", "What are your office hours?").await;
        let refund = server.inject("e2", "I would like a refund please").await;
        let complaint = server.inject("e3", "I want to complain about the service").await;

        let (_, pending) = server.get("/api/items?status=PENDING").await;
        assert_eq!(pending.as_array().unwrap().len(), 3);

        assert_eq!(drain(&server.processor).await, 3);

        let (status, item) = server.get(&format!("/api/items/{enquiry}")).await;
        assert_eq!(status, 200);
        assert_eq!(item["status"], "COMPLETED");
        assert_eq!(item["priority"], "LOW");
        assert_eq!(item["reply_status"], "PENDING_REVIEW");
        assert_eq!(item["reply_audit_reason"], "Layer 4: pattern matched, no blocks");
        assert_ne!(item["generated_reply"], "NO_REPLY");

        let (_, item) = server.get(&format!("/api/items/{refund}")).await;
        assert_eq!(item["priority"], "HIGH");
        assert_eq!(item["generated_reply"], "NO_REPLY");

        let (_, item) = server.get(&format!("/api/items/{complaint}")).await;
        assert_eq!(item["priority"], "HIGH");
        assert_eq!(item["generated_reply"], "NO_REPLY");
        assert!(item["reply_audit_reason"].as_str().unwrap().starts_with("Layer 1"));

        let (_, high) = server.get("/api/items?priority=HIGH").await;
        assert_eq!(high.as_array().unwrap().len(), 2);

        let (_, stats) = server.get("/api/stats").await;
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["completed"], 3);
        assert_eq!(stats["no_reply"], 2);
        assert_eq!(stats["high_priority"], 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn approve_then_second_action_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        let id = server.inject("e1", "What are your office hours?").await;
        drain(&server.processor).await;

        let (status, item) = server
            .post(
                &format!("/api/items/{id}/reply"),
                json!({"action": "approve_send", "edited_body": "We are open 9 to 5."}),
            )
            .await;
        assert_eq!(status, 200);
        assert_eq!(item["reply_status"], "SENT");
        assert_eq!(item["final_reply"], "We are open 9 to 5.");

        let (status, err) = server
            .post(&format!("/api/items/{id}/reply"), json!({"action": "reject"}))
            .await;
        assert_eq!(status, 409);
        assert!(err["error"].as_str().unwrap().contains("SENT"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn no_reply_item_can_only_be_rejected() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        let id = server.inject("e1", "I would like a refund please").await;
        drain(&server.processor).await;

        let (status, _) = server
            .post(&format!("/api/items/{id}/reply"), json!({"action": "approve_send"}))
            .await;
        assert_eq!(status, 409);

        let (status, item) = server
            .post(&format!("/api/items/{id}/reply"), json!({"action": "reject"}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(item["reply_status"], "REJECTED");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reply_action_on_unprocessed_item_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        let id = server.inject("e1", "What are your office hours?").await;

        let (status, err) = server
            .post(&format!("/api/items/{id}/reply"), json!({"action": "reject"}))
            .await;
        assert_eq!(status, 409);
        assert!(err["error"].as_str().unwrap().contains("PENDING"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_analysis_stays_visible_with_error() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        let id = server.inject("e1", "this will explode").await;
        drain(&server.processor).await;

        let (_, item) = server.get(&format!("/api/items/{id}")).await;
        assert_eq!(item["status"], "FAILED");
        assert!(item["error"].as_str().unwrap().contains("engine down"));
        assert!(item["generated_reply"].is_null());
        assert!(item["analysis"].is_null());

        let (_, stats) = server.get("/api/stats").await;
        assert_eq!(stats["failed"], 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bulk_ingest_reports_duplicates() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        server.inject("dup", "What are your office hours?").await;

        let (status, report) = server
            .post(
                "/api/ingest/bulk",
                json!([
                    {"external_id": "dup", "sender": "a@b.test", "body": "again"},
                    {"sender": "a@b.test", "body": "one"},
                    {"sender": "a@b.test", "body": "two"},
                ]),
            )
            .await;
        assert_eq!(status, 201);
        assert_eq!(report["inserted"], 2);
        assert_eq!(report["duplicates"], 1);

        let (_, all) = server.get("/api/items").await;
        let all = all.as_array().unwrap();
        assert_eq!(all.len(), 3);
        assert!(
            all.iter()
                .filter(|i| i["external_id"] != "dup")
                .all(|i| i["external_id"].as_str().unwrap().starts_with("manual-"))
        );

        let (status, _) = server.post("/api/ingest/bulk", json!([])).await;
        assert_eq!(status, 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn list_is_paginated_newest_first() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        for i in 0..5 {
            server.inject(&format!("e{i}"), "What are your office hours?").await;
        }

        let (_, page) = server.get("/api/items?limit=2&offset=0").await;
        let page = page.as_array().unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["external_id"], "e4");
        assert_eq!(page[1]["external_id"], "e3");

        let (_, last) = server.get("/api/items?limit=2&offset=4").await;
        let last = last.as_array().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0]["external_id"], "e0");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn export_contains_redacted_body_only() {
    timeout(TEST_TIMEOUT, async {
        let server = TestServer::start().await;
        server
            .inject("e1", "Office hours? Reply to jane.doe@customers.test")
            .await;
        drain(&server.processor).await;

        let resp = server
            .client
            .get(format!("{}/api/export", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(
            resp.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/csv")
        );

        let csv = resp.text().await.unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("id,sender,subject"));
        let row = lines.next().unwrap();
        assert!(row.contains("[REDACTED]"));
        assert!(!row.contains("jane.doe@customers.test"));
    })
    .await
    .expect("test timed out");
}
