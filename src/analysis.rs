//! Default analysis engine: Ollama-compatible `/api/generate` over HTTP.
//!
//! The model is asked for strict JSON with exactly four fields. The reply is
//! validated field by field: a missing field, an unknown sentiment or an
//! unknown confidence level is a `MalformedAnalysis`, never a default.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::collaborators::Analyzer;
use crate::pipeline::types::{Analysis, Confidence, Intent, Sentiment};

/// Default analysis server URL.
pub const DEFAULT_ANALYZER_URL: &str = "http://localhost:11434";

/// Default model.
pub const DEFAULT_ANALYZER_MODEL: &str = "llama3";

const SYSTEM_PROMPT: &str = r#"You analyze inbound customer email for an insurance operator.
The email has already been redacted. Reply with STRICT JSON and nothing else:

{
  "intent": one of GENERAL_ENQUIRY, REQUEST, DOCUMENT_SUBMISSION, APPRECIATION, COMPLAINT, CLAIM_RELATED, PAYMENT_ISSUE, SURRENDER, POLICY_STATUS, OTHER,
  "sentiment": one of POSITIVE, NEUTRAL, NEGATIVE,
  "summary": one sentence describing what the sender wants,
  "confidence": one of High, Medium, Low
}

Use Low confidence whenever the email is ambiguous."#;

/// Connection settings for the analysis server.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ANALYZER_URL.to_string(),
            model: DEFAULT_ANALYZER_MODEL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    format: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Model output before validation. Every field is optional here so a
/// missing one is reported by name.
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    intent: Option<String>,
    sentiment: Option<String>,
    summary: Option<String>,
    confidence: Option<String>,
}

/// HTTP analysis client.
pub struct HttpAnalyzer {
    client: reqwest::Client,
    config: AnalyzerConfig,
}

impl HttpAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::AnalysisUnavailable(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, redacted_text: &str) -> Result<Analysis, PipelineError> {
        let url = format!("{}/api/generate", self.config.url.trim_end_matches('/'));
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: redacted_text,
            system: SYSTEM_PROMPT,
            format: "json",
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };

        debug!(url = %url, model = %self.config.model, "Calling analysis engine");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::AnalysisTimeout(self.config.timeout)
                } else {
                    PipelineError::AnalysisUnavailable(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::AnalysisUnavailable(format!(
                "analysis engine returned {status}: {body}"
            )));
        }

        let generated: GenerateResponse = response.json().await.map_err(|e| {
            PipelineError::MalformedAnalysis(format!("unreadable response envelope: {e}"))
        })?;

        parse_analysis(&generated.response)
    }
}

/// Validate the model's JSON output.
pub fn parse_analysis(raw: &str) -> Result<Analysis, PipelineError> {
    let raw = strip_code_fence(raw.trim());
    let parsed: RawAnalysis = serde_json::from_str(raw)
        .map_err(|e| PipelineError::MalformedAnalysis(format!("not JSON: {e}")))?;

    let intent = required(parsed.intent, "intent")?;
    let sentiment: Sentiment = required(parsed.sentiment, "sentiment")?.parse()?;
    let summary = required(parsed.summary, "summary")?;
    let confidence: Confidence = required(parsed.confidence, "confidence")?.parse()?;

    Ok(Analysis {
        intent: Intent::parse(&intent),
        sentiment,
        summary,
        confidence,
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, PipelineError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(PipelineError::MalformedAnalysis(format!(
            "missing field '{field}'"
        ))),
    }
}

/// Some models wrap JSON in a markdown fence despite `format: json`.
fn strip_code_fence(raw: &str) -> &str {
    raw.strip_prefix("```json")
        .or_else(|| raw.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(raw)
}
