use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use super::{ApiError, AppState};
use crate::store::WorkItem;

const COLUMNS: [&str; 14] = [
    "id",
    "sender",
    "subject",
    "received_at",
    "status",
    "intent",
    "sentiment",
    "confidence",
    "priority",
    "priority_reason",
    "reply_status",
    "reply_audit_reason",
    "error",
    "redacted_body",
];

pub(super) async fn export_csv(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let items = state.db.all_items().await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"inbox-triage.csv\"",
            ),
        ],
        items_to_csv(&items),
    ))
}

/// Render items as RFC 4180 CSV, oldest received first. The raw body is
/// never exported, only its redacted form.
pub fn items_to_csv(items: &[WorkItem]) -> String {
    let mut out = COLUMNS.join(",");
    out.push_str("\r\n");

    for item in items {
        let analysis = item.analysis.as_ref();
        let row = [
            item.id.to_string(),
            item.sender.clone(),
            item.subject.clone(),
            item.received_at.to_rfc3339(),
            item.status.to_string(),
            analysis.map(|a| a.intent.to_string()).unwrap_or_default(),
            analysis.map(|a| a.sentiment.to_string()).unwrap_or_default(),
            analysis.map(|a| a.confidence.to_string()).unwrap_or_default(),
            item.priority.map(|p| p.to_string()).unwrap_or_default(),
            item.priority_reason.clone().unwrap_or_default(),
            item.reply_status.to_string(),
            item.reply_audit_reason.clone().unwrap_or_default(),
            item.error.clone().unwrap_or_default(),
            item.redacted_body.clone().unwrap_or_default(),
        ];
        let fields: Vec<String> = row.iter().map(|f| escape(f)).collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_only_when_needed() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn empty_export_has_header_only() {
        let csv = items_to_csv(&[]);
        assert_eq!(csv.lines().count(), 1);
        assert!(csv.starts_with("id,sender,subject"));
    }
}
