use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::pipeline::types::Priority;
use crate::review::ReplyAction;
use crate::store::{InsertOutcome, ListQuery, NewWorkItem, WorkItem, WorkStatus};

const MAX_PAGE: usize = 500;
const MAX_BULK: usize = 1000;

// ── Health ──────────────────────────────────────────────────────────────

pub(super) async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "inbox-triage",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Queries ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct ListParams {
    status: Option<String>,
    priority: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub(super) async fn list_items(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<WorkItem>>, ApiError> {
    let query = ListQuery {
        status: params
            .status
            .as_deref()
            .map(str::parse::<WorkStatus>)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        priority: params
            .priority
            .as_deref()
            .map(str::parse::<Priority>)
            .transpose()
            .map_err(ApiError::BadRequest)?,
        limit: params.limit.unwrap_or(50).clamp(1, MAX_PAGE),
        offset: params.offset.unwrap_or(0),
    };

    Ok(Json(state.db.list_items(&query).await?))
}

pub(super) async fn get_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WorkItem>, ApiError> {
    let id = parse_id(&id)?;
    state
        .db
        .get_item(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Work item {id} not found")))
}

pub(super) async fn stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.stats().await?))
}

// ── Reply actions ───────────────────────────────────────────────────────

/// Body of `POST /api/items/{id}/reply`.
#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    pub action: ReplyAction,
    #[serde(default)]
    pub edited_body: Option<String>,
}

pub(super) async fn submit_reply(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReplyRequest>,
) -> Result<Json<WorkItem>, ApiError> {
    let id = parse_id(&id)?;
    let item = state
        .review
        .submit_reply_action(id, body.action, body.edited_body.as_deref())
        .await?;
    Ok(Json(item))
}

// ── Manual injection ────────────────────────────────────────────────────

/// A synthetic message. Enters the queue at PENDING like ingested mail.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    /// Defaults to `manual-<uuid>`.
    #[serde(default)]
    pub external_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    /// Defaults to now.
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl IngestRequest {
    fn into_new_item(self) -> Result<NewWorkItem, ApiError> {
        if self.sender.trim().is_empty() {
            return Err(ApiError::BadRequest("sender is required".into()));
        }
        let external_id = match self.external_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ApiError::BadRequest("external_id must not be empty".into()));
            }
            Some(id) => id,
            None => format!("manual-{}", Uuid::new_v4()),
        };
        Ok(NewWorkItem {
            external_id,
            sender: self.sender,
            subject: self.subject,
            body: self.body,
            received_at: self.received_at.unwrap_or_else(Utc::now),
        })
    }
}

pub(super) async fn ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = body.into_new_item()?;
    match state.db.insert_item(&item).await? {
        InsertOutcome::Inserted(id) => {
            info!(id = %id, external_id = %item.external_id, "Manual item injected");
            Ok((
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "id": id,
                    "external_id": item.external_id,
                    "status": WorkStatus::Pending,
                })),
            ))
        }
        InsertOutcome::Duplicate => Err(ApiError::Conflict(format!(
            "external_id '{}' already ingested",
            item.external_id
        ))),
    }
}

pub(super) async fn ingest_bulk(
    State(state): State<AppState>,
    Json(body): Json<Vec<IngestRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty batch".into()));
    }
    if body.len() > MAX_BULK {
        return Err(ApiError::BadRequest(format!(
            "batch of {} exceeds the limit of {MAX_BULK}",
            body.len()
        )));
    }

    let items = body
        .into_iter()
        .map(IngestRequest::into_new_item)
        .collect::<Result<Vec<_>, _>>()?;
    let outcomes = state.db.insert_items(&items).await?;

    let ids: Vec<Uuid> = outcomes
        .iter()
        .filter_map(|o| match o {
            InsertOutcome::Inserted(id) => Some(*id),
            InsertOutcome::Duplicate => None,
        })
        .collect();
    let duplicates = outcomes.len() - ids.len();
    info!(inserted = ids.len(), duplicates, "Manual batch injected");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "inserted": ids.len(),
            "duplicates": duplicates,
            "ids": ids,
        })),
    ))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid work item id '{raw}'")))
}
