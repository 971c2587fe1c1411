//! Human reply actions on completed work items.
//!
//! Reply review only touches `reply_status`, `final_reply` and `send_error`,
//! none of which the workers write once an item is COMPLETED. The store's
//! guarded update makes concurrent approvals safe: exactly one wins, the
//! others see `AlreadyReviewed`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ReviewError;
use crate::pipeline::collaborators::ReplyDispatcher;
use crate::pipeline::gate::NO_REPLY;
use crate::store::{Database, ReplyStatus, WorkItem, WorkStatus};

/// Operator decision on a drafted reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyAction {
    ApproveSend,
    Reject,
}

/// Executes reply actions. Without a dispatcher an approval is recorded as
/// SENT and delivery is left to the operator's mail client.
pub struct ReviewService {
    db: Arc<dyn Database>,
    dispatcher: Option<Arc<dyn ReplyDispatcher>>,
}

impl ReviewService {
    pub fn new(db: Arc<dyn Database>, dispatcher: Option<Arc<dyn ReplyDispatcher>>) -> Self {
        Self { db, dispatcher }
    }

    /// Approve (optionally with an edited body) or reject a drafted reply.
    ///
    /// Returns the updated item. A rejected precondition leaves the item
    /// unchanged.
    pub async fn submit_reply_action(
        &self,
        id: Uuid,
        action: ReplyAction,
        edited_body: Option<&str>,
    ) -> Result<WorkItem, ReviewError> {
        let item = self.db.get_item(id).await?.ok_or(ReviewError::NotFound(id))?;
        check_reviewable(&item)?;

        match action {
            ReplyAction::Reject => {
                if !self
                    .db
                    .set_reply_status(id, ReplyStatus::Rejected, None)
                    .await?
                {
                    return Err(self.lost_race(id).await);
                }
                info!(id = %id, "Reply rejected");
            }
            ReplyAction::ApproveSend => {
                let body = approved_body(&item, edited_body)?;
                if !self
                    .db
                    .set_reply_status(id, ReplyStatus::Sent, Some(&body))
                    .await?
                {
                    return Err(self.lost_race(id).await);
                }
                self.dispatch(&item, &body).await?;
            }
        }

        self.db.get_item(id).await?.ok_or(ReviewError::NotFound(id))
    }

    async fn dispatch(&self, item: &WorkItem, body: &str) -> Result<(), ReviewError> {
        let Some(dispatcher) = &self.dispatcher else {
            info!(id = %item.id, "Reply approved, no dispatcher configured");
            return Ok(());
        };

        let subject = reply_subject(&item.subject);
        match dispatcher.send_reply(&item.sender, &subject, body).await {
            Ok(()) => {
                info!(id = %item.id, to = %item.sender, "Reply approved and sent");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.db.revert_reply_dispatch(item.id, &reason).await?;
                Err(ReviewError::DispatchFailed { id: item.id, reason })
            }
        }
    }

    /// Explain why a guarded update matched nothing.
    async fn lost_race(&self, id: Uuid) -> ReviewError {
        match self.db.get_item(id).await {
            Ok(Some(item)) => {
                warn!(id = %id, reply_status = %item.reply_status, "Concurrent reply action");
                check_reviewable(&item).err().unwrap_or(ReviewError::AlreadyReviewed {
                    id,
                    reply_status: item.reply_status.to_string(),
                })
            }
            Ok(None) => ReviewError::NotFound(id),
            Err(e) => ReviewError::Database(e),
        }
    }
}

fn check_reviewable(item: &WorkItem) -> Result<(), ReviewError> {
    if item.status != WorkStatus::Completed {
        return Err(ReviewError::NotCompleted {
            id: item.id,
            status: item.status.to_string(),
        });
    }
    if item.reply_status != ReplyStatus::PendingReview {
        return Err(ReviewError::AlreadyReviewed {
            id: item.id,
            reply_status: item.reply_status.to_string(),
        });
    }
    Ok(())
}

fn approved_body(item: &WorkItem, edited_body: Option<&str>) -> Result<String, ReviewError> {
    let draft = match item.generated_reply.as_deref() {
        Some(draft) if draft != NO_REPLY => draft,
        _ => return Err(ReviewError::NoDraft(item.id)),
    };
    match edited_body {
        Some(edit) if edit.trim().is_empty() => Err(ReviewError::EmptyEdit(item.id)),
        Some(edit) => Ok(edit.to_string()),
        None => Ok(draft.to_string()),
    }
}

/// "Re: " prefix, not doubled.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.get(..3).is_some_and(|p| p.eq_ignore_ascii_case("re:")) {
        trimmed.to_string()
    } else if trimmed.is_empty() {
        "Re: your message".to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
