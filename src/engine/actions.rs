//! Action nodes
//!
//! Thread-mutating actions go through the mail driver, then mirror the
//! change into the stored thread and drop the connection's cached listings.

use serde_json::Value;
use tracing::{debug, info};

use crate::backend::{MailDriver, Notification, SkillInvocation};
use crate::error::Result;
use crate::state::JobContext;
use crate::sync::threads;
use crate::types::mail::{INBOX, UNREAD};
use crate::types::{ActionNode, DraftRequest, LabelModification, ThreadDetail, Workflow};

/// Where an action runs
pub struct ActionTarget<'a> {
    pub workflow: &'a Workflow,
    pub connection_id: &'a str,
    pub thread: &'a ThreadDetail,
}

fn reply_subject(subject: &str) -> String {
    if subject.to_ascii_lowercase().starts_with("re:") {
        subject.to_string()
    } else if subject.is_empty() {
        "Re: (no subject)".to_string()
    } else {
        format!("Re: {}", subject)
    }
}

async fn modify(
    ctx: &JobContext,
    driver: &dyn MailDriver,
    target: &ActionTarget<'_>,
    change: LabelModification,
) -> Result<Value> {
    driver
        .modify_labels(&[target.thread.id.clone()], &change)
        .await?;
    threads::record_labels(ctx.kv.as_ref(), target.connection_id, &target.thread.id, &change).await?;
    let dropped = ctx.cache.invalidate(target.connection_id).await;
    debug!(thread_id = %target.thread.id, dropped, "Labels modified, cache invalidated");
    Ok(serde_json::to_value(&change)?)
}

/// Run one action. The returned value is informational only.
pub async fn run_action(
    ctx: &JobContext,
    driver: &dyn MailDriver,
    action: &ActionNode,
    target: &ActionTarget<'_>,
) -> Result<Value> {
    match action {
        ActionNode::Archive(_) => modify(ctx, driver, target, LabelModification::remove(INBOX)).await,
        ActionNode::MarkRead(_) => modify(ctx, driver, target, LabelModification::remove(UNREAD)).await,
        ActionNode::MarkUnread(_) => modify(ctx, driver, target, LabelModification::add(UNREAD)).await,
        ActionNode::AddLabel(params) => {
            modify(ctx, driver, target, LabelModification::add(params.label.trim())).await
        }
        ActionNode::RemoveLabel(params) => {
            modify(ctx, driver, target, LabelModification::remove(params.label.trim())).await
        }
        ActionNode::CreateDraft(params) => {
            let to = match &params.to {
                Some(to) if !to.trim().is_empty() => vec![to.trim().to_string()],
                _ => target
                    .thread
                    .latest_message()
                    .map(|m| vec![m.sender_address()])
                    .unwrap_or_default(),
            };
            let draft = DraftRequest {
                thread_id: Some(target.thread.id.clone()),
                to,
                subject: params
                    .subject
                    .clone()
                    .unwrap_or_else(|| reply_subject(target.thread.subject())),
                body: params.body.clone().unwrap_or_default(),
            };
            let created = driver.create_draft(&draft).await?;
            info!(thread_id = %target.thread.id, draft_id = %created.id, "Draft created");
            Ok(serde_json::json!({ "draftId": created.id }))
        }
        ActionNode::SendNotification(params) => {
            let notification = Notification {
                user_id: target.workflow.user_id.clone(),
                connection_id: target.connection_id.to_string(),
                workflow_id: target.workflow.id.clone(),
                thread_id: target.thread.id.clone(),
                title: params
                    .title
                    .clone()
                    .unwrap_or_else(|| target.workflow.name.clone()),
                message: params.message.clone(),
            };
            ctx.notifier.notify(&notification).await?;
            Ok(Value::Null)
        }
        ActionNode::RunSkill(params) => {
            let invocation = SkillInvocation {
                skill_id: params.skill_id.clone(),
                user_id: target.workflow.user_id.clone(),
                connection_id: target.connection_id.to_string(),
                thread_id: target.thread.id.clone(),
                input: params.input.clone(),
            };
            ctx.skills.run(&invocation).await
        }
    }
}
