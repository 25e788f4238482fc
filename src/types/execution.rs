//! Workflow execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::mail::ThreadDetail;
use super::workflow::TriggerKind;
use crate::error::{FlowError, Result};

/// Execution status; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(FlowError::Parse(format!("unknown execution status '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `running -> running` is allowed so a redelivered job can resume.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Completed | Failed) | (Running, Running | Completed | Failed)
        )
    }
}

/// Snapshot of the event that started an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerData {
    pub kind: TriggerKind,
    pub connection_id: String,
    pub thread_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    /// Labels on the thread when the event was observed
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub added_labels: Vec<String>,
    #[serde(default)]
    pub removed_labels: Vec<String>,
    /// Occurrence of the schedule that fired a `schedule` trigger
    #[serde(default)]
    pub tick: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerData {
    pub fn from_thread(kind: TriggerKind, connection_id: &str, thread: &ThreadDetail) -> Self {
        let latest = thread.latest_message();
        Self {
            kind,
            connection_id: connection_id.to_string(),
            thread_id: thread.id.clone(),
            message_id: latest.map(|m| m.id.clone()),
            history_id: thread.history_id.clone(),
            sender: latest.map(|m| m.from.clone()),
            subject: latest.map(|m| m.subject.clone()),
            snippet: latest.map(|m| m.snippet()),
            labels: thread.labels.clone(),
            added_labels: Vec::new(),
            removed_labels: Vec::new(),
            tick: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_tick(mut self, tick: impl Into<String>) -> Self {
        self.tick = Some(tick.into());
        self
    }

    pub fn with_label_changes(mut self, added: Vec<String>, removed: Vec<String>) -> Self {
        self.added_labels = added;
        self.removed_labels = removed;
        self
    }

    /// Identifies the underlying event. Two deliveries of the same event
    /// produce the same key.
    pub fn event_key(&self) -> String {
        let anchor = self
            .history_id
            .as_deref()
            .or(self.message_id.as_deref())
            .unwrap_or("-");
        match self.kind {
            TriggerKind::EmailLabeled => {
                let mut added = self.added_labels.clone();
                added.sort();
                format!("{}:{}:{}", self.kind.as_str(), anchor, added.join(","))
            }
            TriggerKind::Schedule => format!(
                "{}:{}:{}",
                self.kind.as_str(),
                self.tick.as_deref().unwrap_or("-"),
                self.message_id.as_deref().unwrap_or("-")
            ),
            _ => format!(
                "{}:{}:{}",
                self.kind.as_str(),
                self.message_id.as_deref().unwrap_or("-"),
                anchor
            ),
        }
    }
}

/// Outcome of evaluating one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionResult {
    pub executed: bool,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecutionResult {
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn passed(output_index: usize) -> Self {
        Self {
            executed: true,
            passed: true,
            output_index: Some(output_index),
            ..Default::default()
        }
    }

    pub fn rejected() -> Self {
        Self {
            executed: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            executed: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub type NodeResults = BTreeMap<String, NodeExecutionResult>;

/// Persisted record of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub thread_id: String,
    pub connection_id: String,
    pub status: ExecutionStatus,
    pub trigger_data: TriggerData,
    #[serde(default)]
    pub node_results: NodeResults,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Apply a patch, refusing backward or post-terminal transitions.
    pub fn apply(&mut self, patch: ExecutionPatch) -> Result<()> {
        if let Some(next) = patch.status {
            if !self.status.can_transition_to(next) {
                return Err(FlowError::InvalidTransition(format!(
                    "execution {}: {} -> {}",
                    self.id,
                    self.status.as_str(),
                    next.as_str()
                )));
            }
            self.status = next;
        } else if self.status.is_terminal() {
            return Err(FlowError::InvalidTransition(format!(
                "execution {} is {}",
                self.id,
                self.status.as_str()
            )));
        }

        if let Some(results) = patch.node_results {
            self.node_results = results;
        }
        if patch.error.is_some() {
            self.error = patch.error;
        }
        if patch.completed_at.is_some() {
            self.completed_at = patch.completed_at;
        }
        Ok(())
    }
}

/// Fields needed to create an execution record
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub thread_id: String,
    pub connection_id: String,
    pub trigger_data: TriggerData,
}

impl NewExecution {
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.workflow_id,
            self.thread_id,
            self.trigger_data.event_key()
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub node_results: Option<NodeResults>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPatch {
    pub fn running() -> Self {
        Self {
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        }
    }

    pub fn finished(status: ExecutionStatus, results: NodeResults, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            node_results: Some(results),
            error,
            completed_at: Some(Utc::now()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(ExecutionStatus::Failed),
            error: Some(error.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}
