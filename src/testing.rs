//! In-memory collaborators for tests

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::sqlite::pool;
use crate::backend::{
    Classification, ClassificationRequest, Classifier, MailDriver, MailProvider, Notification,
    Notifier, SkillInvocation, SkillRunner,
};
use crate::config::AppConfig;
use crate::error::{FlowError, Result};
use crate::state::JobContext;
use crate::types::mail::{HistoryLabelChange, HistoryMessage};
use crate::types::workflow::{NoParams, ScheduleParams};
use crate::types::{
    ActionNode, Connection, DraftRef, DraftRequest, HistoryPage, HistoryRecord, LabelModification,
    ListQuery, MailMessage, NodeKind, OutgoingEmail, SentMessage, ThreadDetail, ThreadList,
    ThreadSummary, TriggerNode, WatchResponse, Workflow, WorkflowConnections, WorkflowNode,
};

pub const USER: &str = "u1";
pub const CONNECTION: &str = "c1";
pub const EMAIL: &str = "me@example.com";

pub fn thread(id: &str, history_id: u64, from: &str, subject: &str, labels: &[&str]) -> ThreadDetail {
    ThreadDetail {
        id: id.to_string(),
        history_id: Some(history_id.to_string()),
        messages: vec![MailMessage {
            id: format!("{}-m1", id),
            thread_id: id.to_string(),
            from: from.to_string(),
            to: vec![EMAIL.to_string()],
            subject: subject.to_string(),
            body: format!("Body of {}", subject),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            received_at: Some(Utc::now()),
        }],
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

#[derive(Default)]
pub struct Mailbox {
    /// Oldest first
    pub threads: Vec<ThreadDetail>,
    pub history: Vec<HistoryRecord>,
    pub history_id: u64,
    pub history_expired: bool,
    pub failing_threads: HashSet<String>,
    pub history_calls: usize,
    pub get_calls: usize,
    pub modifications: Vec<(Vec<String>, LabelModification)>,
    pub drafts: Vec<DraftRequest>,
    pub sent: Vec<OutgoingEmail>,
    pub watch_calls: usize,
}

#[derive(Default)]
pub struct FakeMailDriver {
    pub mailbox: Mutex<Mailbox>,
}

impl FakeMailDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Mailbox) -> R) -> R {
        f(&mut self.mailbox.lock().unwrap())
    }

    /// Store a thread without recording history.
    pub fn seed(&self, thread: ThreadDetail) {
        self.with(|mb| {
            if let Some(id) = thread.history_id.as_deref().and_then(|h| h.parse().ok()) {
                mb.history_id = mb.history_id.max(id);
            }
            mb.threads.retain(|t| t.id != thread.id);
            mb.threads.push(thread);
        });
    }

    /// Deliver a new thread and log it in the history.
    pub fn deliver(&self, thread: ThreadDetail) {
        self.with(|mb| {
            mb.history_id += 1;
            let mut thread = thread;
            thread.history_id = Some(mb.history_id.to_string());
            mb.history.push(HistoryRecord {
                id: mb.history_id.to_string(),
                messages_added: thread
                    .messages
                    .iter()
                    .map(|m| HistoryMessage {
                        message_id: m.id.clone(),
                        thread_id: thread.id.clone(),
                        label_ids: m.labels.clone(),
                    })
                    .collect(),
                ..Default::default()
            });
            mb.threads.retain(|t| t.id != thread.id);
            mb.threads.push(thread);
        });
    }

    /// Change labels out-of-band and log it in the history.
    pub fn relabel(&self, thread_id: &str, add: &[&str], remove: &[&str]) {
        self.with(|mb| {
            mb.history_id += 1;
            let message_id = format!("{}-m1", thread_id);
            let change = |labels: &[&str]| {
                vec![HistoryLabelChange {
                    message_id: message_id.clone(),
                    thread_id: thread_id.to_string(),
                    label_ids: labels.iter().map(|l| l.to_string()).collect(),
                }]
            };
            mb.history.push(HistoryRecord {
                id: mb.history_id.to_string(),
                messages_added: Vec::new(),
                labels_added: if add.is_empty() { Vec::new() } else { change(add) },
                labels_removed: if remove.is_empty() { Vec::new() } else { change(remove) },
            });
            if let Some(thread) = mb.threads.iter_mut().find(|t| t.id == thread_id) {
                for label in add {
                    if !thread.has_label(label) {
                        thread.labels.push(label.to_string());
                    }
                }
                thread.labels.retain(|l| !remove.contains(&l.as_str()));
            }
        });
    }
}

#[async_trait]
impl MailDriver for FakeMailDriver {
    async fn list(&self, query: &ListQuery) -> Result<ThreadList> {
        self.with(|mb| {
            let matching: Vec<&ThreadDetail> = mb
                .threads
                .iter()
                .rev()
                .filter(|t| t.has_label(&query.folder))
                .collect();
            let start: usize = query
                .page_token
                .as_deref()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            let size = query.max_results.unwrap_or(100) as usize;
            let end = (start + size).min(matching.len());
            let threads = matching[start.min(end)..end]
                .iter()
                .map(|t| ThreadSummary {
                    id: t.id.clone(),
                    history_id: t.history_id.clone(),
                })
                .collect();
            Ok(ThreadList {
                threads,
                next_page_token: (end < matching.len()).then(|| end.to_string()),
            })
        })
    }

    async fn get(&self, thread_id: &str) -> Result<ThreadDetail> {
        self.with(|mb| {
            mb.get_calls += 1;
            if mb.failing_threads.contains(thread_id) {
                return Err(FlowError::Provider(format!("fetch of {} failed", thread_id)));
            }
            mb.threads
                .iter()
                .find(|t| t.id == thread_id)
                .cloned()
                .ok_or_else(|| FlowError::Provider(format!("thread {} not found", thread_id)))
        })
    }

    async fn list_history(&self, cursor: &str) -> Result<HistoryPage> {
        // Give a concurrent caller the chance to interleave
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        self.with(|mb| {
            mb.history_calls += 1;
            if mb.history_expired {
                return Err(FlowError::HistoryExpired(format!("cursor {} too old", cursor)));
            }
            let cursor: u64 = cursor.parse().unwrap_or(0);
            Ok(HistoryPage {
                history: mb
                    .history
                    .iter()
                    .filter(|r| r.id.parse::<u64>().unwrap_or(0) > cursor)
                    .cloned()
                    .collect(),
                history_id: mb.history_id.to_string(),
            })
        })
    }

    async fn modify_labels(&self, thread_ids: &[String], change: &LabelModification) -> Result<()> {
        self.with(|mb| {
            mb.modifications.push((thread_ids.to_vec(), change.clone()));
            for thread in mb.threads.iter_mut().filter(|t| thread_ids.contains(&t.id)) {
                thread
                    .labels
                    .retain(|l| !change.remove_labels.iter().any(|r| r.eq_ignore_ascii_case(l)));
                for label in &change.add_labels {
                    if !thread.has_label(label) {
                        thread.labels.push(label.clone());
                    }
                }
            }
            Ok(())
        })
    }

    async fn create_draft(&self, draft: &DraftRequest) -> Result<DraftRef> {
        self.with(|mb| {
            mb.drafts.push(draft.clone());
            Ok(DraftRef {
                id: format!("draft-{}", mb.drafts.len()),
            })
        })
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<SentMessage> {
        self.with(|mb| {
            mb.sent.push(email.clone());
            Ok(SentMessage {
                id: format!("sent-{}", mb.sent.len()),
            })
        })
    }

    async fn watch(&self) -> Result<WatchResponse> {
        self.with(|mb| {
            mb.watch_calls += 1;
            Ok(WatchResponse {
                history_id: mb.history_id.to_string(),
                expiration: Utc::now() + chrono::Duration::days(7),
            })
        })
    }
}

pub struct FakeProvider {
    pub driver: Arc<FakeMailDriver>,
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn driver(&self, _connection: &Connection) -> Result<Arc<dyn MailDriver>> {
        Ok(self.driver.clone())
    }
}

/// Answers every request with the same category.
pub struct StaticClassifier {
    pub answer: std::result::Result<String, String>,
    pub requests: Mutex<Vec<ClassificationRequest>>,
}

impl StaticClassifier {
    pub fn answering(category: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Ok(category.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Err(error.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Classifier for StaticClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification> {
        self.requests.lock().unwrap().push(request.clone());
        match &self.answer {
            Ok(category) => Ok(Classification {
                category: category.clone(),
                reasoning: Some(format!("looks like {}", category)),
            }),
            Err(e) => Err(FlowError::Network(e.clone())),
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSkills {
    pub runs: Mutex<Vec<SkillInvocation>>,
}

#[async_trait]
impl SkillRunner for RecordingSkills {
    async fn run(&self, invocation: &SkillInvocation) -> Result<Value> {
        self.runs.lock().unwrap().push(invocation.clone());
        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Context over an in-memory database with `driver` behind every connection.
pub fn context(driver: Arc<FakeMailDriver>) -> JobContext {
    JobContext::new(AppConfig::default(), pool::in_memory().expect("pool"))
        .expect("context")
        .with_mail_provider(Arc::new(FakeProvider { driver }))
        .with_classifier(StaticClassifier::answering("other"))
        .with_notifier(Arc::new(RecordingNotifier::default()))
        .with_skills(Arc::new(RecordingSkills::default()))
}

pub async fn seed_connection(ctx: &JobContext) -> Connection {
    let connection = Connection::new(CONNECTION, USER, EMAIL);
    ctx.connections
        .save_connection(&connection)
        .await
        .expect("save connection");
    connection
}

/// Schedule-triggered workflow that archives every thread it is run on.
pub fn scheduled_workflow(id: &str, cron: &str) -> Workflow {
    let mut connections = WorkflowConnections::default();
    connections.connect("trigger", 0, "archive");
    Workflow {
        id: id.into(),
        user_id: USER.into(),
        connection_id: None,
        name: id.into(),
        nodes: vec![
            WorkflowNode::new(
                "trigger",
                "On schedule",
                NodeKind::Trigger(TriggerNode::Schedule(ScheduleParams {
                    cron: Some(cron.into()),
                    ..Default::default()
                })),
            ),
            WorkflowNode::new(
                "archive",
                "Archive",
                NodeKind::Action(ActionNode::Archive(NoParams {})),
            ),
        ],
        connections,
        is_enabled: true,
    }
}
