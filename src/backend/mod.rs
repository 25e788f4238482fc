//! Contracts for the outside world
//!
//! The engine never talks to a mail provider, LLM or notification channel
//! directly. It goes through these traits so the concrete clients can live
//! elsewhere and tests can substitute in-memory fakes.

pub mod classifier;
pub mod notify;
pub mod skills;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{FlowError, Result};
use crate::types::{
    Connection, DraftRef, DraftRequest, HistoryPage, LabelModification, ListQuery, OutgoingEmail,
    SentMessage, ThreadDetail, ThreadList, WatchResponse,
};

pub use classifier::{Classification, ClassificationRequest, Classifier, UnavailableClassifier};
pub use notify::{LogNotifier, Notification, Notifier, WebhookNotifier};
pub use skills::{NoSkills, SkillInvocation, SkillRunner};

/// Mailbox operations for one connection
#[async_trait]
pub trait MailDriver: Send + Sync {
    async fn list(&self, query: &ListQuery) -> Result<ThreadList>;

    async fn get(&self, thread_id: &str) -> Result<ThreadDetail>;

    /// Change log since `cursor`. A cursor the provider no longer knows
    /// yields `FlowError::HistoryExpired`.
    async fn list_history(&self, cursor: &str) -> Result<HistoryPage>;

    async fn modify_labels(&self, thread_ids: &[String], change: &LabelModification) -> Result<()>;

    async fn create_draft(&self, draft: &DraftRequest) -> Result<DraftRef>;

    async fn send(&self, email: &OutgoingEmail) -> Result<SentMessage>;

    /// (Re)register push notifications for the mailbox
    async fn watch(&self) -> Result<WatchResponse>;
}

/// Hands out a driver for a connection
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn driver(&self, connection: &Connection) -> Result<Arc<dyn MailDriver>>;
}

/// Provider used when no concrete mail client is wired in. Every request
/// fails as a configuration error so jobs do not burn retries.
pub struct UnconfiguredProvider;

#[async_trait]
impl MailProvider for UnconfiguredProvider {
    async fn driver(&self, connection: &Connection) -> Result<Arc<dyn MailDriver>> {
        Err(FlowError::Config(format!(
            "No mail driver available for provider '{}' (connection {})",
            connection.provider, connection.id
        )))
    }
}
