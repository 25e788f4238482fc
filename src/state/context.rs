//! Everything a job processor needs, owned in one place
//!
//! Built once at startup and shared behind an `Arc`. Collaborators are trait
//! objects so tests (and embedders) can swap them for their own.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::adapters::ollama::OllamaClassifier;
use crate::adapters::sqlite::{DbPool, SqliteStore};
use crate::backend::{
    Classifier, LogNotifier, MailDriver, MailProvider, NoSkills, Notifier, SkillRunner,
    UnavailableClassifier, UnconfiguredProvider, WebhookNotifier,
};
use crate::config::AppConfig;
use crate::error::{FlowError, Result};
use crate::queue::{DistributedLock, JobQueue, Scheduler};
use crate::store::{ConnectionStore, KeyValueStore, ScheduledEmailStore, WorkflowStore};
use crate::sync::cache::ThreadListCache;
use crate::types::Connection;

pub struct JobContext {
    pub config: AppConfig,
    pub kv: Arc<dyn KeyValueStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub connections: Arc<dyn ConnectionStore>,
    pub scheduled_emails: Arc<dyn ScheduledEmailStore>,
    pub mail: Arc<dyn MailProvider>,
    pub classifier: Arc<dyn Classifier>,
    pub notifier: Arc<dyn Notifier>,
    pub skills: Arc<dyn SkillRunner>,
    pub queue: JobQueue,
    pub scheduler: Scheduler,
    pub lock: DistributedLock,
    pub cache: ThreadListCache,
}

impl JobContext {
    /// Wire the SQLite-backed stores and the collaborators named in `config`.
    /// No mail provider is configured here; see `with_mail_provider`.
    pub fn new(config: AppConfig, pool: DbPool) -> Result<Self> {
        let store = SqliteStore::new(pool.clone());
        let queue = JobQueue::new(pool.clone(), config.queue.lock_duration());

        let classifier: Arc<dyn Classifier> = match &config.ollama {
            Some(ollama) => {
                info!("Using Ollama classifier ({} at {})", ollama.model, ollama.url);
                Arc::new(OllamaClassifier::new(ollama.clone())?)
            }
            None => Arc::new(UnavailableClassifier),
        };

        let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            kv: Arc::new(store.clone()),
            workflows: Arc::new(store.clone()),
            connections: Arc::new(store.clone()),
            scheduled_emails: Arc::new(store),
            mail: Arc::new(UnconfiguredProvider),
            classifier,
            notifier,
            skills: Arc::new(NoSkills),
            scheduler: Scheduler::new(pool.clone(), queue.clone()),
            queue,
            lock: DistributedLock::new(pool),
            cache: ThreadListCache::new(config.sync.cache_ttl()),
            config,
        })
    }

    pub fn with_mail_provider(mut self, mail: Arc<dyn MailProvider>) -> Self {
        self.mail = mail;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillRunner>) -> Self {
        self.skills = skills;
        self
    }

    /// Load a connection and check it belongs to `user_id`. Both failures
    /// are fatal for the job asking.
    pub async fn owned_connection(&self, user_id: &str, connection_id: &str) -> Result<Connection> {
        let connection = self.connection(connection_id).await?;
        if connection.user_id != user_id {
            return Err(FlowError::Ownership(format!(
                "connection {} does not belong to user {}",
                connection_id, user_id
            )));
        }
        Ok(connection)
    }

    pub async fn connection(&self, connection_id: &str) -> Result<Connection> {
        self.connections
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| FlowError::ConnectionNotFound(connection_id.to_string()))
    }

    pub async fn driver(&self, connection: &Connection) -> Result<Arc<dyn MailDriver>> {
        self.mail.driver(connection).await
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.sync.lock_ttl_secs)
    }
}
