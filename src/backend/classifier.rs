use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Input for an `ai_classification` node
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRequest {
    pub categories: Vec<String>,
    pub instructions: Option<String>,
    pub from: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// One of the requested categories, or anything else for "other"
    pub category: String,
    pub reasoning: Option<String>,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Classification>;
}

/// Stand-in when no model is configured
pub struct UnavailableClassifier;

#[async_trait]
impl Classifier for UnavailableClassifier {
    async fn classify(&self, _request: &ClassificationRequest) -> Result<Classification> {
        Err(FlowError::Config(
            "No classifier configured; add an [ollama] section".into(),
        ))
    }
}
