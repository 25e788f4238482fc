use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillInvocation {
    pub skill_id: String,
    pub user_id: String,
    pub connection_id: String,
    pub thread_id: String,
    pub input: Value,
}

/// Runs user-installed skills from `run_skill` actions
#[async_trait]
pub trait SkillRunner: Send + Sync {
    async fn run(&self, invocation: &SkillInvocation) -> Result<Value>;
}

/// No skills installed
pub struct NoSkills;

#[async_trait]
impl SkillRunner for NoSkills {
    async fn run(&self, invocation: &SkillInvocation) -> Result<Value> {
        Err(FlowError::InvalidInput(format!(
            "Skill '{}' is not installed",
            invocation.skill_id
        )))
    }
}
