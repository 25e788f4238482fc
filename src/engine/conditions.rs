//! Condition predicates
//!
//! Each condition either passes on one output port or rejects. Only
//! `ai_classification` can pick a port other than 0.

use tracing::debug;

use super::wildcard::Wildcard;
use crate::backend::{ClassificationRequest, Classifier};
use crate::error::Result;
use crate::types::workflow::{
    ClassificationParams, KeywordMatchParams, KeywordScope, LabelMatchMode, LabelMatchParams,
};
use crate::types::{ConditionNode, NodeExecutionResult, ThreadDetail, TriggerData};

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    /// `None` when the condition rejected the thread
    pub port: Option<usize>,
    pub category: Option<String>,
    pub reasoning: Option<String>,
}

impl ConditionOutcome {
    fn from_bool(passed: bool) -> Self {
        Self {
            port: passed.then_some(0),
            category: None,
            reasoning: None,
        }
    }

    pub fn into_result(self) -> NodeExecutionResult {
        let mut result = match self.port {
            Some(port) => NodeExecutionResult::passed(port),
            None => NodeExecutionResult::rejected(),
        };
        result.category = self.category;
        result.reasoning = self.reasoning;
        result
    }
}

/// What a condition looks at: the synced thread, falling back to the
/// trigger snapshot when the thread has no messages.
pub struct Subject<'a> {
    pub thread: &'a ThreadDetail,
    pub trigger: &'a TriggerData,
}

impl Subject<'_> {
    fn senders(&self) -> Vec<String> {
        match self.thread.latest_message() {
            Some(message) => vec![message.sender_address(), message.from.clone()],
            None => self.trigger.sender.iter().cloned().collect(),
        }
    }

    fn subject(&self) -> &str {
        match self.thread.latest_message() {
            Some(_) => self.thread.subject(),
            None => self.trigger.subject.as_deref().unwrap_or(""),
        }
    }

    fn body(&self) -> &str {
        match self.thread.latest_message() {
            Some(_) => self.thread.body(),
            None => self.trigger.snippet.as_deref().unwrap_or(""),
        }
    }

    fn has_label(&self, label: &str) -> bool {
        if self.thread.labels.is_empty() {
            self.trigger.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
        } else {
            self.thread.has_label(label)
        }
    }
}

pub async fn evaluate(
    classifier: &dyn Classifier,
    condition: &ConditionNode,
    subject: &Subject<'_>,
) -> Result<ConditionOutcome> {
    match condition {
        ConditionNode::SenderMatch(params) => {
            let pattern = Wildcard::new(&params.pattern)?;
            let senders = subject.senders();
            Ok(ConditionOutcome::from_bool(
                senders.iter().any(|s| pattern.is_match(s)),
            ))
        }
        ConditionNode::SubjectMatch(params) => {
            let pattern = Wildcard::new(&params.pattern)?;
            Ok(ConditionOutcome::from_bool(pattern.is_match(subject.subject())))
        }
        ConditionNode::LabelMatch(params) => Ok(ConditionOutcome::from_bool(label_match(
            params, subject,
        ))),
        ConditionNode::KeywordMatch(params) => Ok(ConditionOutcome::from_bool(keyword_match(
            params, subject,
        ))),
        ConditionNode::AiClassification(params) => classify(classifier, params, subject).await,
    }
}

fn label_match(params: &LabelMatchParams, subject: &Subject<'_>) -> bool {
    match params.mode {
        LabelMatchMode::Any => params.labels.iter().any(|l| subject.has_label(l)),
        LabelMatchMode::All => params.labels.iter().all(|l| subject.has_label(l)),
    }
}

fn keyword_match(params: &KeywordMatchParams, subject: &Subject<'_>) -> bool {
    let haystack = match params.scope {
        KeywordScope::Subject => subject.subject().to_string(),
        KeywordScope::Body => subject.body().to_string(),
        KeywordScope::Both => format!("{}\n{}", subject.subject(), subject.body()),
    };
    let haystack = if params.case_sensitive {
        haystack
    } else {
        haystack.to_lowercase()
    };

    params
        .keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .any(|keyword| {
            if params.case_sensitive {
                haystack.contains(keyword)
            } else {
                haystack.contains(&keyword.to_lowercase())
            }
        })
}

async fn classify(
    classifier: &dyn Classifier,
    params: &ClassificationParams,
    subject: &Subject<'_>,
) -> Result<ConditionOutcome> {
    let request = ClassificationRequest {
        categories: params.categories.clone(),
        instructions: params.instructions.clone(),
        from: subject.senders().into_iter().next().unwrap_or_default(),
        subject: subject.subject().to_string(),
        body: subject.body().to_string(),
    };
    let answer = classifier.classify(&request).await?;
    let port = params.port_for(&answer.category);
    debug!(answer = %answer.category, port, "Classified thread");

    Ok(ConditionOutcome {
        port: Some(port),
        category: Some(params.port_name(port).to_string()),
        reasoning: answer.reasoning,
    })
}
