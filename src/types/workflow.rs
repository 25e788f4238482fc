//! Workflow graph model
//!
//! Nodes arrive as `{id, type, nodeType, name, parameters, disabled}` and are
//! decoded once, at load time, into a closed set of node kinds with typed
//! parameters. Anything that does not fit is rejected as an invalid workflow
//! instead of being re-interpreted during execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{FlowError, Result};

/// Name of the implicit last output port of `ai_classification`.
pub const OTHER_CATEGORY: &str = "other";

/// A user-defined rule graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub connections: WorkflowConnections,
    #[serde(default)]
    pub is_enabled: bool,
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The first enabled trigger node. Execution always starts here.
    pub fn trigger_node(&self) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|n| !n.disabled && matches!(n.kind, NodeKind::Trigger(_)))
    }

    pub fn trigger(&self) -> Option<&TriggerNode> {
        self.trigger_node().and_then(|n| match &n.kind {
            NodeKind::Trigger(t) => Some(t),
            _ => None,
        })
    }

    /// Check structural invariants: unique ids, a trigger, well-formed edges
    /// and per-node parameter sanity.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(FlowError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            node.kind.validate().map_err(|e| {
                FlowError::InvalidWorkflow(format!("node '{}': {}", node.id, e))
            })?;
        }

        if !self
            .nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Trigger(_)))
        {
            return Err(FlowError::InvalidWorkflow(format!(
                "workflow '{}' has no trigger node",
                self.id
            )));
        }

        for (source_id, ports) in &self.connections.0 {
            let source = self.node(source_id).ok_or_else(|| {
                FlowError::InvalidWorkflow(format!("edge from unknown node '{}'", source_id))
            })?;
            let port_count = source.kind.output_ports();

            for (port, edges) in ports.iter().enumerate() {
                if edges.is_empty() {
                    continue;
                }
                if port >= port_count {
                    return Err(FlowError::InvalidWorkflow(format!(
                        "node '{}' has {} output port(s) but an edge leaves port {}",
                        source_id, port_count, port
                    )));
                }
                for edge in edges {
                    let target = self.node(&edge.target_node_id).ok_or_else(|| {
                        FlowError::InvalidWorkflow(format!(
                            "edge from '{}' targets unknown node '{}'",
                            source_id, edge.target_node_id
                        ))
                    })?;
                    if matches!(target.kind, NodeKind::Trigger(_)) {
                        return Err(FlowError::InvalidWorkflow(format!(
                            "edge from '{}' targets trigger node '{}'",
                            source_id, target.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Node class as stored in the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Trigger,
    Condition,
    Action,
}

/// A single node of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWorkflowNode", into = "RawWorkflowNode")]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    pub disabled: bool,
    pub kind: NodeKind,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            disabled: false,
            kind,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger(TriggerNode),
    Condition(ConditionNode),
    Action(ActionNode),
}

impl NodeKind {
    pub fn class(&self) -> NodeClass {
        match self {
            Self::Trigger(_) => NodeClass::Trigger,
            Self::Condition(_) => NodeClass::Condition,
            Self::Action(_) => NodeClass::Action,
        }
    }

    pub fn node_type(&self) -> &'static str {
        match self {
            Self::Trigger(t) => t.node_type(),
            Self::Condition(c) => c.node_type(),
            Self::Action(a) => a.node_type(),
        }
    }

    /// Number of output ports. Only `ai_classification` has more than one.
    pub fn output_ports(&self) -> usize {
        match self {
            Self::Condition(ConditionNode::AiClassification(params)) => {
                params.categories.len() + 1
            }
            _ => 1,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::Trigger(TriggerNode::Schedule(params)) => match params.cron.as_deref().map(str::trim) {
                None | Some("") => Err("schedule trigger needs a cron pattern".into()),
                Some(_) if params.max_threads == Some(0) => Err("maxThreads must be at least 1".into()),
                Some(_) => Ok(()),
            },
            Self::Trigger(_) => Ok(()),
            Self::Condition(c) => c.validate(),
            Self::Action(a) => a.validate(),
        }
    }
}

/// Kind of event that starts a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EmailReceived,
    EmailLabeled,
    Schedule,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmailReceived => "email_received",
            Self::EmailLabeled => "email_labeled",
            Self::Schedule => "schedule",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nodeType", content = "parameters", rename_all = "snake_case")]
pub enum TriggerNode {
    EmailReceived(EmailReceivedParams),
    EmailLabeled(EmailLabeledParams),
    Schedule(ScheduleParams),
}

impl TriggerNode {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::EmailReceived(_) => TriggerKind::EmailReceived,
            Self::EmailLabeled(_) => TriggerKind::EmailLabeled,
            Self::Schedule(_) => TriggerKind::Schedule,
        }
    }

    pub fn node_type(&self) -> &'static str {
        self.kind().as_str()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailReceivedParams {
    /// Folder (label) the thread must be in; `None` matches every folder.
    pub folder: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailLabeledParams {
    /// Labels whose addition fires the trigger; empty matches any label.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleParams {
    pub cron: Option<String>,
    pub timezone: Option<String>,
    /// Folder whose newest threads each run looks at; the sync default
    /// folder when unset.
    pub folder: Option<String>,
    pub max_threads: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nodeType", content = "parameters", rename_all = "snake_case")]
pub enum ConditionNode {
    SenderMatch(PatternParams),
    SubjectMatch(PatternParams),
    LabelMatch(LabelMatchParams),
    KeywordMatch(KeywordMatchParams),
    AiClassification(ClassificationParams),
}

impl ConditionNode {
    pub fn node_type(&self) -> &'static str {
        match self {
            Self::SenderMatch(_) => "sender_match",
            Self::SubjectMatch(_) => "subject_match",
            Self::LabelMatch(_) => "label_match",
            Self::KeywordMatch(_) => "keyword_match",
            Self::AiClassification(_) => "ai_classification",
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::SenderMatch(p) | Self::SubjectMatch(p) if p.pattern.trim().is_empty() => {
                Err("empty pattern".into())
            }
            Self::LabelMatch(p) if p.labels.is_empty() => Err("no labels configured".into()),
            Self::KeywordMatch(p) if p.keywords.iter().all(|k| k.trim().is_empty()) => {
                Err("no keywords configured".into())
            }
            Self::AiClassification(p) => {
                if p.categories.is_empty() {
                    return Err("no categories configured".into());
                }
                let mut seen = HashSet::new();
                for category in &p.categories {
                    if !seen.insert(category.to_lowercase()) {
                        return Err(format!("duplicate category '{}'", category));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternParams {
    /// Wildcard pattern, `*` matches any sequence
    pub pattern: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMatchMode {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelMatchParams {
    pub labels: Vec<String>,
    #[serde(default)]
    pub mode: LabelMatchMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordScope {
    Subject,
    Body,
    #[default]
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordMatchParams {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub scope: KeywordScope,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationParams {
    pub categories: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl ClassificationParams {
    /// Port index of the implicit "other" branch. Always the last port,
    /// even when a user category is itself called "other".
    pub fn other_port(&self) -> usize {
        self.categories.len()
    }

    /// Resolve a classifier answer to an output port. User categories win
    /// over the implicit "other" port; unknown answers fall back to it.
    pub fn port_for(&self, category: &str) -> usize {
        let wanted = category.trim();
        self.categories
            .iter()
            .position(|c| c.eq_ignore_ascii_case(wanted))
            .unwrap_or_else(|| self.other_port())
    }

    pub fn port_name(&self, port: usize) -> &str {
        self.categories
            .get(port)
            .map(String::as_str)
            .unwrap_or(OTHER_CATEGORY)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nodeType", content = "parameters", rename_all = "snake_case")]
pub enum ActionNode {
    Archive(NoParams),
    MarkRead(NoParams),
    MarkUnread(NoParams),
    AddLabel(LabelParams),
    RemoveLabel(LabelParams),
    CreateDraft(DraftParams),
    SendNotification(NotificationParams),
    RunSkill(SkillParams),
}

impl ActionNode {
    pub fn node_type(&self) -> &'static str {
        match self {
            Self::Archive(_) => "archive",
            Self::MarkRead(_) => "mark_read",
            Self::MarkUnread(_) => "mark_unread",
            Self::AddLabel(_) => "add_label",
            Self::RemoveLabel(_) => "remove_label",
            Self::CreateDraft(_) => "create_draft",
            Self::SendNotification(_) => "send_notification",
            Self::RunSkill(_) => "run_skill",
        }
    }

    /// Whether running this action changes thread state at the provider.
    pub fn mutates_thread(&self) -> bool {
        matches!(
            self,
            Self::Archive(_)
                | Self::MarkRead(_)
                | Self::MarkUnread(_)
                | Self::AddLabel(_)
                | Self::RemoveLabel(_)
        )
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Self::AddLabel(p) | Self::RemoveLabel(p) if p.label.trim().is_empty() => {
                Err("empty label".into())
            }
            Self::SendNotification(p) if p.message.trim().is_empty() => {
                Err("empty notification message".into())
            }
            Self::RunSkill(p) if p.skill_id.trim().is_empty() => Err("empty skill id".into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoParams {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelParams {
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftParams {
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationParams {
    #[serde(default)]
    pub title: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillParams {
    pub skill_id: String,
    #[serde(default)]
    pub input: Value,
}

/// Wire shape of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWorkflowNode {
    id: String,
    #[serde(rename = "type")]
    class: NodeClass,
    node_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    disabled: bool,
}

impl TryFrom<RawWorkflowNode> for WorkflowNode {
    type Error = FlowError;

    fn try_from(raw: RawWorkflowNode) -> Result<Self> {
        let parameters = if raw.parameters.is_null() {
            Value::Object(Default::default())
        } else {
            raw.parameters
        };
        let tagged = serde_json::json!({
            "nodeType": raw.node_type,
            "parameters": parameters,
        });

        let kind = match raw.class {
            NodeClass::Trigger => serde_json::from_value(tagged).map(NodeKind::Trigger),
            NodeClass::Condition => serde_json::from_value(tagged).map(NodeKind::Condition),
            NodeClass::Action => serde_json::from_value(tagged).map(NodeKind::Action),
        }
        .map_err(|e| {
            FlowError::InvalidWorkflow(format!(
                "node '{}' ({:?} {}): {}",
                raw.id, raw.class, raw.node_type, e
            ))
        })?;

        Ok(Self {
            id: raw.id,
            name: raw.name,
            disabled: raw.disabled,
            kind,
        })
    }
}

impl From<WorkflowNode> for RawWorkflowNode {
    fn from(node: WorkflowNode) -> Self {
        let tagged = match &node.kind {
            NodeKind::Trigger(t) => serde_json::to_value(t),
            NodeKind::Condition(c) => serde_json::to_value(c),
            NodeKind::Action(a) => serde_json::to_value(a),
        }
        .unwrap_or_default();

        Self {
            class: node.kind.class(),
            node_type: node.kind.node_type().to_string(),
            parameters: tagged.get("parameters").cloned().unwrap_or(Value::Null),
            id: node.id,
            name: node.name,
            disabled: node.disabled,
        }
    }
}

/// Edge from an output port to a target node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub target_node_id: String,
    #[serde(default)]
    pub target_input_index: usize,
}

/// Source node id -> output ports -> edges leaving that port
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowConnections(pub HashMap<String, Vec<Vec<Edge>>>);

impl WorkflowConnections {
    pub fn targets(&self, source: &str, port: usize) -> &[Edge] {
        self.0
            .get(source)
            .and_then(|ports| ports.get(port))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Add an edge `source[port] -> target`.
    pub fn connect(&mut self, source: &str, port: usize, target: &str) {
        let ports = self.0.entry(source.to_string()).or_default();
        if ports.len() <= port {
            ports.resize_with(port + 1, Vec::new);
        }
        ports[port].push(Edge {
            target_node_id: target.to_string(),
            target_input_index: 0,
        });
    }
}
