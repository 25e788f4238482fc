//! Walking a workflow graph
//!
//! Traversal is breadth-first from the first enabled trigger, following the
//! edges of the port each node passes on. Every node is visited at most
//! once, so branches that converge run the shared node a single time. A
//! rejected condition or a failed node ends its own branch and nothing
//! else; any failure marks the whole execution failed. Nodes never reached
//! are recorded as not executed.

use std::collections::VecDeque;
use tracing::{debug, warn};

use super::actions::{self, ActionTarget};
use super::conditions::{self, Subject};
use crate::backend::MailDriver;
use crate::state::JobContext;
use crate::types::{
    ExecutionStatus, NodeExecutionResult, NodeKind, NodeResults, ThreadDetail, TriggerData,
    Workflow,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub node_results: NodeResults,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn executed(&self) -> usize {
        self.node_results.values().filter(|r| r.executed).count()
    }
}

pub async fn run_workflow(
    ctx: &JobContext,
    driver: &dyn MailDriver,
    workflow: &Workflow,
    trigger: &TriggerData,
    thread: &ThreadDetail,
) -> ExecutionOutcome {
    let mut results = NodeResults::new();
    let mut errors: Vec<String> = Vec::new();

    let Some(start) = workflow.trigger_node() else {
        for node in &workflow.nodes {
            results.insert(node.id.clone(), NodeExecutionResult::skipped());
        }
        return ExecutionOutcome {
            status: ExecutionStatus::Failed,
            node_results: results,
            error: Some(format!("workflow {} has no enabled trigger", workflow.id)),
        };
    };

    results.insert(start.id.clone(), NodeExecutionResult::passed(0));
    let mut pending: VecDeque<&str> = workflow
        .connections
        .targets(&start.id, 0)
        .iter()
        .map(|edge| edge.target_node_id.as_str())
        .collect();

    let subject = Subject { thread, trigger };
    let target = ActionTarget {
        workflow,
        connection_id: &trigger.connection_id,
        thread,
    };

    while let Some(id) = pending.pop_front() {
        if results.contains_key(id) {
            continue;
        }
        let Some(node) = workflow.node(id) else {
            warn!(node_id = %id, "Edge to missing node ignored");
            continue;
        };

        if node.disabled {
            debug!(node_id = %node.id, "Node disabled, branch skipped");
            results.insert(node.id.clone(), NodeExecutionResult::skipped());
            continue;
        }

        let (result, next_port) = match &node.kind {
            // Rejected at load time; never re-enter a trigger
            NodeKind::Trigger(_) => (NodeExecutionResult::skipped(), None),
            NodeKind::Condition(condition) => {
                match conditions::evaluate(ctx.classifier.as_ref(), condition, &subject).await {
                    Ok(outcome) => {
                        let port = outcome.port;
                        (outcome.into_result(), port)
                    }
                    Err(e) => (NodeExecutionResult::failed(e.to_string()), None),
                }
            }
            NodeKind::Action(action) => {
                match actions::run_action(ctx, driver, action, &target).await {
                    Ok(_) => (NodeExecutionResult::passed(0), Some(0)),
                    Err(e) => (NodeExecutionResult::failed(e.to_string()), None),
                }
            }
        };

        if let Some(error) = &result.error {
            warn!(node_id = %node.id, node_type = node.kind.node_type(), "Node failed: {}", error);
            errors.push(format!("{} ({}): {}", node.name, node.kind.node_type(), error));
        } else {
            debug!(
                node_id = %node.id,
                node_type = node.kind.node_type(),
                passed = result.passed,
                port = ?result.output_index,
                "Node evaluated"
            );
        }

        results.insert(node.id.clone(), result);
        if let Some(port) = next_port {
            pending.extend(
                workflow
                    .connections
                    .targets(&node.id, port)
                    .iter()
                    .map(|edge| edge.target_node_id.as_str()),
            );
        }
    }

    for node in &workflow.nodes {
        results
            .entry(node.id.clone())
            .or_insert_with(NodeExecutionResult::skipped);
    }

    if errors.is_empty() {
        ExecutionOutcome {
            status: ExecutionStatus::Completed,
            node_results: results,
            error: None,
        }
    } else {
        ExecutionOutcome {
            status: ExecutionStatus::Failed,
            node_results: results,
            error: Some(errors.join("; ")),
        }
    }
}
