pub mod connection;
pub mod execution;
pub mod mail;
pub mod settled;
pub mod workflow;

pub use connection::Connection;
pub use execution::{
    ExecutionPatch, ExecutionStatus, NewExecution, NodeExecutionResult, NodeResults, TriggerData,
    WorkflowExecution,
};
pub use mail::{
    DraftRef, DraftRequest, HistoryPage, HistoryRecord, LabelModification, ListQuery, MailMessage,
    OutgoingEmail, PushNotification, ScheduledEmail, ScheduledEmailStatus, SentMessage,
    ThreadDetail, ThreadList, ThreadSummary, WatchResponse,
};
pub use settled::{FailedItem, Settled};
pub use workflow::{
    ActionNode, ConditionNode, NodeKind, TriggerKind, TriggerNode, Workflow, WorkflowConnections,
    WorkflowNode,
};
