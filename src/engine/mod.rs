//! Workflow engine: trigger matching, schedule registration, condition
//! evaluation, actions and the graph walk that ties them together

pub mod actions;
pub mod conditions;
pub mod executor;
pub mod schedules;
pub mod trigger;
pub mod wildcard;

pub use executor::{run_workflow, ExecutionOutcome};
pub use schedules::save_workflow;
pub use trigger::{match_and_enqueue, match_workflow, trigger_matches, TriggerOutcome};
pub use wildcard::Wildcard;
