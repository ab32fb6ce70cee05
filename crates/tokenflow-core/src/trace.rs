use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RunId, TokenId};

/// Coarse grouping of trace events.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceCategory {
    /// Routing and synchronization choices.
    Decision,
    /// Token, run and context lifecycle.
    Operation,
    /// Executor traffic.
    Dispatch,
    /// Writes against the context storage facade.
    Sql,
}

impl TraceCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Operation => "operation",
            Self::Dispatch => "dispatch",
            Self::Sql => "sql",
        }
    }
}

/// Every event type the coordinator emits. Serialized as the dot-namespaced name.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TraceKind {
    #[serde(rename = "operation.workflow.started")]
    WorkflowStarted,
    #[serde(rename = "operation.workflow.resumed")]
    WorkflowResumed,
    #[serde(rename = "operation.workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "operation.workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "operation.workflow.cancelled")]
    WorkflowCancelled,
    #[serde(rename = "operation.tokens.created")]
    TokenCreated,
    #[serde(rename = "operation.tokens.status_changed")]
    TokenStatusChanged,
    #[serde(rename = "operation.context.merged")]
    MergeApplied,
    #[serde(rename = "operation.context.snapshot")]
    SnapshotTaken,
    #[serde(rename = "operation.context.branch_disposed")]
    BranchDisposed,
    #[serde(rename = "operation.sync.alarm_armed")]
    AlarmArmed,
    #[serde(rename = "operation.sync.alarm_cancelled")]
    AlarmCancelled,
    #[serde(rename = "dispatch.task.dispatched")]
    TaskDispatched,
    #[serde(rename = "dispatch.task.completed")]
    TaskCompleted,
    #[serde(rename = "dispatch.task.failed")]
    TaskFailed,
    #[serde(rename = "dispatch.task.discarded")]
    ResultDiscarded,
    #[serde(rename = "decision.transition.evaluated")]
    TransitionEvaluated,
    #[serde(rename = "decision.transition.selected")]
    TransitionSelected,
    #[serde(rename = "decision.routing.terminal")]
    RoutingTerminal,
    #[serde(rename = "decision.routing.fan_out")]
    FanOut,
    #[serde(rename = "decision.sync.arrival")]
    ArrivalRecorded,
    #[serde(rename = "decision.sync.arrival_rejected")]
    ArrivalRejected,
    #[serde(rename = "decision.sync.completed")]
    SyncCompleted,
    #[serde(rename = "decision.sync.timed_out")]
    SyncTimedOut,
    #[serde(rename = "sql.context.write")]
    ContextWrite,
}

impl TraceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "operation.workflow.started",
            Self::WorkflowResumed => "operation.workflow.resumed",
            Self::WorkflowCompleted => "operation.workflow.completed",
            Self::WorkflowFailed => "operation.workflow.failed",
            Self::WorkflowCancelled => "operation.workflow.cancelled",
            Self::TokenCreated => "operation.tokens.created",
            Self::TokenStatusChanged => "operation.tokens.status_changed",
            Self::MergeApplied => "operation.context.merged",
            Self::SnapshotTaken => "operation.context.snapshot",
            Self::BranchDisposed => "operation.context.branch_disposed",
            Self::AlarmArmed => "operation.sync.alarm_armed",
            Self::AlarmCancelled => "operation.sync.alarm_cancelled",
            Self::TaskDispatched => "dispatch.task.dispatched",
            Self::TaskCompleted => "dispatch.task.completed",
            Self::TaskFailed => "dispatch.task.failed",
            Self::ResultDiscarded => "dispatch.task.discarded",
            Self::TransitionEvaluated => "decision.transition.evaluated",
            Self::TransitionSelected => "decision.transition.selected",
            Self::RoutingTerminal => "decision.routing.terminal",
            Self::FanOut => "decision.routing.fan_out",
            Self::ArrivalRecorded => "decision.sync.arrival",
            Self::ArrivalRejected => "decision.sync.arrival_rejected",
            Self::SyncCompleted => "decision.sync.completed",
            Self::SyncTimedOut => "decision.sync.timed_out",
            Self::ContextWrite => "sql.context.write",
        }
    }

    /// The last event a run emits.
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }

    /// Category is the first namespace segment of the type name.
    pub fn category(&self) -> TraceCategory {
        match self.as_str().split('.').next() {
            Some("decision") => TraceCategory::Decision,
            Some("dispatch") => TraceCategory::Dispatch,
            Some("sql") => TraceCategory::Sql,
            _ => TraceCategory::Operation,
        }
    }
}

impl std::fmt::Display for TraceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable entry of a run's trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    /// Monotonic per run, starting at 1.
    pub sequence: u64,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    pub category: TraceCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}
