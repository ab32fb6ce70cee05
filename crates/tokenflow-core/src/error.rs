use thiserror::Error;

use crate::types::TokenStatus;

#[derive(Debug, Error)]
pub enum FlowError {
    // Token state machine
    #[error("Invalid state transition for token {token_id}: {from} -> {to}")]
    InvalidStateTransition {
        token_id: String,
        from: TokenStatus,
        to: TokenStatus,
    },

    #[error("Token not found: {0}")]
    UnknownToken(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token limit exceeded ({0} tokens)")]
    TokenLimitExceeded(usize),

    // Context errors
    #[error("Invalid context path: {0:?}")]
    InvalidPath(String),

    #[error("Context section is read-only: {0}")]
    ReadOnlySection(String),

    #[error("Context path conflicts with existing value: {0}")]
    PathConflict(String),

    #[error("Branch output already written for token {0}")]
    BranchAlreadyWritten(String),

    // Routing errors
    #[error("Node not found: {0}")]
    UnknownNode(String),

    #[error("No transition matched for token {token_id} at non-terminal node {node_ref}")]
    RoutingExhausted { token_id: String, node_ref: String },

    // Synchronization errors
    #[error("Synchronization timed out for group {sibling_group}: {arrived}/{expected} branches arrived")]
    SynchronizationTimeout {
        sibling_group: String,
        arrived: usize,
        expected: usize,
    },

    #[error("Synchronization stalled for group {sibling_group}: waiting on branches that can no longer arrive")]
    SynchronizationStalled { sibling_group: String },

    #[error("Token {token_id} cannot synchronize: {reason}")]
    SynchronizationMismatch { token_id: String, reason: String },

    #[error("Merge target is not a sequence: {0}")]
    MergeTargetConflict(String),

    // Task errors
    #[error("Task execution failed at node {node_ref} (token {token_id}): {message}")]
    TaskExecutionFailed {
        token_id: String,
        node_ref: String,
        message: String,
    },

    // Completion errors
    #[error("Output field {field} unresolved: nothing at {path}")]
    OutputMappingUnresolved { field: String, path: String },

    #[error("Input failed schema validation: {}", .0.join("; "))]
    InputValidation(Vec<String>),

    #[error("Output failed schema validation: {}", .0.join("; "))]
    OutputValidation(Vec<String>),

    // Definition errors
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    // Run lifecycle
    #[error("Run cancelled")]
    Cancelled,

    #[error("Run coordinator is no longer running: {0}")]
    RunClosed(String),

    #[error("Run failed ({kind}): {message}")]
    RunFailed { kind: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether this error aborts the whole run when raised by the coordinator.
    ///
    /// `InvalidPath` is only fatal to the operation that produced it; the
    /// coordinator decides per call site whether the operation was essential.
    pub fn is_run_fatal(&self) -> bool {
        !matches!(
            self,
            FlowError::InvalidPath(_)
                | FlowError::RunClosed(_)
                | FlowError::RunFailed { .. }
                | FlowError::Config(_)
                | FlowError::ConfigNotFound(_)
        )
    }

    /// Stable snake_case name used in trace payloads and run records.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::InvalidStateTransition { .. } => "invalid_state_transition",
            FlowError::UnknownToken(_) => "unknown_token",
            FlowError::InvalidToken(_) => "invalid_token",
            FlowError::TokenLimitExceeded(_) => "token_limit_exceeded",
            FlowError::InvalidPath(_) => "invalid_path",
            FlowError::ReadOnlySection(_) => "read_only_section",
            FlowError::PathConflict(_) => "path_conflict",
            FlowError::BranchAlreadyWritten(_) => "branch_already_written",
            FlowError::UnknownNode(_) => "unknown_node",
            FlowError::RoutingExhausted { .. } => "routing_exhausted",
            FlowError::SynchronizationTimeout { .. } => "synchronization_timeout",
            FlowError::SynchronizationStalled { .. } => "synchronization_stalled",
            FlowError::SynchronizationMismatch { .. } => "synchronization_mismatch",
            FlowError::MergeTargetConflict(_) => "merge_target_conflict",
            FlowError::TaskExecutionFailed { .. } => "task_execution_failed",
            FlowError::OutputMappingUnresolved { .. } => "output_mapping_unresolved",
            FlowError::InputValidation(_) => "input_validation",
            FlowError::OutputValidation(_) => "output_validation",
            FlowError::InvalidDefinition(_) => "invalid_definition",
            FlowError::Cancelled => "cancelled",
            FlowError::RunClosed(_) => "run_closed",
            FlowError::RunFailed { .. } => "run_failed",
            FlowError::Config(_) => "config",
            FlowError::ConfigNotFound(_) => "config_not_found",
            FlowError::Database(_) => "database",
            FlowError::Io(_) => "io",
            FlowError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
