use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique workflow run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique token identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a token.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Pending,
    Executing,
    WaitingForSiblings,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TokenStatus {
    pub const ALL: [TokenStatus; 7] = [
        TokenStatus::Pending,
        TokenStatus::Executing,
        TokenStatus::WaitingForSiblings,
        TokenStatus::Completed,
        TokenStatus::Failed,
        TokenStatus::Cancelled,
        TokenStatus::TimedOut,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Active tokens keep a run alive.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal edges of the token state machine.
    ///
    /// Arrival tokens are created at a fan-in and never execute, so they move
    /// straight from `Pending` to `WaitingForSiblings`. Un-arrived branches can
    /// be timed out or cancelled from either non-waiting active state.
    pub fn can_transition_to(&self, next: TokenStatus) -> bool {
        use TokenStatus::*;
        match (self, next) {
            (Pending, Executing | WaitingForSiblings | Cancelled | TimedOut) => true,
            (Executing, Completed | Failed | WaitingForSiblings | Cancelled | TimedOut) => true,
            (WaitingForSiblings, Completed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::WaitingForSiblings => "waiting_for_siblings",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a workflow run as observed by callers.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one token is pending or executing.
    Running,
    /// Only sibling-group waits remain; progress depends on an alarm or arrival.
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a token inside a fan-out cohort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchInfo {
    /// Runtime sibling group id, fresh per fan-out.
    pub sibling_group: String,
    pub branch_index: u32,
    pub branch_total: u32,
}

impl BranchInfo {
    pub fn new(sibling_group: impl Into<String>, branch_index: u32, branch_total: u32) -> Self {
        Self {
            sibling_group: sibling_group.into(),
            branch_index,
            branch_total,
        }
    }

    /// `0 <= branch_index < branch_total`.
    pub fn is_consistent(&self) -> bool {
        self.branch_total > 0 && self.branch_index < self.branch_total
    }
}

/// Structured reason a run failed, referencing the failing token and node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    /// Snake-case error kind (see `FlowError::kind`).
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RunFailure {
    pub fn from_error(
        error: &crate::error::FlowError,
        token_id: Option<TokenId>,
        node_ref: Option<String>,
    ) -> Self {
        let path = match error {
            crate::error::FlowError::InvalidPath(p)
            | crate::error::FlowError::ReadOnlySection(p)
            | crate::error::FlowError::PathConflict(p)
            | crate::error::FlowError::MergeTargetConflict(p) => Some(p.clone()),
            crate::error::FlowError::OutputMappingUnresolved { path, .. } => Some(path.clone()),
            _ => None,
        };
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            token_id,
            node_ref,
            path,
        }
    }
}
