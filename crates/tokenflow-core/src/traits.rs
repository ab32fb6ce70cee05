use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{BranchInfo, RunId, TokenId};

/// A unit of work handed to the executor for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub run_id: RunId,
    pub token_id: TokenId,
    pub node_ref: String,
    pub task_id: String,
    pub task_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchInfo>,
    /// Task input assembled from the node's input mapping.
    pub input: serde_json::Value,
}

/// Executor: runs the task behind a node (LLM call, tool call, HTTP call...).
///
/// The coordinator never blocks on this: each dispatch runs on its own task and
/// the result is delivered back to the run's mailbox.
pub trait Executor: Send + Sync + 'static {
    fn dispatch_task(&self, request: TaskRequest) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Outcome of validating a value against a schema document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: vec![],
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Schema validator: checks values at run boundaries (input, output).
pub trait SchemaValidator: Send + Sync + 'static {
    fn validate(&self, schema: &serde_json::Value, value: &serde_json::Value) -> ValidationReport;
}

/// Validator that accepts everything. Used when no schema layer is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SchemaValidator for AcceptAll {
    fn validate(&self, _schema: &serde_json::Value, _value: &serde_json::Value) -> ValidationReport {
        ValidationReport::ok()
    }
}

/// Read-only, path-addressed view of a run's context.
pub trait ContextRead {
    /// Resolve a dot path. `None` means undefined (or malformed).
    fn read_path(&self, path: &str) -> Option<serde_json::Value>;
}

/// Opaque boolean condition over context, registered on the engine by name.
pub trait Predicate: Send + Sync + 'static {
    fn evaluate(&self, context: &dyn ContextRead) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&dyn ContextRead) -> bool + Send + Sync + 'static,
{
    fn evaluate(&self, context: &dyn ContextRead) -> bool {
        self(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapView(HashMap<String, serde_json::Value>);

    impl ContextRead for MapView {
        fn read_path(&self, path: &str) -> Option<serde_json::Value> {
            self.0.get(path).cloned()
        }
    }

    #[test]
    fn test_closure_predicate() {
        let pred = |ctx: &dyn ContextRead| ctx.read_path("state.ready").is_some();
        let mut data = HashMap::new();
        assert!(!Predicate::evaluate(&pred, &MapView(data.clone())));
        data.insert("state.ready".to_string(), serde_json::json!(true));
        assert!(Predicate::evaluate(&pred, &MapView(data)));
    }

    #[test]
    fn test_validation_report_constructors() {
        assert!(ValidationReport::ok().valid);
        let report = ValidationReport::invalid(vec!["missing field".into()]);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
        assert!(ValidationReport::invalid(vec![]).valid);
        assert!(AcceptAll
            .validate(&serde_json::json!({"required": ["x"]}), &serde_json::json!({}))
            .valid);
    }

    #[test]
    fn test_task_request_serialization() {
        let req = TaskRequest {
            run_id: RunId::from_string("r"),
            token_id: TokenId::from_string("t"),
            node_ref: "n".into(),
            task_id: "task".into(),
            task_version: "1".into(),
            branch: Some(BranchInfo::new("g", 1, 3)),
            input: serde_json::json!({"x": 1}),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["nodeRef"], "n");
        assert_eq!(json["branch"]["branchIndex"], 1);
    }
}
