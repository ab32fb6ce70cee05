use serde_json::Value;

use tokenflow_core::definition::MergeStrategy;
use tokenflow_core::error::{FlowError, Result};

/// Fold branch values, already in ascending `branchIndex` order, into the
/// current target value.
///
/// An absent or null target starts as an empty sequence; any other non-array
/// target is a `MergeTargetConflict`.
pub fn fold(
    target_path: &str,
    existing: Option<Value>,
    values: Vec<Value>,
    strategy: MergeStrategy,
) -> Result<Value> {
    let mut items = match existing {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(FlowError::MergeTargetConflict(target_path.to_string())),
    };

    for value in values {
        match (strategy, value) {
            (MergeStrategy::Append, Value::Array(elements)) => items.extend(elements),
            (_, value) => items.push(value),
        }
    }
    Ok(Value::Array(items))
}
