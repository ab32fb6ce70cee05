use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use tokenflow_core::definition::Condition;
use tokenflow_core::traits::{ContextRead, Predicate};

/// Named predicates available to `predicate` conditions.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, predicate: Arc<dyn Predicate>) {
        self.predicates.insert(name.into(), predicate);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Predicate>> {
        self.predicates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("PredicateRegistry").field("names", &names).finish()
    }
}

/// Evaluate a transition condition. Unknown predicates and unparseable
/// expressions are false.
pub fn evaluate(condition: &Condition, context: &dyn ContextRead, predicates: &PredicateRegistry) -> bool {
    match condition {
        Condition::Exists { path } => context.read_path(path).is_some(),
        Condition::Predicate { name } => predicates
            .get(name)
            .is_some_and(|p| p.evaluate(context)),
        Condition::Expr { expr } => evaluate_expr(expr, context),
    }
}

/// Evaluate a simple expression against context paths.
///
/// Supported expressions:
/// - `path == "value"`: exact match (strings, or the JSON text of other values)
/// - `path != "value"`: not equal; an undefined path is not equal
/// - `path contains "substr"`: substring of a string, or element of an array
/// - `path exists`
pub fn evaluate_expr(expr: &str, context: &dyn ContextRead) -> bool {
    let expr = expr.trim();

    if let Some(path) = expr.strip_suffix(" exists") {
        return context.read_path(path.trim()).is_some();
    }

    if let Some((path, needle)) = parse_operator(expr, " contains ") {
        return match context.read_path(path) {
            Some(Value::String(s)) => s.contains(needle),
            Some(Value::Array(items)) => items.iter().any(|item| matches_literal(item, needle)),
            _ => false,
        };
    }

    if let Some((path, value)) = parse_operator(expr, "!=") {
        return context
            .read_path(path)
            .map_or(true, |v| !matches_literal(&v, value));
    }

    if let Some((path, value)) = parse_operator(expr, "==") {
        return context
            .read_path(path)
            .is_some_and(|v| matches_literal(&v, value));
    }

    false
}

fn matches_literal(value: &Value, literal: &str) -> bool {
    match value {
        Value::String(s) => s == literal,
        other => other.to_string() == literal,
    }
}

/// Parse `path OP "value"` expressions, returning (path, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (path, value) = expr.split_once(op)?;
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    Some((path, value.trim().trim_matches('"')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Doc(Value);

    impl ContextRead for Doc {
        fn read_path(&self, path: &str) -> Option<Value> {
            let mut current = &self.0;
            for seg in path.split('.') {
                current = current.get(seg)?;
            }
            Some(current.clone())
        }
    }

    fn doc() -> Doc {
        Doc(json!({
            "state": {
                "status": "success",
                "tags": ["rust", "async"],
                "count": 3,
                "message": "all tests passed"
            }
        }))
    }

    #[test]
    fn test_expr_equals() {
        assert!(evaluate_expr(r#"state.status == "success""#, &doc()));
        assert!(!evaluate_expr(r#"state.status == "failure""#, &doc()));
        assert!(evaluate_expr("state.count == 3", &doc()));
    }

    #[test]
    fn test_expr_not_equals() {
        assert!(evaluate_expr(r#"state.status != "failure""#, &doc()));
        assert!(!evaluate_expr(r#"state.status != "success""#, &doc()));
        assert!(evaluate_expr(r#"state.missing != "x""#, &doc()));
    }

    #[test]
    fn test_expr_contains() {
        assert!(evaluate_expr(r#"state.message contains "tests""#, &doc()));
        assert!(evaluate_expr(r#"state.tags contains "async""#, &doc()));
        assert!(!evaluate_expr(r#"state.tags contains "go""#, &doc()));
    }

    #[test]
    fn test_expr_exists_and_garbage() {
        assert!(evaluate_expr("state.tags exists", &doc()));
        assert!(!evaluate_expr("state.nope exists", &doc()));
        assert!(!evaluate_expr("this is not an expression", &doc()));
        assert!(!evaluate_expr(r#" == "x""#, &doc()));
    }

    #[test]
    fn test_condition_variants() {
        let mut registry = PredicateRegistry::new();
        registry.register(
            "has_count",
            Arc::new(|ctx: &dyn ContextRead| ctx.read_path("state.count").is_some()),
        );

        let exists = Condition::Exists {
            path: "state.status".into(),
        };
        assert!(evaluate(&exists, &doc(), &registry));

        let named = Condition::Predicate {
            name: "has_count".into(),
        };
        assert!(evaluate(&named, &doc(), &registry));

        let unknown = Condition::Predicate {
            name: "nope".into(),
        };
        assert!(!evaluate(&unknown, &doc(), &registry));
        assert!(registry.contains("has_count"));
    }
}
