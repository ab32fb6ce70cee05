use serde_json::Value;

use tokenflow_core::traits::{SchemaValidator, ValidationReport};

/// Minimal validator: checks an object carries every key in `required`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredKeysValidator;

impl SchemaValidator for RequiredKeysValidator {
    fn validate(&self, schema: &Value, value: &Value) -> ValidationReport {
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        if required.is_empty() {
            return ValidationReport::ok();
        }
        let Some(obj) = value.as_object() else {
            return ValidationReport::invalid(vec!["expected an object".into()]);
        };
        let errors = required
            .into_iter()
            .filter(|key| !obj.contains_key(*key))
            .map(|key| format!("missing required field '{}'", key))
            .collect();
        ValidationReport::invalid(errors)
    }
}
