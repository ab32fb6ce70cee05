use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tokenflow_core::definition::WorkflowDefinition;
use tokenflow_core::error::{FlowError, Result};
use tokenflow_core::traits::SchemaValidator;

use crate::context::RunContext;

/// The result a completed run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum FinalOutput {
    Mapped(Map<String, Value>),
    /// The definition declares no output mapping.
    NoMapping,
}

impl FinalOutput {
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Self::Mapped(map) => map.get(field),
            Self::NoMapping => None,
        }
    }

    pub fn is_no_mapping(&self) -> bool {
        matches!(self, Self::NoMapping)
    }
}

/// Assemble the final output from the definition's output mapping.
///
/// An unresolved source path fails unless the output schema lists required
/// fields and this field is not among them.
pub fn extract(
    definition: &WorkflowDefinition,
    context: &RunContext,
    validator: &dyn SchemaValidator,
) -> Result<FinalOutput> {
    if definition.output_mapping.is_empty() {
        return Ok(FinalOutput::NoMapping);
    }

    let schema = definition.output_schema.as_ref();
    let mut out = Map::new();
    for (field, path) in &definition.output_mapping {
        match context.read(path)? {
            Some(value) => {
                out.insert(field.clone(), value);
            }
            None if is_optional(schema, field) => {}
            None => {
                return Err(FlowError::OutputMappingUnresolved {
                    field: field.clone(),
                    path: path.clone(),
                })
            }
        }
    }

    if let Some(schema) = schema {
        let report = validator.validate(schema, &Value::Object(out.clone()));
        if !report.valid {
            return Err(FlowError::OutputValidation(report.errors));
        }
    }

    Ok(FinalOutput::Mapped(out))
}

fn is_optional(schema: Option<&Value>, field: &str) -> bool {
    let Some(schema) = schema else {
        return false;
    };
    match schema.get("required").and_then(Value::as_array) {
        Some(required) => !required.iter().any(|r| r.as_str() == Some(field)),
        None => true,
    }
}
