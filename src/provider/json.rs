//! JSON Schema provider.
//!
//! New registrations must compile as a JSON Schema document; historical
//! schemas are parsed leniently so that old log entries always load.
//! Evolution rules operate on `properties`/`required`: backward forbids new
//! required fields and incompatible type changes, forward forbids removing
//! required fields.

use super::{ParsedRepr, ParsedSchema, ResolvedReference, SchemaProvider};
use crate::error::{RegistryError, RegistryResult};
use crate::types::{CompatibilityLevel, SchemaInput, SchemaType};
use serde_json::Value;

pub struct JsonSchemaProvider;

impl SchemaProvider for JsonSchemaProvider {
    fn schema_type(&self) -> SchemaType {
        SchemaType::Json
    }

    fn parse(
        &self,
        input: &SchemaInput,
        _resolved: &[ResolvedReference],
        is_new: bool,
        _normalize: bool,
    ) -> RegistryResult<ParsedSchema> {
        let value: Value = serde_json::from_str(&input.schema)
            .map_err(|e| RegistryError::InvalidSchema(format!("Invalid JSON: {}", e)))?;

        if is_new {
            jsonschema::validator_for(&value)
                .map_err(|e| RegistryError::InvalidSchema(format!("Invalid JSON Schema: {}", e)))?;
        }

        // Keys are sorted recursively so the canonical form is deterministic
        // regardless of input ordering.
        let sorted = sort_keys(&value);
        let canonical = serde_json::to_string(&sorted)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;

        Ok(ParsedSchema::new(
            SchemaType::Json,
            canonical,
            input.references.clone(),
            input.metadata.clone(),
            input.rule_set.clone(),
            ParsedRepr::Json(sorted),
        ))
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), sort_keys(v));
            }
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Evolution errors between one (new, old) schema pair
pub(crate) fn pair_errors(new: &Value, old: &Value, level: CompatibilityLevel) -> Vec<String> {
    let mut messages = Vec::new();

    let new_props = new.get("properties").and_then(|p| p.as_object());
    let old_props = old.get("properties").and_then(|p| p.as_object());

    let required = |v: &Value| -> Vec<String> {
        v.get("required")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let new_required = required(new);
    let old_required = required(old);

    if let (Some(new_p), Some(old_p)) = (new_props, old_props) {
        if level.is_backward() {
            // The new schema must accept old documents: no new required
            // fields the old schema never produced
            for field in &new_required {
                if !old_required.contains(field) && !old_p.contains_key(field) {
                    messages.push(format!(
                        "backward incompatibility: new required property '{}' absent from the prior schema",
                        field
                    ));
                }
            }
            for (name, old_def) in old_p {
                if let Some(new_def) = new_p.get(name) {
                    if !types_compatible(old_def, new_def) {
                        messages.push(format!(
                            "backward incompatibility: property '{}' changed type",
                            name
                        ));
                    }
                }
            }
        }

        if level.is_forward() {
            // Old readers must accept new documents: required fields may not
            // disappear
            for field in &old_required {
                if !new_p.contains_key(field) {
                    messages.push(format!(
                        "forward incompatibility: required property '{}' removed",
                        field
                    ));
                }
            }
            for (name, old_def) in old_p {
                if let Some(new_def) = new_p.get(name) {
                    if !types_compatible(new_def, old_def) {
                        messages.push(format!(
                            "forward incompatibility: property '{}' changed type",
                            name
                        ));
                    }
                }
            }
        }
    }

    messages
}

/// Whether a property type change is readable; integer widens to number
fn types_compatible(old_def: &Value, new_def: &Value) -> bool {
    let old_t = old_def.get("type").and_then(|t| t.as_str());
    let new_t = new_def.get("type").and_then(|t| t.as_str());

    match (old_t, new_t) {
        (Some(old), Some(new)) => old == new || (old == "integer" && new == "number"),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_rejects_bad_schema() {
        let provider = JsonSchemaProvider;
        let input = SchemaInput::new(SchemaType::Json, r#"{"type": "not-a-type"}"#);
        assert!(provider.parse(&input, &[], true, false).is_err());
        // Lenient for historical entries
        assert!(provider.parse(&input, &[], false, false).is_ok());
    }

    #[test]
    fn test_canonical_sorts_keys() {
        let provider = JsonSchemaProvider;
        let a = provider
            .parse(
                &SchemaInput::new(SchemaType::Json, r#"{"type":"object","title":"T"}"#),
                &[],
                true,
                false,
            )
            .unwrap();
        let b = provider
            .parse(
                &SchemaInput::new(SchemaType::Json, r#"{"title":"T","type":"object"}"#),
                &[],
                true,
                false,
            )
            .unwrap();
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_new_required_property_is_backward_incompatible() {
        let old = value(r#"{"type":"object","properties":{"a":{"type":"string"}}}"#);
        let new = value(
            r#"{"type":"object","properties":{"a":{"type":"string"},"b":{"type":"string"}},"required":["b"]}"#,
        );
        let errors = pair_errors(&new, &old, CompatibilityLevel::Backward);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'b'"));
    }

    #[test]
    fn test_removing_required_is_forward_incompatible() {
        let old = value(
            r#"{"type":"object","properties":{"a":{"type":"string"}},"required":["a"]}"#,
        );
        let new = value(r#"{"type":"object","properties":{}}"#);
        assert!(pair_errors(&new, &old, CompatibilityLevel::Backward).is_empty());
        assert!(!pair_errors(&new, &old, CompatibilityLevel::Forward).is_empty());
    }

    #[test]
    fn test_integer_widens_to_number() {
        let old = value(r#"{"type":"object","properties":{"n":{"type":"integer"}}}"#);
        let widened = value(r#"{"type":"object","properties":{"n":{"type":"number"}}}"#);
        let narrowed = value(r#"{"type":"object","properties":{"n":{"type":"string"}}}"#);
        assert!(pair_errors(&widened, &old, CompatibilityLevel::Backward).is_empty());
        assert!(!pair_errors(&narrowed, &old, CompatibilityLevel::Backward).is_empty());
    }
}
