//! Protobuf schema provider.
//!
//! Full descriptor compilation is out of scope; the provider extracts the
//! field-number layout that compatibility judgments need (numbers, names,
//! reserved ranges, proto2 required fields) and canonicalizes by stripping
//! comments and collapsing whitespace.

use super::{ParsedRepr, ParsedSchema, ResolvedReference, SchemaProvider};
use crate::error::{RegistryError, RegistryResult};
use crate::types::{SchemaInput, SchemaType};
use std::collections::{BTreeMap, BTreeSet};

pub struct ProtobufProvider;

/// Extracted field layout of a protobuf schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProtoDescriptor {
    pub fields: BTreeMap<u32, String>,
    pub required: BTreeSet<String>,
    pub reserved: BTreeSet<u32>,
}

impl SchemaProvider for ProtobufProvider {
    fn schema_type(&self) -> SchemaType {
        SchemaType::Protobuf
    }

    fn parse(
        &self,
        input: &SchemaInput,
        _resolved: &[ResolvedReference],
        is_new: bool,
        _normalize: bool,
    ) -> RegistryResult<ParsedSchema> {
        if input.schema.trim().is_empty() {
            return Err(RegistryError::InvalidSchema(
                "Empty protobuf schema".to_string(),
            ));
        }

        let stripped = strip_comments(&input.schema);
        if is_new && !stripped.contains("message") && !stripped.contains("enum") {
            return Err(RegistryError::InvalidSchema(
                "Protobuf schema declares no message or enum".to_string(),
            ));
        }

        let descriptor = extract_descriptor(&stripped)?;

        // Canonical form: comment-free text with trimmed lines and collapsed
        // blank lines
        let canonical = stripped
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(ParsedSchema::new(
            SchemaType::Protobuf,
            canonical,
            input.references.clone(),
            input.metadata.clone(),
            input.rule_set.clone(),
            ParsedRepr::Protobuf(descriptor),
        ))
    }
}

/// Remove `//` and `/* */` comments so field extraction never matches
/// commented-out declarations
fn strip_comments(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' {
            if chars.peek() == Some(&'/') {
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        result.push('\n');
                        break;
                    }
                }
                continue;
            } else if chars.peek() == Some(&'*') {
                chars.next();
                loop {
                    match chars.next() {
                        Some('*') if chars.peek() == Some(&'/') => {
                            chars.next();
                            break;
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

fn extract_descriptor(clean: &str) -> RegistryResult<ProtoDescriptor> {
    let field_pattern =
        regex::Regex::new(r"(?m)(?:optional|repeated|required|^\s*)\s*\w+\s+(\w+)\s*=\s*(\d+)")
            .map_err(|e| RegistryError::InvalidSchema(format!("Regex error: {}", e)))?;

    let fields: BTreeMap<u32, String> = field_pattern
        .captures_iter(clean)
        .filter_map(|cap| {
            let name = cap.get(1)?.as_str().to_string();
            let num: u32 = cap.get(2)?.as_str().parse().ok()?;
            Some((num, name))
        })
        .collect();

    let reserved_pattern = regex::Regex::new(r"reserved\s+(\d+(?:\s*,\s*\d+)*)")
        .map_err(|e| RegistryError::InvalidSchema(format!("Regex error: {}", e)))?;
    let reserved: BTreeSet<u32> = reserved_pattern
        .captures_iter(clean)
        .flat_map(|cap| {
            cap.get(1)
                .map(|m| {
                    m.as_str()
                        .split(',')
                        .filter_map(|n| n.trim().parse().ok())
                        .collect::<Vec<u32>>()
                })
                .unwrap_or_default()
        })
        .collect();

    let required_pattern = regex::Regex::new(r"required\s+\w+\s+(\w+)")
        .map_err(|e| RegistryError::InvalidSchema(format!("Regex error: {}", e)))?;
    let required: BTreeSet<String> = required_pattern
        .captures_iter(clean)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    Ok(ProtoDescriptor {
        fields,
        required,
        reserved,
    })
}

/// Evolution errors between one (new, old) descriptor pair
pub(crate) fn pair_errors(new: &ProtoDescriptor, old: &ProtoDescriptor) -> Vec<String> {
    let mut messages = Vec::new();

    // Field numbers keep their names
    for (num, old_name) in &old.fields {
        if let Some(new_name) = new.fields.get(num) {
            if old_name != new_name {
                messages.push(format!(
                    "field number {} reused (was '{}', now '{}')",
                    num, old_name, new_name
                ));
            }
        }
    }

    // Reserved numbers stay reserved
    for (num, name) in &new.fields {
        if old.reserved.contains(num) {
            messages.push(format!("field '{}' uses reserved number {}", name, num));
        }
    }

    // proto2 required fields cannot disappear
    for required_name in &old.required {
        if !new.fields.values().any(|n| n == required_name) {
            messages.push(format!("required field '{}' removed", required_name));
        }
    }

    messages
}
