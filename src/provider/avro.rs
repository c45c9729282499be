//! Avro schema provider.
//!
//! Parsing and canonicalization delegate to `apache-avro`; compatibility
//! follows Avro schema-resolution rules (field matching by name or alias,
//! defaults for reader-only fields, numeric promotions).

use super::{ParsedRepr, ParsedSchema, ResolvedReference, SchemaProvider};
use crate::error::{RegistryError, RegistryResult};
use crate::types::{SchemaInput, SchemaType};
use apache_avro::Schema;

pub struct AvroProvider;

impl SchemaProvider for AvroProvider {
    fn schema_type(&self) -> SchemaType {
        SchemaType::Avro
    }

    fn parse(
        &self,
        input: &SchemaInput,
        resolved: &[ResolvedReference],
        _is_new: bool,
        _normalize: bool,
    ) -> RegistryResult<ParsedSchema> {
        // References are parsed first so named types resolve in the main
        // schema. Parsing Canonical Form already erases irrelevant variation,
        // so normalization has nothing further to strip for Avro.
        let schema = if resolved.is_empty() {
            Schema::parse_str(&input.schema)
                .map_err(|e| RegistryError::InvalidSchema(format!("Invalid Avro schema: {}", e)))?
        } else {
            let mut texts: Vec<&str> = resolved.iter().map(|r| r.schema.as_str()).collect();
            texts.push(&input.schema);
            let mut parsed = Schema::parse_list(&texts)
                .map_err(|e| RegistryError::InvalidSchema(format!("Invalid Avro schema: {}", e)))?;
            parsed
                .pop()
                .ok_or_else(|| RegistryError::InvalidSchema("Empty Avro schema list".to_string()))?
        };

        let canonical = schema.canonical_form();
        Ok(ParsedSchema::new(
            SchemaType::Avro,
            canonical,
            input.references.clone(),
            input.metadata.clone(),
            input.rule_set.clone(),
            ParsedRepr::Avro(schema),
        ))
    }
}

/// Check that `reader` can read data written with `writer` under Avro schema
/// resolution rules.
pub(crate) fn resolution_errors(writer: &Schema, reader: &Schema) -> Result<(), String> {
    // Identical subtrees resolve trivially; this also covers the logical
    // types without enumerating them.
    if writer == reader {
        return Ok(());
    }

    match (writer, reader) {
        // Numeric promotions: int -> long -> float -> double
        (Schema::Int, Schema::Long)
        | (Schema::Int, Schema::Float)
        | (Schema::Int, Schema::Double)
        | (Schema::Long, Schema::Float)
        | (Schema::Long, Schema::Double)
        | (Schema::Float, Schema::Double) => Ok(()),

        // String <-> bytes promotion
        (Schema::String, Schema::Bytes) | (Schema::Bytes, Schema::String) => Ok(()),

        (Schema::Array(w), Schema::Array(r)) => resolution_errors(&w.items, &r.items)
            .map_err(|e| format!("array items: {}", e)),

        (Schema::Map(w), Schema::Map(r)) => resolution_errors(&w.types, &r.types)
            .map_err(|e| format!("map values: {}", e)),

        (Schema::Enum(w), Schema::Enum(r)) => {
            for symbol in &w.symbols {
                if !r.symbols.contains(symbol) {
                    return Err(format!(
                        "enum symbol '{}' unknown to the reading schema",
                        symbol
                    ));
                }
            }
            Ok(())
        }

        (Schema::Fixed(w), Schema::Fixed(r)) => {
            if w.size != r.size {
                Err(format!(
                    "fixed size mismatch: writer={}, reader={}",
                    w.size, r.size
                ))
            } else {
                Ok(())
            }
        }

        // Union handling: each writer branch must be readable
        (Schema::Union(w), reader) => {
            for branch in w.variants() {
                resolution_errors(branch, reader)?;
            }
            Ok(())
        }
        (writer, Schema::Union(r)) => {
            if r.variants()
                .iter()
                .any(|branch| resolution_errors(writer, branch).is_ok())
            {
                Ok(())
            } else {
                Err("writer type matches no branch of the reading union".to_string())
            }
        }

        (Schema::Record(w), Schema::Record(r)) => {
            // Every writer field the reader also declares must resolve
            for w_field in &w.fields {
                let matched = r.fields.iter().find(|rf| {
                    rf.name == w_field.name
                        || rf
                            .aliases
                            .as_ref()
                            .is_some_and(|a| a.contains(&w_field.name))
                });
                if let Some(rf) = matched {
                    resolution_errors(&w_field.schema, &rf.schema)
                        .map_err(|e| format!("field '{}': {}", w_field.name, e))?;
                }
            }
            // Reader-only fields need defaults
            for r_field in &r.fields {
                let known_to_writer = w.fields.iter().any(|wf| {
                    wf.name == r_field.name
                        || r_field
                            .aliases
                            .as_ref()
                            .is_some_and(|a| a.contains(&wf.name))
                });
                if !known_to_writer && r_field.default.is_none() {
                    return Err(format!(
                        "field '{}' has no default and is missing from the written data",
                        r_field.name
                    ));
                }
            }
            Ok(())
        }

        (Schema::Ref { name: w }, Schema::Ref { name: r }) => {
            if w == r {
                Ok(())
            } else {
                Err(format!("type reference mismatch: {} vs {}", w, r))
            }
        }

        (w, r) => Err(format!(
            "writer type {:?} cannot be read as {:?}",
            w.canonical_form(),
            r.canonical_form()
        )),
    }
}
