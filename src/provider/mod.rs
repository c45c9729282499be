//! Per-type schema providers.
//!
//! A [`SchemaProvider`] turns raw schema text (plus resolved references) into
//! a [`ParsedSchema`]: an opaque handle carrying the canonical form, the
//! type-specific representation and the capabilities the registry core needs
//! (structural equality, compatibility judgment, fingerprinting). Providers
//! for Avro, JSON Schema and Protobuf ship with the crate; additional types
//! can be injected through [`SchemaProviders::with_provider`].

mod avro;
mod json;
mod protobuf;

pub use avro::AvroProvider;
pub use json::JsonSchemaProvider;
pub use protobuf::ProtobufProvider;

use crate::error::{RegistryError, RegistryResult};
use crate::types::{CompatibilityLevel, Metadata, RuleSet, SchemaInput, SchemaReference, SchemaType};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A reference resolved to its schema text, in resolution order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedReference {
    pub name: String,
    pub schema: String,
}

/// Content fingerprint of a canonical schema: text, references, type,
/// metadata and rule set. Two registrations are "the same schema" (and share
/// an id) exactly when all five agree; a metadata-only change produces a
/// new fingerprint and therefore a new version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    md5: [u8; 16],
    sha256: [u8; 32],
}

impl Fingerprint {
    pub fn compute(
        canonical: &str,
        references: &[SchemaReference],
        schema_type: SchemaType,
        metadata: Option<&Metadata>,
        rule_set: Option<&RuleSet>,
    ) -> Self {
        let mut buf = String::with_capacity(canonical.len() + 64);
        buf.push_str(canonical);
        for r in references {
            buf.push('\u{0}');
            buf.push_str(&r.name);
            buf.push('\u{0}');
            buf.push_str(&r.subject);
            buf.push('\u{0}');
            buf.push_str(&r.version.to_string());
        }
        buf.push('\u{0}');
        buf.push_str(schema_type.as_str());
        if let Some(metadata) = metadata {
            buf.push('\u{0}');
            buf.push_str(&serde_json::to_string(metadata).unwrap_or_default());
        }
        if let Some(rule_set) = rule_set {
            buf.push('\u{0}');
            buf.push_str(&serde_json::to_string(rule_set).unwrap_or_default());
        }

        let md5 = md5::compute(buf.as_bytes()).0;
        let mut hasher = Sha256::new();
        hasher.update(buf.as_bytes());
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&hasher.finalize());

        Self { md5, sha256 }
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// Type-specific parsed representation
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ParsedRepr {
    Avro(apache_avro::Schema),
    Json(serde_json::Value),
    Protobuf(protobuf::ProtoDescriptor),
}

/// A parsed, canonicalized schema.
///
/// Equality-relevant state is the representation plus metadata and rule set;
/// the canonical string is what gets persisted and fingerprinted.
#[derive(Debug, Clone)]
pub struct ParsedSchema {
    schema_type: SchemaType,
    canonical: String,
    references: Vec<SchemaReference>,
    metadata: Option<Metadata>,
    rule_set: Option<RuleSet>,
    repr: ParsedRepr,
}

impl ParsedSchema {
    pub(crate) fn new(
        schema_type: SchemaType,
        canonical: String,
        references: Vec<SchemaReference>,
        metadata: Option<Metadata>,
        rule_set: Option<RuleSet>,
        repr: ParsedRepr,
    ) -> Self {
        Self {
            schema_type,
            canonical,
            references,
            metadata,
            rule_set,
            repr,
        }
    }

    pub fn schema_type(&self) -> SchemaType {
        self.schema_type
    }

    /// Canonical text; this is what the registry persists and deduplicates on
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn references(&self) -> &[SchemaReference] {
        &self.references
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn rule_set(&self) -> Option<&RuleSet> {
        self.rule_set.as_ref()
    }

    /// The same schema body with replaced metadata and rule set
    pub fn copy_with(&self, metadata: Option<Metadata>, rule_set: Option<RuleSet>) -> ParsedSchema {
        ParsedSchema {
            metadata,
            rule_set,
            ..self.clone()
        }
    }

    /// Structural equality after parsing: representation, references,
    /// metadata and rule set all agree
    pub fn deep_equals(&self, other: &ParsedSchema) -> bool {
        self.schema_type == other.schema_type
            && self.repr == other.repr
            && self.metadata == other.metadata
            && self.rule_set == other.rule_set
    }

    /// Same schema body, ignoring references, metadata and rule set
    pub fn same_body(&self, other: &ParsedSchema) -> bool {
        self.schema_type == other.schema_type && self.repr == other.repr
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(
            &self.canonical,
            &self.references,
            self.schema_type,
            self.metadata.as_ref(),
            self.rule_set.as_ref(),
        )
    }

    /// Check this schema against its predecessors under `level`.
    ///
    /// `previous` is the undeleted history in chronological order; transitive
    /// levels check every entry, plain levels only the latest. An empty
    /// return means compatible.
    pub fn is_compatible(&self, level: CompatibilityLevel, previous: &[ParsedSchema]) -> Vec<String> {
        if level == CompatibilityLevel::None || previous.is_empty() {
            return Vec::new();
        }

        let to_check: Vec<&ParsedSchema> = if level.is_transitive() {
            previous.iter().collect()
        } else {
            previous.iter().rev().take(1).collect()
        };

        let mut errors = Vec::new();
        for (i, prev) in to_check.iter().enumerate() {
            if prev.schema_type != self.schema_type {
                errors.push(format!(
                    "schema type changed from {} to {}",
                    prev.schema_type, self.schema_type
                ));
                continue;
            }
            match (&self.repr, &prev.repr) {
                (ParsedRepr::Avro(new), ParsedRepr::Avro(old)) => {
                    if level.is_backward() {
                        if let Err(e) = avro::resolution_errors(old, new) {
                            errors.push(format!("backward incompatibility with prior schema {}: {}", i + 1, e));
                        }
                    }
                    if level.is_forward() {
                        if let Err(e) = avro::resolution_errors(new, old) {
                            errors.push(format!("forward incompatibility with prior schema {}: {}", i + 1, e));
                        }
                    }
                }
                (ParsedRepr::Json(new), ParsedRepr::Json(old)) => {
                    for e in json::pair_errors(new, old, level) {
                        errors.push(format!("prior schema {}: {}", i + 1, e));
                    }
                }
                (ParsedRepr::Protobuf(new), ParsedRepr::Protobuf(old)) => {
                    for e in protobuf::pair_errors(new, old) {
                        errors.push(format!("prior schema {}: {}", i + 1, e));
                    }
                }
                _ => {
                    errors.push(format!(
                        "prior schema {} carries a different parsed representation",
                        i + 1
                    ));
                }
            }
        }
        errors
    }
}

/// Parses raw schema text of one schema type
pub trait SchemaProvider: Send + Sync {
    fn schema_type(&self) -> SchemaType;

    /// Parse and canonicalize.
    ///
    /// `is_new` enables the strict validation applied to incoming
    /// registrations (historical schemas are parsed leniently); `normalize`
    /// additionally erases semantically irrelevant variation. `resolved`
    /// holds the schema text of each reference in resolution order.
    fn parse(
        &self,
        input: &SchemaInput,
        resolved: &[ResolvedReference],
        is_new: bool,
        normalize: bool,
    ) -> RegistryResult<ParsedSchema>;
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ParseCacheKey {
    schema: String,
    references: Vec<SchemaReference>,
    schema_type: SchemaType,
    is_new: bool,
    normalize: bool,
}

struct CachedParse {
    parsed: ParsedSchema,
    at: Instant,
}

/// Dispatch table of providers plus a bounded parse cache.
///
/// The cache is keyed by (raw text, references, type, is_new, normalize) and
/// evicts by LRU order and entry age.
pub struct SchemaProviders {
    providers: HashMap<SchemaType, Arc<dyn SchemaProvider>>,
    cache: Mutex<LruCache<ParseCacheKey, CachedParse>>,
    expiry: Duration,
}

impl SchemaProviders {
    pub fn new(cache_size: usize, expiry: Duration) -> Self {
        let mut providers: HashMap<SchemaType, Arc<dyn SchemaProvider>> = HashMap::new();
        providers.insert(SchemaType::Avro, Arc::new(AvroProvider));
        providers.insert(SchemaType::Json, Arc::new(JsonSchemaProvider));
        providers.insert(SchemaType::Protobuf, Arc::new(ProtobufProvider));
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("capacity is at least one");
        Self {
            providers,
            cache: Mutex::new(LruCache::new(capacity)),
            expiry,
        }
    }

    /// Register or replace a provider for a schema type
    pub fn with_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.providers.insert(provider.schema_type(), provider);
        self
    }

    pub fn provider(&self, schema_type: SchemaType) -> Option<Arc<dyn SchemaProvider>> {
        self.providers.get(&schema_type).cloned()
    }

    pub fn schema_types(&self) -> Vec<SchemaType> {
        let mut types: Vec<SchemaType> = self.providers.keys().copied().collect();
        types.sort();
        types
    }

    /// Parse through the cache
    pub fn parse(
        &self,
        input: &SchemaInput,
        resolved: &[ResolvedReference],
        is_new: bool,
        normalize: bool,
    ) -> RegistryResult<ParsedSchema> {
        let key = ParseCacheKey {
            schema: input.schema.clone(),
            references: input.references.clone(),
            schema_type: input.schema_type,
            is_new,
            normalize,
        };

        {
            let mut cache = self.cache.lock();
            if let Some(hit) = cache.get(&key) {
                if hit.at.elapsed() < self.expiry {
                    let parsed = hit.parsed.clone();
                    // Carry the caller's metadata/rule set; only the body is cached
                    return Ok(parsed.copy_with(input.metadata.clone(), input.rule_set.clone()));
                }
                cache.pop(&key);
            }
        }

        let provider = self.provider(input.schema_type).ok_or_else(|| {
            RegistryError::InvalidSchema(format!(
                "No schema provider registered for type {}",
                input.schema_type
            ))
        })?;
        let parsed = provider.parse(input, resolved, is_new, normalize)?;

        self.cache.lock().put(
            key,
            CachedParse {
                parsed: parsed.clone(),
                at: Instant::now(),
            },
        );
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avro_input(schema: &str) -> SchemaInput {
        SchemaInput::new(SchemaType::Avro, schema)
    }

    #[test]
    fn test_parse_and_canonicalize() {
        let providers = SchemaProviders::new(16, Duration::from_secs(60));
        let parsed = providers
            .parse(&avro_input(r#"{ "type" : "string" }"#), &[], true, false)
            .unwrap();
        assert_eq!(parsed.schema_type(), SchemaType::Avro);
        assert_eq!(parsed.canonical(), r#""string""#);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let providers = SchemaProviders::new(16, Duration::from_secs(60));
        let err = providers
            .parse(&avro_input("not a schema"), &[], true, false)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema(_)));
    }

    #[test]
    fn test_fingerprint_ignores_whitespace() {
        let providers = SchemaProviders::new(16, Duration::from_secs(60));
        let a = providers
            .parse(&avro_input(r#"{"type":"string"}"#), &[], true, false)
            .unwrap();
        let b = providers
            .parse(&avro_input(r#"{ "type" :  "string" }"#), &[], true, false)
            .unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().md5_hex().len(), 32);
        assert_eq!(a.fingerprint().sha256_hex().len(), 64);
    }

    #[test]
    fn test_fingerprint_depends_on_references_and_metadata() {
        let canonical = r#""string""#;
        let a = Fingerprint::compute(canonical, &[], SchemaType::Avro, None, None);
        let b = Fingerprint::compute(
            canonical,
            &[SchemaReference::new("Other", "other-value", 1)],
            SchemaType::Avro,
            None,
            None,
        );
        assert_ne!(a, b);

        let mut meta = Metadata::default();
        meta.properties.insert("owner".into(), "team-a".into());
        let c = Fingerprint::compute(canonical, &[], SchemaType::Avro, Some(&meta), None);
        assert_ne!(a, c);
    }

    #[test]
    fn test_cache_returns_caller_metadata() {
        let providers = SchemaProviders::new(16, Duration::from_secs(60));
        let plain = avro_input(r#"{"type":"string"}"#);
        providers.parse(&plain, &[], true, false).unwrap();

        let mut meta = Metadata::default();
        meta.properties.insert("owner".into(), "team-a".into());
        let with_meta = plain.clone().with_metadata(meta.clone());
        let parsed = providers.parse(&with_meta, &[], true, false).unwrap();
        assert_eq!(parsed.metadata(), Some(&meta));
    }

    #[test]
    fn test_deep_equals_considers_metadata() {
        let providers = SchemaProviders::new(16, Duration::from_secs(60));
        let a = providers
            .parse(&avro_input(r#"{"type":"string"}"#), &[], true, false)
            .unwrap();
        let mut meta = Metadata::default();
        meta.properties.insert("k".into(), "v".into());
        let b = a.copy_with(Some(meta), None);
        assert!(!a.deep_equals(&b));
        assert!(a.same_body(&b));
    }

    #[test]
    fn test_incompatible_on_type_change() {
        let providers = SchemaProviders::new(16, Duration::from_secs(60));
        let old = providers
            .parse(&avro_input(r#"{"type":"string"}"#), &[], true, false)
            .unwrap();
        let new = providers
            .parse(
                &SchemaInput::new(SchemaType::Json, r#"{"type":"object"}"#),
                &[],
                true,
                false,
            )
            .unwrap();
        let errors = new.is_compatible(CompatibilityLevel::Backward, std::slice::from_ref(&old));
        assert!(!errors.is_empty());
    }
}
