//! Core types: identifiers, contexts, modes, compatibility levels and the
//! schema entities exchanged with clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Smallest version number a subject can hold
pub const MIN_VERSION: u32 = 1;
/// Largest representable version number
pub const MAX_VERSION: u32 = u32::MAX;

/// Tenant used when no explicit tenant is configured
pub const DEFAULT_TENANT: &str = "default";

/// Schema format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    /// Apache Avro
    #[default]
    #[serde(alias = "avro", alias = "AVRO")]
    Avro,

    /// JSON Schema
    #[serde(alias = "json", alias = "JSON")]
    Json,

    /// Protocol Buffers
    #[serde(alias = "protobuf", alias = "PROTOBUF")]
    Protobuf,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Avro => "AVRO",
            SchemaType::Json => "JSON",
            SchemaType::Protobuf => "PROTOBUF",
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SchemaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AVRO" => Ok(SchemaType::Avro),
            "JSON" | "JSONSCHEMA" | "JSON_SCHEMA" => Ok(SchemaType::Json),
            "PROTOBUF" | "PROTO" => Ok(SchemaType::Protobuf),
            _ => Err(format!("Unknown schema type: {}", s)),
        }
    }
}

// ============================================================================
// Qualified subjects and contexts
// ============================================================================

/// A subject name split into its tenant, context and unqualified parts.
///
/// Contexts partition the subject namespace within a tenant. A qualified
/// subject encodes its context as a leading segment: `:.orders:user-value`
/// lives in context `orders`; a bare `user-value` lives in the default
/// (unnamed) context. Schema ids remain global across contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedSubject {
    /// Owning tenant
    pub tenant: String,
    /// Context name; empty string denotes the default context
    pub context: String,
    /// Subject name without the context qualifier
    pub subject: String,
}

impl QualifiedSubject {
    /// Prefix that introduces a context qualifier
    pub const CONTEXT_PREFIX: &'static str = ":.";
    /// Delimiter closing a context qualifier
    pub const CONTEXT_DELIMITER: char = ':';

    pub fn new(
        tenant: impl Into<String>,
        context: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            context: context.into(),
            subject: subject.into(),
        }
    }

    /// Parse a possibly-qualified subject name.
    ///
    /// `:.ctx:payments-value` → context `ctx`, subject `payments-value`;
    /// anything without the `:.` prefix belongs to the default context.
    pub fn parse(tenant: &str, qualified: &str) -> Self {
        if let Some(rest) = qualified.strip_prefix(Self::CONTEXT_PREFIX) {
            if let Some(pos) = rest.find(Self::CONTEXT_DELIMITER) {
                return Self::new(tenant, &rest[..pos], &rest[pos + 1..]);
            }
            // A bare `:.ctx` names the context itself
            return Self::new(tenant, rest, "");
        }
        Self::new(tenant, "", qualified)
    }

    /// Whether this subject lives in the default context
    pub fn is_default_context(&self) -> bool {
        self.context.is_empty()
    }

    /// Re-encode as the wire form used in log keys and REST paths
    pub fn to_qualified(&self) -> String {
        if self.is_default_context() {
            self.subject.clone()
        } else {
            format!(
                "{}{}{}{}",
                Self::CONTEXT_PREFIX,
                self.context,
                Self::CONTEXT_DELIMITER,
                self.subject
            )
        }
    }

    /// The same subject name qualified into another context
    pub fn in_context(&self, context: &str) -> QualifiedSubject {
        Self::new(self.tenant.clone(), context, self.subject.clone())
    }
}

impl std::fmt::Display for QualifiedSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_qualified())
    }
}

// ============================================================================
// Modes and compatibility
// ============================================================================

/// Per-subject (or global) operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Normal operation
    #[default]
    Readwrite,
    /// Mutations rejected
    Readonly,
    /// Global lock: overrides any subject-level mode
    ReadonlyOverride,
    /// Migration mode: caller supplies ids and versions, compatibility is
    /// not enforced
    Import,
}

impl Mode {
    /// Whether mutations are rejected under this mode
    pub fn is_read_only(&self) -> bool {
        matches!(self, Mode::Readonly | Mode::ReadonlyOverride)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Readwrite => "READWRITE",
            Mode::Readonly => "READONLY",
            Mode::ReadonlyOverride => "READONLY_OVERRIDE",
            Mode::Import => "IMPORT",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READWRITE" => Ok(Mode::Readwrite),
            "READONLY" => Ok(Mode::Readonly),
            "READONLY_OVERRIDE" => Ok(Mode::ReadonlyOverride),
            "IMPORT" => Ok(Mode::Import),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Compatibility level governing which prior schemas a new schema must be
/// compatible with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    /// New schema can read data written by the previous schema (default)
    #[default]
    Backward,
    /// New schema can read data written by every previous schema
    BackwardTransitive,
    /// Previous schema can read data written by the new schema
    Forward,
    /// Every previous schema can read data written by the new schema
    ForwardTransitive,
    /// Both directions against the previous schema
    Full,
    /// Both directions against every previous schema
    FullTransitive,
    /// No checking
    None,
}

impl CompatibilityLevel {
    pub fn is_backward(&self) -> bool {
        matches!(
            self,
            Self::Backward | Self::BackwardTransitive | Self::Full | Self::FullTransitive
        )
    }

    pub fn is_forward(&self) -> bool {
        matches!(
            self,
            Self::Forward | Self::ForwardTransitive | Self::Full | Self::FullTransitive
        )
    }

    /// Transitive levels check against the whole undeleted history instead of
    /// just the latest version
    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            Self::BackwardTransitive | Self::ForwardTransitive | Self::FullTransitive
        )
    }
}

impl std::fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Backward => "BACKWARD",
            Self::BackwardTransitive => "BACKWARD_TRANSITIVE",
            Self::Forward => "FORWARD",
            Self::ForwardTransitive => "FORWARD_TRANSITIVE",
            Self::Full => "FULL",
            Self::FullTransitive => "FULL_TRANSITIVE",
            Self::None => "NONE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CompatibilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BACKWARD" => Ok(Self::Backward),
            "BACKWARD_TRANSITIVE" => Ok(Self::BackwardTransitive),
            "FORWARD" => Ok(Self::Forward),
            "FORWARD_TRANSITIVE" => Ok(Self::ForwardTransitive),
            "FULL" => Ok(Self::Full),
            "FULL_TRANSITIVE" => Ok(Self::FullTransitive),
            "NONE" => Ok(Self::None),
            _ => Err(format!("Unknown compatibility level: {}", s)),
        }
    }
}

/// Read-side visibility of soft-deleted records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupFilter {
    /// Hide soft-deleted records
    #[default]
    Default,
    /// Return live and soft-deleted records
    IncludeDeleted,
    /// Return only soft-deleted records
    DeletedOnly,
}

impl LookupFilter {
    pub fn includes(&self, deleted: bool) -> bool {
        match self {
            LookupFilter::Default => !deleted,
            LookupFilter::IncludeDeleted => true,
            LookupFilter::DeletedOnly => deleted,
        }
    }
}

// ============================================================================
// Schema entities
// ============================================================================

/// Reference from one schema to a named (subject, version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaReference {
    /// Name the referencing schema uses for the target type
    pub name: String,
    /// Subject containing the referenced schema
    pub subject: String,
    /// Version of the referenced schema
    pub version: u32,
}

impl SchemaReference {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            version,
        }
    }
}

/// User-supplied schema metadata: tags and free-form properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Metadata {
    /// Merge two optional metadata values; keys in `over` win.
    pub fn merge(base: Option<&Metadata>, over: Option<&Metadata>) -> Option<Metadata> {
        match (base, over) {
            (None, None) => None,
            (Some(m), None) | (None, Some(m)) => Some(m.clone()),
            (Some(b), Some(o)) => {
                let mut merged = b.clone();
                merged.tags.extend(o.tags.clone());
                merged.properties.extend(o.properties.clone());
                Some(merged)
            }
        }
    }
}

/// A single governance rule attached to a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    pub kind: String,
    pub expr: String,
    #[serde(default)]
    pub disabled: bool,
}

/// Ordered rule lists evaluated by external processors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migration_rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_rules: Vec<Rule>,
}

impl RuleSet {
    /// Merge two optional rule sets; a non-empty list in `over` replaces the
    /// corresponding list in `base`.
    pub fn merge(base: Option<&RuleSet>, over: Option<&RuleSet>) -> Option<RuleSet> {
        match (base, over) {
            (None, None) => None,
            (Some(r), None) | (None, Some(r)) => Some(r.clone()),
            (Some(b), Some(o)) => Some(RuleSet {
                migration_rules: if o.migration_rules.is_empty() {
                    b.migration_rules.clone()
                } else {
                    o.migration_rules.clone()
                },
                domain_rules: if o.domain_rules.is_empty() {
                    b.domain_rules.clone()
                } else {
                    o.domain_rules.clone()
                },
            }),
        }
    }
}

/// A registered schema as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub subject: String,
    pub version: u32,
    pub id: u32,
    #[serde(rename = "schemaType", default)]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SchemaReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(rename = "ruleSet", default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<RuleSet>,
    pub schema: String,
}

/// Registration input: the schema body plus optional caller-chosen identity
/// (ids and versions are only honored in IMPORT mode)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInput {
    #[serde(rename = "schemaType", default)]
    pub schema_type: SchemaType,
    #[serde(default)]
    pub schema: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SchemaReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(rename = "ruleSet", default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<RuleSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl SchemaInput {
    pub fn new(schema_type: SchemaType, schema: impl Into<String>) -> Self {
        Self {
            schema_type,
            schema: schema.into(),
            ..Default::default()
        }
    }

    pub fn with_references(mut self, references: Vec<SchemaReference>) -> Self {
        self.references = references;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_rule_set(mut self, rule_set: RuleSet) -> Self {
        self.rule_set = Some(rule_set);
        self
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Empty input (no body, no references) asks the registry to copy the
    /// previous version with new metadata
    pub fn is_empty(&self) -> bool {
        self.schema.trim().is_empty() && self.references.is_empty()
    }
}

/// (subject, version) pair, used when listing the placements of an id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectVersion {
    pub subject: String,
    pub version: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_type_parse() {
        assert_eq!("avro".parse::<SchemaType>().unwrap(), SchemaType::Avro);
        assert_eq!("JSON".parse::<SchemaType>().unwrap(), SchemaType::Json);
        assert_eq!("proto".parse::<SchemaType>().unwrap(), SchemaType::Protobuf);
        assert!("thrift".parse::<SchemaType>().is_err());
    }

    #[test]
    fn test_qualified_subject_parse() {
        let qs = QualifiedSubject::parse(DEFAULT_TENANT, "user-value");
        assert!(qs.is_default_context());
        assert_eq!(qs.subject, "user-value");
        assert_eq!(qs.to_qualified(), "user-value");

        let qs = QualifiedSubject::parse(DEFAULT_TENANT, ":.orders:user-value");
        assert_eq!(qs.context, "orders");
        assert_eq!(qs.subject, "user-value");
        assert_eq!(qs.to_qualified(), ":.orders:user-value");
    }

    #[test]
    fn test_qualified_subject_bare_context() {
        let qs = QualifiedSubject::parse(DEFAULT_TENANT, ":.orders");
        assert_eq!(qs.context, "orders");
        assert_eq!(qs.subject, "");
    }

    #[test]
    fn test_qualified_subject_in_context() {
        let qs = QualifiedSubject::parse(DEFAULT_TENANT, "user-value");
        let moved = qs.in_context("staging");
        assert_eq!(moved.to_qualified(), ":.staging:user-value");
    }

    #[test]
    fn test_mode_parse_roundtrip() {
        for mode in [
            Mode::Readwrite,
            Mode::Readonly,
            Mode::ReadonlyOverride,
            Mode::Import,
        ] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!(Mode::Readonly.is_read_only());
        assert!(Mode::ReadonlyOverride.is_read_only());
        assert!(!Mode::Import.is_read_only());
    }

    #[test]
    fn test_compatibility_level_flags() {
        assert!(CompatibilityLevel::Backward.is_backward());
        assert!(!CompatibilityLevel::Backward.is_transitive());
        assert!(CompatibilityLevel::FullTransitive.is_backward());
        assert!(CompatibilityLevel::FullTransitive.is_forward());
        assert!(CompatibilityLevel::FullTransitive.is_transitive());
        assert_eq!(
            "full_transitive".parse::<CompatibilityLevel>().unwrap(),
            CompatibilityLevel::FullTransitive
        );
    }

    #[test]
    fn test_lookup_filter() {
        assert!(LookupFilter::Default.includes(false));
        assert!(!LookupFilter::Default.includes(true));
        assert!(LookupFilter::IncludeDeleted.includes(true));
        assert!(LookupFilter::DeletedOnly.includes(true));
        assert!(!LookupFilter::DeletedOnly.includes(false));
    }

    #[test]
    fn test_metadata_merge() {
        let mut base = Metadata::default();
        base.properties.insert("owner".into(), "team-a".into());
        base.properties.insert("group".into(), "g1".into());
        let mut over = Metadata::default();
        over.properties.insert("owner".into(), "team-b".into());

        let merged = Metadata::merge(Some(&base), Some(&over)).unwrap();
        assert_eq!(merged.properties["owner"], "team-b");
        assert_eq!(merged.properties["group"], "g1");
        assert!(Metadata::merge(None, None).is_none());
    }

    #[test]
    fn test_rule_set_merge() {
        let base = RuleSet {
            domain_rules: vec![Rule {
                name: "encrypt".into(),
                doc: None,
                kind: "ENCRYPT".into(),
                expr: "payload".into(),
                disabled: false,
            }],
            ..Default::default()
        };
        let over = RuleSet::default();
        let merged = RuleSet::merge(Some(&base), Some(&over)).unwrap();
        assert_eq!(merged.domain_rules.len(), 1);
    }

    #[test]
    fn test_schema_input_empty() {
        assert!(SchemaInput::default().is_empty());
        assert!(!SchemaInput::new(SchemaType::Avro, r#"{"type":"string"}"#).is_empty());
    }
}
