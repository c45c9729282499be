//! The replicated store.
//!
//! All writable state is a keyed record in a compacted log. Every node runs a
//! consumer that applies the log in order to an in-memory [`LookupCache`];
//! the leader additionally owns the producer. Record keys carry a `keytype`
//! discriminator and order such that one subject's schema versions are
//! contiguous in key space, which makes ranged scans cheap.

mod cache;
mod log;

pub use cache::{LookupCache, SchemaIdAndSubjects};
pub use log::{CommitLog, LogEntry, LogStore, MemoryLog};

use crate::error::{RegistryError, RegistryResult};
use crate::types::{
    CompatibilityLevel, Metadata, Mode, RuleSet, Schema, SchemaReference, SchemaType,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Key of a durable record. The serialized key is the log-compaction
/// identity: equal keys overwrite, a missing value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "keytype", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryKey {
    /// Read-barrier sentinel; never holds state
    Noop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    /// Compatibility configuration; `None` subject is the global scope
    Config {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    /// Operating mode; `None` subject is the global scope
    Mode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    /// Marker that a non-default context exists
    Context { tenant: String, context: String },
    /// Cache-clearing event written on mode transitions
    ClearSubject { subject: String },
    /// Soft-delete watermark for a whole subject
    DeleteSubject { subject: String },
    /// One version of one subject
    Schema { subject: String, version: u32 },
}

impl RegistryKey {
    pub fn schema(subject: impl Into<String>, version: u32) -> Self {
        RegistryKey::Schema {
            subject: subject.into(),
            version,
        }
    }

    /// Inclusive key range covering every version of `subject`
    pub fn schema_range(subject: &str) -> (RegistryKey, RegistryKey) {
        (
            RegistryKey::schema(subject, crate::types::MIN_VERSION),
            RegistryKey::schema(subject, crate::types::MAX_VERSION),
        )
    }

    /// Inclusive key range covering every subject starting with `prefix`
    pub fn schema_prefix_range(prefix: &str) -> (RegistryKey, RegistryKey) {
        let mut end = prefix.to_string();
        end.push(char::MAX);
        (
            RegistryKey::schema(prefix, crate::types::MIN_VERSION),
            RegistryKey::schema(end, crate::types::MAX_VERSION),
        )
    }

    /// Inclusive key range covering every context marker of `tenant`
    pub fn context_range(tenant: &str) -> (RegistryKey, RegistryKey) {
        (
            RegistryKey::Context {
                tenant: tenant.to_string(),
                context: String::new(),
            },
            RegistryKey::Context {
                tenant: tenant.to_string(),
                context: String::from(char::MAX),
            },
        )
    }
}

/// Durable record values, one variant per key kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "keytype", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistryValue {
    Config(ConfigValue),
    Mode(ModeValue),
    Context(ContextValue),
    ClearSubject(ClearSubjectValue),
    DeleteSubject(DeleteSubjectValue),
    Schema(SchemaValue),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility_level: Option<CompatibilityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_rule_set: Option<RuleSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_rule_set: Option<RuleSet>,
}

impl ConfigValue {
    /// Field-wise merge: non-null fields of `new` win over `old`
    pub fn update(old: Option<&ConfigValue>, new: ConfigValue) -> ConfigValue {
        match old {
            None => new,
            Some(old) => ConfigValue {
                subject: new.subject.or_else(|| old.subject.clone()),
                compatibility_level: new.compatibility_level.or(old.compatibility_level),
                compatibility_group: new
                    .compatibility_group
                    .or_else(|| old.compatibility_group.clone()),
                default_metadata: new
                    .default_metadata
                    .or_else(|| old.default_metadata.clone()),
                override_metadata: new
                    .override_metadata
                    .or_else(|| old.override_metadata.clone()),
                default_rule_set: new
                    .default_rule_set
                    .or_else(|| old.default_rule_set.clone()),
                override_rule_set: new
                    .override_rule_set
                    .or_else(|| old.override_rule_set.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub mode: Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextValue {
    pub tenant: String,
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClearSubjectValue {
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSubjectValue {
    pub subject: String,
    /// Highest version covered by this soft delete
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaValue {
    pub subject: String,
    pub version: u32,
    pub id: u32,
    #[serde(default)]
    pub schema_type: SchemaType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SchemaReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<RuleSet>,
    pub schema: String,
    #[serde(default)]
    pub deleted: bool,
}

impl SchemaValue {
    pub fn to_schema(&self) -> Schema {
        Schema {
            subject: self.subject.clone(),
            version: self.version,
            id: self.id,
            schema_type: self.schema_type,
            references: self.references.clone(),
            metadata: self.metadata.clone(),
            rule_set: self.rule_set.clone(),
            schema: self.schema.clone(),
        }
    }

    /// Content digest used by the content-addressed index
    pub fn fingerprint(&self) -> String {
        crate::provider::Fingerprint::compute(
            &self.schema,
            &self.references,
            self.schema_type,
            self.metadata.as_ref(),
            self.rule_set.as_ref(),
        )
        .md5_hex()
    }
}

/// Additional log-apply side effects, invoked by the consumer after each
/// record lands in the cache
pub trait StoreUpdateHandler: Send + Sync {
    fn handle_update(
        &self,
        key: &RegistryKey,
        value: Option<&RegistryValue>,
        old: Option<&RegistryValue>,
        offset: u64,
    );
}

/// Bidirectional mapping between typed records and durable bytes.
///
/// Keys serialize deterministically (fixed field order, no maps), which is
/// what makes the serialized key usable as the compaction identity.
#[derive(Debug, Clone)]
pub struct RecordSerializer {
    max_record_bytes: usize,
}

impl RecordSerializer {
    pub fn new(max_record_bytes: usize) -> Self {
        Self { max_record_bytes }
    }

    pub fn serialize_key(&self, key: &RegistryKey) -> RegistryResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(key)?))
    }

    pub fn serialize_value(
        &self,
        key: &RegistryKey,
        value: &RegistryValue,
    ) -> RegistryResult<Bytes> {
        let bytes = serde_json::to_vec(value)?;
        let key_len = serde_json::to_vec(key)?.len();
        if key_len + bytes.len() > self.max_record_bytes {
            return Err(RegistryError::SchemaTooLarge);
        }
        Ok(Bytes::from(bytes))
    }

    pub fn deserialize_key(&self, bytes: &[u8]) -> RegistryResult<RegistryKey> {
        serde_json::from_slice(bytes).map_err(|e| {
            RegistryError::Serialization(format!("Failed to deserialize record key: {}", e))
        })
    }

    pub fn deserialize_value(&self, bytes: &[u8]) -> RegistryResult<RegistryValue> {
        serde_json::from_slice(bytes).map_err(|e| {
            RegistryError::Serialization(format!("Failed to deserialize record value: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_groups_subject_versions() {
        let a = RegistryKey::schema("orders-value", 1);
        let b = RegistryKey::schema("orders-value", 2);
        let c = RegistryKey::schema("users-value", 1);
        assert!(a < b);
        assert!(b < c);

        let (start, end) = RegistryKey::schema_range("orders-value");
        assert!(start <= a && a <= end);
        assert!(start <= b && b <= end);
        assert!(!(start <= c && c <= end));
    }

    #[test]
    fn test_prefix_range() {
        let (start, end) = RegistryKey::schema_prefix_range("orders");
        assert!(start <= RegistryKey::schema("orders-value", 1));
        assert!(RegistryKey::schema("orders-value", 7) <= end);
        assert!(RegistryKey::schema("users-value", 1) > end);
    }

    #[test]
    fn test_key_roundtrip() {
        let serializer = RecordSerializer::new(1024);
        for key in [
            RegistryKey::Noop { subject: None },
            RegistryKey::Config {
                subject: Some("s".into()),
            },
            RegistryKey::Mode { subject: None },
            RegistryKey::Context {
                tenant: "default".into(),
                context: "ctx".into(),
            },
            RegistryKey::ClearSubject {
                subject: "s".into(),
            },
            RegistryKey::DeleteSubject {
                subject: "s".into(),
            },
            RegistryKey::schema("s", 3),
        ] {
            let bytes = serializer.serialize_key(&key).unwrap();
            assert_eq!(serializer.deserialize_key(&bytes).unwrap(), key);
        }
    }

    #[test]
    fn test_keytype_discriminator_on_wire() {
        let serializer = RecordSerializer::new(1024);
        let bytes = serializer
            .serialize_key(&RegistryKey::schema("users-value", 1))
            .unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains(r#""keytype":"SCHEMA""#));
    }

    #[test]
    fn test_value_too_large() {
        let serializer = RecordSerializer::new(64);
        let key = RegistryKey::schema("s", 1);
        let value = RegistryValue::Schema(SchemaValue {
            subject: "s".into(),
            version: 1,
            id: 1,
            schema_type: SchemaType::Avro,
            references: vec![],
            metadata: None,
            rule_set: None,
            schema: "x".repeat(256),
            deleted: false,
        });
        assert!(matches!(
            serializer.serialize_value(&key, &value),
            Err(RegistryError::SchemaTooLarge)
        ));
    }

    #[test]
    fn test_config_update_merges_fieldwise() {
        let old = ConfigValue {
            subject: Some("s".into()),
            compatibility_level: Some(CompatibilityLevel::Full),
            compatibility_group: Some("app".into()),
            ..Default::default()
        };
        let new = ConfigValue {
            subject: Some("s".into()),
            compatibility_level: Some(CompatibilityLevel::Backward),
            ..Default::default()
        };
        let merged = ConfigValue::update(Some(&old), new);
        assert_eq!(
            merged.compatibility_level,
            Some(CompatibilityLevel::Backward)
        );
        assert_eq!(merged.compatibility_group.as_deref(), Some("app"));
    }

    #[test]
    fn test_schema_value_fingerprint_stable() {
        let value = SchemaValue {
            subject: "a".into(),
            version: 1,
            id: 7,
            schema_type: SchemaType::Avro,
            references: vec![],
            metadata: None,
            rule_set: None,
            schema: r#""string""#.into(),
            deleted: false,
        };
        let mut other = value.clone();
        other.subject = "b".into();
        other.version = 4;
        // The digest addresses content, not placement
        assert_eq!(value.fingerprint(), other.fingerprint());
    }
}
