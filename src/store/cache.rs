//! In-memory, ordered materialization of the log.
//!
//! The cache has exactly one writer, the log consumer, which applies records
//! strictly in log order; readers are many and take the read half of the
//! lock. Apply is deterministic and idempotent: replaying the same log into a
//! fresh cache yields the same observable state.

use super::{ContextValue, RegistryKey, RegistryValue, SchemaValue};
use crate::types::{Mode, QualifiedSubject};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Content-addressed lookup result: the id owning a canonical form and every
/// (subject, version) carrying it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIdAndSubjects {
    pub id: u32,
    subjects: BTreeMap<String, u32>,
}

impl SchemaIdAndSubjects {
    pub fn has_subject(&self, subject: &str) -> bool {
        self.subjects.contains_key(subject)
    }

    pub fn version_of(&self, subject: &str) -> Option<u32> {
        self.subjects.get(subject).copied()
    }

    pub fn subjects(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.subjects.iter()
    }
}

#[derive(Default)]
struct CacheInner {
    /// Latest value per key, in key order
    store: BTreeMap<RegistryKey, RegistryValue>,
    /// id -> every (subject, version) holding it
    ids: HashMap<u32, BTreeSet<(String, u32)>>,
    /// content digest -> id + placements
    content: HashMap<String, SchemaIdAndSubjects>,
    /// (subject, version) -> referring schema ids with reference counts
    referenced_by: HashMap<(String, u32), HashMap<u32, i64>>,
}

impl CacheInner {
    fn index_schema(&mut self, value: &SchemaValue) {
        self.ids
            .entry(value.id)
            .or_default()
            .insert((value.subject.clone(), value.version));

        let entry = self
            .content
            .entry(value.fingerprint())
            .or_insert_with(|| SchemaIdAndSubjects {
                id: value.id,
                subjects: BTreeMap::new(),
            });
        entry.id = value.id;
        entry.subjects.insert(value.subject.clone(), value.version);

        if !value.deleted {
            for r in &value.references {
                *self
                    .referenced_by
                    .entry((r.subject.clone(), r.version))
                    .or_default()
                    .entry(value.id)
                    .or_insert(0) += 1;
            }
        }
    }

    fn unindex_schema(&mut self, value: &SchemaValue) {
        if let Some(placements) = self.ids.get_mut(&value.id) {
            placements.remove(&(value.subject.clone(), value.version));
            if placements.is_empty() {
                self.ids.remove(&value.id);
            }
        }

        let digest = value.fingerprint();
        if let Some(entry) = self.content.get_mut(&digest) {
            if entry.version_of(&value.subject) == Some(value.version) {
                entry.subjects.remove(&value.subject);
            }
            if entry.subjects.is_empty() {
                self.content.remove(&digest);
            }
        }

        if !value.deleted {
            self.drop_references(value);
        }
    }

    fn drop_references(&mut self, value: &SchemaValue) {
        for r in &value.references {
            let target = (r.subject.clone(), r.version);
            if let Some(referrers) = self.referenced_by.get_mut(&target) {
                if let Some(count) = referrers.get_mut(&value.id) {
                    *count -= 1;
                    if *count <= 0 {
                        referrers.remove(&value.id);
                    }
                }
                if referrers.is_empty() {
                    self.referenced_by.remove(&target);
                }
            }
        }
    }

    fn schema_keys_of(&self, subject: &str) -> Vec<RegistryKey> {
        let (start, end) = RegistryKey::schema_range(subject);
        self.store.range(start..=end).map(|(k, _)| k.clone()).collect()
    }
}

/// The materialized view every node keeps of the log
#[derive(Default)]
pub struct LookupCache {
    inner: RwLock<CacheInner>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one log record; returns the previous value of the key.
    ///
    /// Called only by the consumer, strictly in log order.
    pub fn apply(&self, key: &RegistryKey, value: Option<&RegistryValue>) -> Option<RegistryValue> {
        let mut inner = self.inner.write();
        match (key, value) {
            (RegistryKey::Noop { .. }, _) => None,

            (RegistryKey::Schema { .. }, Some(RegistryValue::Schema(sv))) => {
                let old = inner.store.insert(key.clone(), RegistryValue::Schema(sv.clone()));
                if let Some(RegistryValue::Schema(old_sv)) = &old {
                    inner.unindex_schema(old_sv);
                }
                inner.index_schema(sv);
                old
            }
            (RegistryKey::Schema { .. }, None) => {
                let old = inner.store.remove(key);
                if let Some(RegistryValue::Schema(old_sv)) = &old {
                    inner.unindex_schema(old_sv);
                }
                old
            }

            (RegistryKey::DeleteSubject { subject }, Some(RegistryValue::DeleteSubject(ds))) => {
                // Soft-delete every version up to the watermark locally; the
                // single watermark record is what followers replay.
                let keys = inner.schema_keys_of(subject);
                for k in keys {
                    if let RegistryKey::Schema { version, .. } = &k {
                        if *version > ds.version {
                            continue;
                        }
                    }
                    if let Some(RegistryValue::Schema(sv)) = inner.store.get(&k).cloned() {
                        if !sv.deleted {
                            inner.drop_references(&sv);
                            let mut deleted = sv;
                            deleted.deleted = true;
                            inner
                                .store
                                .insert(k, RegistryValue::Schema(deleted));
                        }
                    }
                }
                inner
                    .store
                    .insert(key.clone(), RegistryValue::DeleteSubject(ds.clone()))
            }
            (RegistryKey::DeleteSubject { .. }, None) => inner.store.remove(key),

            (RegistryKey::ClearSubject { subject }, Some(_)) => {
                // Evict soft-deleted state so it can no longer resurrect ids
                let keys = inner.schema_keys_of(subject);
                let mut evicted = 0usize;
                for k in keys {
                    let is_deleted = matches!(
                        inner.store.get(&k),
                        Some(RegistryValue::Schema(sv)) if sv.deleted
                    );
                    if is_deleted {
                        if let Some(RegistryValue::Schema(sv)) = inner.store.remove(&k) {
                            inner.unindex_schema(&sv);
                            evicted += 1;
                        }
                    }
                }
                debug!(subject = %subject, evicted = evicted, "Cleared deleted schemas");
                None
            }
            (RegistryKey::ClearSubject { .. }, None) => None,

            (_, Some(v)) => inner.store.insert(key.clone(), v.clone()),
            (_, None) => inner.store.remove(key),
        }
    }

    pub fn get(&self, key: &RegistryKey) -> Option<RegistryValue> {
        self.inner.read().store.get(key).cloned()
    }

    /// All records whose keys fall in the inclusive range, in key order
    pub fn range(
        &self,
        start: &RegistryKey,
        end: &RegistryKey,
    ) -> Vec<(RegistryKey, RegistryValue)> {
        self.inner
            .read()
            .store
            .range(start.clone()..=end.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every version of `subject`, ascending
    pub fn schema_values(&self, subject: &str) -> Vec<SchemaValue> {
        let (start, end) = RegistryKey::schema_range(subject);
        self.inner
            .read()
            .store
            .range(start..=end)
            .filter_map(|(_, v)| match v {
                RegistryValue::Schema(sv) => Some(sv.clone()),
                _ => None,
            })
            .collect()
    }

    /// Content-addressed lookup by canonical digest
    pub fn schema_id_and_subjects(&self, digest: &str) -> Option<SchemaIdAndSubjects> {
        self.inner.read().content.get(digest).cloned()
    }

    /// Any (subject, version) holding `id` whose subject lives in the same
    /// context as the hint
    pub fn schema_key_by_id(&self, id: u32, hint: &QualifiedSubject) -> Option<(String, u32)> {
        let inner = self.inner.read();
        let placements = inner.ids.get(&id)?;
        placements
            .iter()
            .find(|(subject, _)| {
                let qs = QualifiedSubject::parse(&hint.tenant, subject);
                qs.tenant == hint.tenant && qs.context == hint.context
            })
            .cloned()
    }

    /// Every (subject, version) holding `id`
    pub fn placements_of(&self, id: u32) -> Vec<(String, u32)> {
        self.inner
            .read()
            .ids
            .get(&id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids of schemas referencing (subject, version)
    pub fn references_schema(&self, subject: &str, version: u32) -> BTreeSet<u32> {
        self.inner
            .read()
            .referenced_by
            .get(&(subject.to_string(), version))
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Subjects starting with `prefix`; without `include_deleted` a subject
    /// counts only if it still has an undeleted version
    pub fn subjects(&self, prefix: &str, include_deleted: bool) -> BTreeSet<String> {
        let (start, end) = RegistryKey::schema_prefix_range(prefix);
        let inner = self.inner.read();
        let mut out = BTreeSet::new();
        for (k, v) in inner.store.range(start..=end) {
            if let (RegistryKey::Schema { subject, .. }, RegistryValue::Schema(sv)) = (k, v) {
                if include_deleted || !sv.deleted {
                    out.insert(subject.clone());
                }
            }
        }
        out
    }

    /// Context markers known for `tenant`, in creation-key order
    pub fn contexts(&self, tenant: &str) -> Vec<ContextValue> {
        let (start, end) = RegistryKey::context_range(tenant);
        self.inner
            .read()
            .store
            .range(start..=end)
            .filter_map(|(_, v)| match v {
                RegistryValue::Context(cv) => Some(cv.clone()),
                _ => None,
            })
            .collect()
    }

    /// Explicitly-set mode for the given scope (`None` = global)
    pub fn mode_entry(&self, subject: Option<&str>) -> Option<Mode> {
        let key = RegistryKey::Mode {
            subject: subject.map(str::to_string),
        };
        match self.inner.read().store.get(&key) {
            Some(RegistryValue::Mode(mv)) => Some(mv.mode),
            _ => None,
        }
    }

    /// Explicitly-set config for the given scope (`None` = global)
    pub fn config_entry(&self, subject: Option<&str>) -> Option<super::ConfigValue> {
        let key = RegistryKey::Config {
            subject: subject.map(str::to_string),
        };
        match self.inner.read().store.get(&key) {
            Some(RegistryValue::Config(cv)) => Some(cv.clone()),
            _ => None,
        }
    }

    /// Largest schema id observed; seeds the id generator after catch-up
    pub fn max_id(&self) -> u32 {
        self.inner.read().ids.keys().copied().max().unwrap_or(0)
    }
}
