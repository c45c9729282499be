//! The registry core: registration, lookup, deletion, configuration, mode
//! handling and leader-or-forward dispatch.
//!
//! Every mutation either runs on the leader or is forwarded to it; reads are
//! served from the local cache behind a read barrier where a write may
//! follow. Per-subject locks serialize writer-side orchestration; the leader
//! lock serializes leader-identity state and always nests inside a subject
//! lock, never around it.

use crate::config::RegistryConfig;
use crate::election::{LeaderChangeListener, LeaderElector, RegistryIdentity, StaticElector};
use crate::error::{RegistryError, RegistryResult};
use crate::forward::LeaderClient;
use crate::id::{IdGenerator, IncrementingIdGenerator};
use crate::provider::{ParsedSchema, ResolvedReference, SchemaProviders};
use crate::store::{
    CommitLog, ConfigValue, ContextValue, DeleteSubjectValue, LogStore, LookupCache, MemoryLog,
    ModeValue, RecordSerializer, RegistryKey, RegistryValue, SchemaValue, StoreUpdateHandler,
    ClearSubjectValue,
};
use crate::types::{
    LookupFilter, Mode, QualifiedSubject, Schema, SchemaInput, SubjectVersion, DEFAULT_TENANT,
    MIN_VERSION,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

type LeaderObserver = Box<dyn Fn(bool) + Send + Sync>;

/// A replicated schema registry node
pub struct SchemaRegistry {
    config: RegistryConfig,
    tenant: String,
    store: Arc<LogStore>,
    cache: Arc<LookupCache>,
    providers: Arc<SchemaProviders>,
    id_generator: Arc<dyn IdGenerator>,
    my_identity: RegistryIdentity,
    leader_identity: RwLock<Option<RegistryIdentity>>,
    leader_client: RwLock<Option<Arc<LeaderClient>>>,
    leader_observers: RwLock<Vec<LeaderObserver>>,
    elector: RwLock<Option<Arc<dyn LeaderElector>>>,
    initialized: AtomicBool,
}

impl SchemaRegistry {
    /// Build a node over an existing commit log. The store consumer starts
    /// at [`SchemaRegistry::init`].
    pub fn new(
        config: RegistryConfig,
        log: Arc<dyn CommitLog>,
        handlers: Vec<Arc<dyn StoreUpdateHandler>>,
    ) -> Arc<Self> {
        let providers =
            SchemaProviders::new(config.schema_cache_size, config.schema_cache_expiry());
        Self::with_providers(config, log, handlers, providers)
    }

    /// Like [`SchemaRegistry::new`] with a caller-assembled provider set
    /// (custom schema types added via [`SchemaProviders::with_provider`])
    pub fn with_providers(
        config: RegistryConfig,
        log: Arc<dyn CommitLog>,
        handlers: Vec<Arc<dyn StoreUpdateHandler>>,
        providers: SchemaProviders,
    ) -> Arc<Self> {
        let cache = Arc::new(LookupCache::new());
        let serializer = RecordSerializer::new(config.max_record_bytes);
        let store = Arc::new(LogStore::new(
            log,
            serializer,
            Arc::clone(&cache),
            handlers,
            config.store_timeout(),
        ));
        let providers = Arc::new(providers);
        let id_generator: Arc<dyn IdGenerator> =
            Arc::new(IncrementingIdGenerator::new(Arc::clone(&cache)));
        let my_identity = RegistryIdentity::from_config(&config);

        Arc::new(Self {
            config,
            tenant: DEFAULT_TENANT.to_string(),
            store,
            cache,
            providers,
            id_generator,
            my_identity,
            leader_identity: RwLock::new(None),
            leader_client: RwLock::new(None),
            leader_observers: RwLock::new(Vec::new()),
            elector: RwLock::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Single-node registry over an in-process log, already initialized and
    /// leading
    pub async fn standalone(config: RegistryConfig) -> RegistryResult<Arc<Self>> {
        let registry = Self::new(config, Arc::new(MemoryLog::new()), Vec::new());
        let listener: Arc<dyn LeaderChangeListener> = registry.clone() as Arc<dyn LeaderChangeListener>;
        let elector = Arc::new(StaticElector::new(
            registry.my_identity.clone(),
            Arc::downgrade(&listener),
        ));
        registry.set_elector(elector);
        registry.init().await?;
        registry.post_init().await?;
        Ok(registry)
    }

    pub fn set_elector(&self, elector: Arc<dyn LeaderElector>) {
        *self.elector.write() = Some(elector);
    }

    /// Bring up the store (catch up with the log tail) and, unless election
    /// is deferred, join the election
    pub async fn init(&self) -> RegistryResult<()> {
        self.store.init(self.config.init_timeout()).await?;
        self.initialized.store(true, Ordering::SeqCst);
        if !self.config.leader_election_delay {
            self.elect().await?;
        }
        Ok(())
    }

    /// Run the deferred election, if any
    pub async fn post_init(&self) -> RegistryResult<()> {
        if self.config.leader_election_delay {
            self.elect().await?;
        }
        Ok(())
    }

    async fn elect(&self) -> RegistryResult<()> {
        let elector = self.elector.read().clone();
        if let Some(elector) = elector {
            elector.init().await.map_err(|e| {
                RegistryError::Initialization(format!("Leader election failed: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && self.store.initialized()
    }

    pub async fn close(&self) {
        let elector = self.elector.read().clone();
        if let Some(elector) = elector {
            elector.close().await;
        }
        self.store.close();
        info!("Registry shut down");
    }

    // ========================================================================
    // Leadership
    // ========================================================================

    pub fn my_identity(&self) -> &RegistryIdentity {
        &self.my_identity
    }

    pub fn leader_identity(&self) -> Option<RegistryIdentity> {
        self.leader_identity.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.leader_identity
            .read()
            .as_ref()
            .is_some_and(|l| *l == self.my_identity)
    }

    /// Observe leadership changes of this node; the argument is whether this
    /// node now leads
    pub fn add_leader_change_observer(&self, observer: LeaderObserver) {
        self.leader_observers.write().push(observer);
    }

    fn handle_leader_change(
        &self,
        new_leader: Option<RegistryIdentity>,
    ) -> RegistryResult<(bool, bool)> {
        if let Some(leader) = &new_leader {
            if !leader.leader_eligibility {
                return Err(RegistryError::Initialization(format!(
                    "Tried to set an ineligible node to leader: {}",
                    leader
                )));
            }
        }

        let previous = {
            let mut identity = self.leader_identity.write();
            std::mem::replace(&mut *identity, new_leader.clone())
        };

        *self.leader_client.write() = match &new_leader {
            Some(leader) if *leader != self.my_identity => Some(Arc::new(LeaderClient::new(
                leader,
                self.config.leader_connect_timeout(),
                self.config.leader_read_timeout(),
            )?)),
            _ => None,
        };

        let is_leader = new_leader.as_ref() == Some(&self.my_identity);
        let leader_changed = new_leader.is_some() && new_leader != previous;
        Ok((is_leader, leader_changed))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a schema under a subject; executes on the leader only
    pub async fn register(
        &self,
        subject: &str,
        input: &SchemaInput,
        normalize: bool,
    ) -> RegistryResult<u32> {
        self.check_register_mode(subject, input)?;

        // Make sure the cache is current before any potential write
        self.store
            .wait_until_reader_reaches_last_offset(Some(subject), self.config.store_timeout())
            .await?;

        let mut schema_id = input.id;
        let mut parsed = self.canonicalize(input, input.id.is_none(), normalize)?;

        // Dedup fast path: an identical canonical form may already own an id
        if let Some(p) = &parsed {
            if let Some(existing) = self.dedup_hit(subject, p, schema_id)? {
                match existing {
                    DedupOutcome::AlreadyRegistered(id) => return Ok(id),
                    DedupOutcome::ReuseId(id) => schema_id = Some(id),
                }
            }
        }

        // Partition the subject's history and compute the next version
        let all_versions = self.cache.schema_values(subject);
        let mut new_version = MIN_VERSION;
        let mut deleted_versions: Vec<SchemaValue> = Vec::new();
        let mut undeleted: Vec<ParsedSchema> = Vec::new();
        for sv in &all_versions {
            new_version = new_version.max(sv.version + 1);
            if sv.deleted {
                deleted_versions.push(sv.clone());
                continue;
            }
            let prev = self.parse_stored(sv)?;
            if let Some(p) = &parsed {
                if p.references().is_empty() && !prev.references().is_empty() && p.same_body(&prev)
                {
                    // The caller sent a fully inlined equivalent of an
                    // existing referenced schema
                    return Ok(sv.id);
                }
            }
            undeleted.push(prev);
        }

        let config = self.config_in_scope(subject);
        if input.id.is_none() {
            parsed = Some(self.populate_from_previous(&config, input, parsed, &undeleted)?);
        }
        let parsed = parsed.ok_or_else(|| RegistryError::InvalidSchema("Empty schema".into()))?;

        let compatibility_errors = self.compatible_with_previous(&config, &parsed, &undeleted);
        let is_compatible = compatibility_errors.is_empty();

        // Canonicalization may have unified forms: repeat the dedup probe
        if let Some(existing) = self.dedup_hit(subject, &parsed, schema_id)? {
            match existing {
                DedupOutcome::AlreadyRegistered(id) => return Ok(id),
                DedupOutcome::ReuseId(id) => schema_id = Some(id),
            }
        }

        let mode = self.mode_in_scope(subject);
        if !is_compatible && mode != Mode::Import {
            return Err(RegistryError::IncompatibleSchema(
                compatibility_errors.join("; "),
            ));
        }

        self.ensure_context_marker(subject).await?;

        let version = match input.version {
            Some(v) if v > 0 => {
                if v != new_version && mode != Mode::Import {
                    return Err(RegistryError::InvalidSchema(
                        "Version is not one more than previous version".into(),
                    ));
                }
                v
            }
            _ => new_version,
        };

        let schema_key = RegistryKey::schema(subject, version);
        let mut schema_value = SchemaValue {
            subject: subject.to_string(),
            version,
            id: 0,
            schema_type: parsed.schema_type(),
            references: parsed.references().to_vec(),
            metadata: parsed.metadata().cloned(),
            rule_set: parsed.rule_set().cloned(),
            schema: parsed.canonical().to_string(),
            deleted: false,
        };

        let assigned = match schema_id {
            Some(id) => {
                self.check_if_schema_with_id_exists(id, subject, parsed.canonical())?;
                schema_value.id = id;
                self.store
                    .put(&schema_key, &RegistryValue::Schema(schema_value.clone()))
                    .await?;
                id
            }
            None => {
                let hint = QualifiedSubject::parse(&self.tenant, subject);
                let mut assigned = None;
                for retry in 0..self.config.write_max_retries {
                    let candidate = self.id_generator.id(&schema_value).await?;
                    if self.cache.schema_key_by_id(candidate, &hint).is_some() {
                        continue;
                    }
                    if retry > 0 {
                        warn!(id = candidate, retry = retry, "Retrying schema registration");
                    }
                    schema_value.id = candidate;
                    self.store
                        .put(&schema_key, &RegistryValue::Schema(schema_value.clone()))
                        .await?;
                    assigned = Some(candidate);
                    break;
                }
                assigned.ok_or_else(|| {
                    RegistryError::IdGeneration(
                        "Exhausted retries generating an id that is not already in use".into(),
                    )
                })?
            }
        };

        // A soft-deleted lower version holding the same id is superseded:
        // tombstone it
        for deleted in &deleted_versions {
            if deleted.id == assigned && deleted.version < version {
                self.store
                    .delete(&RegistryKey::schema(&deleted.subject, deleted.version))
                    .await?;
            }
        }

        info!(
            subject = %subject,
            version = version,
            id = assigned,
            "Registered schema"
        );
        Ok(assigned)
    }

    /// Register locally when leading, else forward to the leader
    pub async fn register_or_forward(
        &self,
        subject: &str,
        input: &SchemaInput,
        normalize: bool,
        headers: &HashMap<String, String>,
    ) -> RegistryResult<u32> {
        // Read-only probe: an identical undeleted schema may already exist
        if let Some(existing) = self.lookup_schema_under_subject(subject, input, normalize, false)?
        {
            if input.id.is_none() || input.id == Some(existing.id) {
                return Ok(existing.id);
            }
        }

        let lock = self.store.lock_for(subject);
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.register(subject, input, normalize).await
        } else if let Some(client) = self.leader_client() {
            client
                .register_schema(headers, subject, input, normalize)
                .await
        } else {
            Err(RegistryError::UnknownLeader("Register schema request".into()))
        }
    }

    fn dedup_hit(
        &self,
        subject: &str,
        parsed: &ParsedSchema,
        caller_id: Option<u32>,
    ) -> RegistryResult<Option<DedupOutcome>> {
        let digest = parsed.fingerprint().md5_hex();
        let Some(hit) = self.cache.schema_id_and_subjects(&digest) else {
            return Ok(None);
        };
        if let Some(id) = caller_id {
            if id != hit.id {
                return Ok(None);
            }
        }
        if let Some(version) = hit.version_of(subject) {
            if !self.is_subject_version_deleted(subject, version) {
                return Ok(Some(DedupOutcome::AlreadyRegistered(hit.id)));
            }
        }
        Ok(Some(DedupOutcome::ReuseId(hit.id)))
    }

    fn check_register_mode(&self, subject: &str, input: &SchemaInput) -> RegistryResult<()> {
        let mode = self.mode_in_scope(subject);
        if mode.is_read_only() {
            return Err(RegistryError::OperationNotPermitted(format!(
                "Subject {} is in read-only mode",
                subject
            )));
        }
        if input.id.is_some() {
            if mode != Mode::Import {
                return Err(RegistryError::OperationNotPermitted(format!(
                    "Subject {} is not in import mode",
                    subject
                )));
            }
        } else if mode != Mode::Readwrite {
            return Err(RegistryError::OperationNotPermitted(format!(
                "Subject {} is not in read-write mode",
                subject
            )));
        }
        Ok(())
    }

    fn check_if_schema_with_id_exists(
        &self,
        id: u32,
        subject: &str,
        canonical: &str,
    ) -> RegistryResult<()> {
        let hint = QualifiedSubject::parse(&self.tenant, subject);
        if let Some((existing_subject, existing_version)) = self.cache.schema_key_by_id(id, &hint) {
            if let Some(RegistryValue::Schema(existing)) = self
                .cache
                .get(&RegistryKey::schema(existing_subject, existing_version))
            {
                if existing.schema != canonical {
                    return Err(RegistryError::OperationNotPermitted(format!(
                        "Overwrite new schema with id {} is not permitted",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    fn populate_from_previous(
        &self,
        config: &ConfigValue,
        input: &SchemaInput,
        parsed: Option<ParsedSchema>,
        undeleted: &[ParsedSchema],
    ) -> RegistryResult<ParsedSchema> {
        let previous = undeleted.last();
        let parsed = match parsed {
            Some(p) => p,
            None => previous
                .map(|p| p.copy_with(input.metadata.clone(), input.rule_set.clone()))
                .ok_or_else(|| RegistryError::InvalidSchema("Empty schema".into()))?,
        };

        // Inherit metadata/rule set from the previous version, then merge the
        // effective config in precedence default -> specific -> override
        let specific_metadata = parsed.metadata().or_else(|| previous.and_then(|p| p.metadata()));
        let merged_metadata = crate::types::Metadata::merge(
            crate::types::Metadata::merge(config.default_metadata.as_ref(), specific_metadata)
                .as_ref(),
            config.override_metadata.as_ref(),
        );
        let specific_rules = parsed.rule_set().or_else(|| previous.and_then(|p| p.rule_set()));
        let merged_rules = crate::types::RuleSet::merge(
            crate::types::RuleSet::merge(config.default_rule_set.as_ref(), specific_rules).as_ref(),
            config.override_rule_set.as_ref(),
        );

        if merged_metadata.is_some() || merged_rules.is_some() {
            Ok(parsed.copy_with(merged_metadata, merged_rules))
        } else {
            Ok(parsed)
        }
    }

    fn compatible_with_previous(
        &self,
        config: &ConfigValue,
        parsed: &ParsedSchema,
        undeleted: &[ParsedSchema],
    ) -> Vec<String> {
        let level = config
            .compatibility_level
            .unwrap_or(self.config.compatibility_level);

        let filtered: Vec<ParsedSchema>;
        let previous: &[ParsedSchema] = match &config.compatibility_group {
            Some(group) => {
                let group_value = parsed
                    .metadata()
                    .and_then(|m| m.properties.get(group))
                    .cloned();
                match group_value {
                    Some(value) => {
                        filtered = undeleted
                            .iter()
                            .filter(|p| {
                                p.metadata()
                                    .and_then(|m| m.properties.get(group))
                                    .is_some_and(|v| *v == value)
                            })
                            .cloned()
                            .collect();
                        &filtered
                    }
                    None => undeleted,
                }
            }
            None => undeleted,
        };

        let mut errors = parsed.is_compatible(level, previous);
        if !errors.is_empty() {
            errors.push(format!("{{compatibility: '{}'}}", level));
        }
        errors
    }

    async fn ensure_context_marker(&self, subject: &str) -> RegistryResult<()> {
        let qs = QualifiedSubject::parse(&self.tenant, subject);
        if qs.is_default_context() {
            return Ok(());
        }
        let key = RegistryKey::Context {
            tenant: qs.tenant.clone(),
            context: qs.context.clone(),
        };
        if self.store.get(&key).is_none() {
            self.store
                .put(
                    &key,
                    &RegistryValue::Context(ContextValue {
                        tenant: qs.tenant,
                        context: qs.context,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    fn canonicalize(
        &self,
        input: &SchemaInput,
        is_new: bool,
        normalize: bool,
    ) -> RegistryResult<Option<ParsedSchema>> {
        if input.is_empty() {
            return Ok(None);
        }
        let resolved = self.resolve_references(input)?;
        self.providers
            .parse(input, &resolved, is_new, normalize)
            .map(Some)
    }

    fn resolve_references(&self, input: &SchemaInput) -> RegistryResult<Vec<ResolvedReference>> {
        let mut resolved = Vec::with_capacity(input.references.len());
        for r in &input.references {
            let key = RegistryKey::schema(&r.subject, r.version);
            match self.cache.get(&key) {
                Some(RegistryValue::Schema(sv)) if !sv.deleted => {
                    resolved.push(ResolvedReference {
                        name: r.name.clone(),
                        schema: sv.schema,
                    });
                }
                _ => {
                    return Err(RegistryError::InvalidSchema(format!(
                        "Reference '{}' points to missing schema {} version {}",
                        r.name, r.subject, r.version
                    )));
                }
            }
        }
        Ok(resolved)
    }

    fn parse_stored(&self, value: &SchemaValue) -> RegistryResult<ParsedSchema> {
        let input = SchemaInput {
            schema_type: value.schema_type,
            schema: value.schema.clone(),
            references: value.references.clone(),
            metadata: value.metadata.clone(),
            rule_set: value.rule_set.clone(),
            version: None,
            id: None,
        };
        let resolved = self.resolve_references(&input)?;
        self.providers.parse(&input, &resolved, false, false)
    }

    fn is_subject_version_deleted(&self, subject: &str, version: u32) -> bool {
        match self.cache.get(&RegistryKey::schema(subject, version)) {
            Some(RegistryValue::Schema(sv)) => sv.deleted,
            _ => true,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Whether this exact schema is already registered under the subject
    pub fn lookup_schema_under_subject(
        &self,
        subject: &str,
        input: &SchemaInput,
        normalize: bool,
        include_deleted: bool,
    ) -> RegistryResult<Option<Schema>> {
        let Some(parsed) = self.canonicalize(input, false, normalize)? else {
            return Ok(None);
        };

        if let Some(hit) = self
            .cache
            .schema_id_and_subjects(&parsed.fingerprint().md5_hex())
        {
            if let Some(version) = hit.version_of(subject) {
                if include_deleted || !self.is_subject_version_deleted(subject, version) {
                    if let Some(RegistryValue::Schema(sv)) =
                        self.cache.get(&RegistryKey::schema(subject, version))
                    {
                        return Ok(Some(sv.to_schema()));
                    }
                }
            }
        }

        // Inlined-equivalent probe against referenced versions
        if parsed.references().is_empty() {
            for sv in self.cache.schema_values(subject).iter().rev() {
                if (include_deleted || !sv.deleted) && !sv.references.is_empty() {
                    let prev = self.parse_stored(sv)?;
                    if parsed.same_body(&prev) {
                        return Ok(Some(sv.to_schema()));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Content lookup that falls back to qualifying the subject with every
    /// known context
    pub fn lookup_schema_under_subject_using_contexts(
        &self,
        subject: &str,
        input: &SchemaInput,
        normalize: bool,
        include_deleted: bool,
    ) -> RegistryResult<Option<Schema>> {
        if let Some(found) =
            self.lookup_schema_under_subject(subject, input, normalize, include_deleted)?
        {
            return Ok(Some(found));
        }
        let qs = QualifiedSubject::parse(&self.tenant, subject);
        if !qs.is_default_context() {
            return Ok(None);
        }
        for context in self.cache.contexts(&self.tenant) {
            let qualified = qs.in_context(&context.context).to_qualified();
            if let Some(found) =
                self.lookup_schema_under_subject(&qualified, input, normalize, include_deleted)?
            {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Schema by global id; the subject hint selects the context
    pub fn get_by_id(&self, id: u32, subject_hint: &str) -> RegistryResult<Schema> {
        let hint = QualifiedSubject::parse(&self.tenant, subject_hint);
        let placement = self.cache.schema_key_by_id(id, &hint).or_else(|| {
            if !hint.is_default_context() {
                return None;
            }
            // No match in the default context: qualify with each known one
            self.cache.contexts(&self.tenant).iter().find_map(|c| {
                self.cache
                    .schema_key_by_id(id, &hint.in_context(&c.context))
            })
        });

        let (subject, version) = placement
            .ok_or_else(|| RegistryError::SchemaNotFound(format!("Schema id {}", id)))?;
        match self.cache.get(&RegistryKey::schema(subject, version)) {
            Some(RegistryValue::Schema(sv)) => Ok(sv.to_schema()),
            _ => Err(RegistryError::SchemaNotFound(format!("Schema id {}", id))),
        }
    }

    /// Schema by (subject, version)
    pub fn get(
        &self,
        subject: &str,
        version: u32,
        include_deleted: bool,
    ) -> RegistryResult<Schema> {
        match self.cache.get(&RegistryKey::schema(subject, version)) {
            Some(RegistryValue::Schema(sv)) if include_deleted || !sv.deleted => {
                Ok(sv.to_schema())
            }
            _ => Err(RegistryError::VersionNotFound {
                subject: subject.to_string(),
                version,
            }),
        }
    }

    /// Like [`SchemaRegistry::get`], falling back through known contexts for
    /// unqualified subjects
    pub fn get_using_contexts(
        &self,
        subject: &str,
        version: u32,
        include_deleted: bool,
    ) -> RegistryResult<Schema> {
        if let Ok(found) = self.get(subject, version, include_deleted) {
            return Ok(found);
        }
        let qs = QualifiedSubject::parse(&self.tenant, subject);
        if qs.is_default_context() {
            for context in self.cache.contexts(&self.tenant) {
                let qualified = qs.in_context(&context.context).to_qualified();
                if let Ok(found) = self.get(&qualified, version, include_deleted) {
                    return Ok(found);
                }
            }
        }
        Err(RegistryError::VersionNotFound {
            subject: subject.to_string(),
            version,
        })
    }

    /// Latest undeleted version of a subject
    pub fn latest_version(&self, subject: &str) -> RegistryResult<Schema> {
        self.cache
            .schema_values(subject)
            .into_iter()
            .filter(|sv| !sv.deleted)
            .max_by_key(|sv| sv.version)
            .map(|sv| sv.to_schema())
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.to_string()))
    }

    /// Most recent version whose metadata contains all given properties
    pub fn latest_with_metadata(
        &self,
        subject: &str,
        properties: &HashMap<String, String>,
        include_deleted: bool,
    ) -> RegistryResult<Schema> {
        self.cache
            .schema_values(subject)
            .into_iter()
            .rev()
            .filter(|sv| include_deleted || !sv.deleted)
            .find(|sv| {
                sv.metadata.as_ref().is_some_and(|m| {
                    properties
                        .iter()
                        .all(|(k, v)| m.properties.get(k) == Some(v))
                })
            })
            .map(|sv| sv.to_schema())
            .ok_or_else(|| RegistryError::SubjectNotFound(subject.to_string()))
    }

    /// All versions of a subject under the filter, ascending
    pub fn all_versions(&self, subject: &str, filter: LookupFilter) -> Vec<Schema> {
        self.cache
            .schema_values(subject)
            .into_iter()
            .filter(|sv| filter.includes(sv.deleted))
            .map(|sv| sv.to_schema())
            .collect()
    }

    pub fn list_subjects(&self, filter: LookupFilter) -> Vec<String> {
        self.list_subjects_with_prefix("", filter)
    }

    pub fn list_subjects_with_prefix(&self, prefix: &str, filter: LookupFilter) -> Vec<String> {
        match filter {
            LookupFilter::Default => self.cache.subjects(prefix, false).into_iter().collect(),
            LookupFilter::IncludeDeleted => {
                self.cache.subjects(prefix, true).into_iter().collect()
            }
            LookupFilter::DeletedOnly => {
                let live = self.cache.subjects(prefix, false);
                self.cache
                    .subjects(prefix, true)
                    .into_iter()
                    .filter(|s| !live.contains(s))
                    .collect()
            }
        }
    }

    /// Every version of every subject starting with `prefix`, in key order
    pub fn all_versions_with_prefix(&self, prefix: &str, filter: LookupFilter) -> Vec<Schema> {
        let (start, end) = RegistryKey::schema_prefix_range(prefix);
        self.cache
            .range(&start, &end)
            .into_iter()
            .filter_map(|(_, v)| match v {
                RegistryValue::Schema(sv) if filter.includes(sv.deleted) => Some(sv.to_schema()),
                _ => None,
            })
            .collect()
    }

    /// Subjects holding the given id, within the hint's context
    pub fn subjects_for_id(
        &self,
        id: u32,
        subject_hint: &str,
        include_deleted: bool,
    ) -> Vec<String> {
        self.versions_for_id(id, subject_hint, include_deleted)
            .into_iter()
            .map(|sv| sv.subject)
            .collect()
    }

    /// (subject, version) pairs holding the given id, within the hint's
    /// context
    pub fn versions_for_id(
        &self,
        id: u32,
        subject_hint: &str,
        include_deleted: bool,
    ) -> Vec<SubjectVersion> {
        let hint = QualifiedSubject::parse(&self.tenant, subject_hint);
        self.cache
            .placements_of(id)
            .into_iter()
            .filter(|(subject, version)| {
                let qs = QualifiedSubject::parse(&self.tenant, subject);
                qs.context == hint.context
                    && (include_deleted || !self.is_subject_version_deleted(subject, *version))
            })
            .map(|(subject, version)| SubjectVersion { subject, version })
            .collect()
    }

    /// Names of every context with a marker record; the default context is
    /// implicit
    pub fn list_contexts(&self) -> Vec<String> {
        self.cache
            .contexts(&self.tenant)
            .into_iter()
            .map(|c| c.context)
            .collect()
    }

    /// Ids of schemas referencing (subject, version)
    pub fn referenced_by(&self, subject: &str, version: u32) -> Vec<u32> {
        self.cache
            .references_schema(subject, version)
            .into_iter()
            .collect()
    }

    /// Judge a proposed schema against a subject's history without writing
    /// anything; an empty list means compatible
    pub fn check_compatibility(
        &self,
        subject: &str,
        input: &SchemaInput,
    ) -> RegistryResult<Vec<String>> {
        let parsed = self
            .canonicalize(input, true, false)?
            .ok_or_else(|| RegistryError::InvalidSchema("Empty schema".into()))?;
        let undeleted: Vec<ParsedSchema> = self
            .cache
            .schema_values(subject)
            .iter()
            .filter(|sv| !sv.deleted)
            .map(|sv| self.parse_stored(sv))
            .collect::<RegistryResult<_>>()?;
        let config = self.config_in_scope(subject);
        Ok(self.compatible_with_previous(&config, &parsed, &undeleted))
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Soft- or hard-delete one version
    pub async fn delete_schema_version(
        &self,
        subject: &str,
        version: u32,
        permanent: bool,
    ) -> RegistryResult<()> {
        if self.mode_in_scope(subject).is_read_only() {
            return Err(RegistryError::OperationNotPermitted(format!(
                "Subject {} is in read-only mode",
                subject
            )));
        }

        let key = RegistryKey::schema(subject, version);
        if !self.cache.references_schema(subject, version).is_empty() {
            return Err(RegistryError::ReferenceExists(format!(
                "{}:{}",
                subject, version
            )));
        }

        let value = match self.cache.get(&key) {
            Some(RegistryValue::Schema(sv)) => sv,
            _ => {
                return Err(RegistryError::VersionNotFound {
                    subject: subject.to_string(),
                    version,
                })
            }
        };
        if permanent && !value.deleted {
            return Err(RegistryError::SchemaVersionNotSoftDeleted {
                subject: subject.to_string(),
                version,
            });
        }

        self.store
            .wait_until_reader_reaches_last_offset(Some(subject), self.config.store_timeout())
            .await?;

        if permanent {
            self.store.delete(&key).await?;
        } else {
            let mut soft = value;
            soft.deleted = true;
            self.store.put(&key, &RegistryValue::Schema(soft)).await?;

            // The last undeleted version just vanished: drop subject-scoped
            // mode and config as well
            if self.all_versions(subject, LookupFilter::Default).is_empty() {
                if self.cache.mode_entry(Some(subject)).is_some() {
                    self.store
                        .delete(&RegistryKey::Mode {
                            subject: Some(subject.to_string()),
                        })
                        .await?;
                }
                if self.cache.config_entry(Some(subject)).is_some() {
                    self.store
                        .delete(&RegistryKey::Config {
                            subject: Some(subject.to_string()),
                        })
                        .await?;
                }
            }
        }
        info!(subject = %subject, version = version, permanent = permanent, "Deleted schema version");
        Ok(())
    }

    pub async fn delete_schema_version_or_forward(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
        version: u32,
        permanent: bool,
    ) -> RegistryResult<()> {
        let lock = self.store.lock_for(subject);
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.delete_schema_version(subject, version, permanent).await
        } else if let Some(client) = self.leader_client() {
            client
                .delete_schema_version(headers, subject, version, permanent)
                .await
        } else {
            Err(RegistryError::UnknownLeader("Delete version request".into()))
        }
    }

    /// Soft- or hard-delete a whole subject; returns the deleted versions
    pub async fn delete_subject(
        &self,
        subject: &str,
        permanent: bool,
    ) -> RegistryResult<Vec<u32>> {
        if self.mode_in_scope(subject).is_read_only() {
            return Err(RegistryError::OperationNotPermitted(format!(
                "Subject {} is in read-only mode",
                subject
            )));
        }

        self.store
            .wait_until_reader_reaches_last_offset(Some(subject), self.config.store_timeout())
            .await?;

        let filter = if permanent {
            LookupFilter::IncludeDeleted
        } else {
            LookupFilter::Default
        };
        let mut deleted_versions = Vec::new();
        let mut watermark = 0u32;
        for sv in self
            .cache
            .schema_values(subject)
            .into_iter()
            .filter(|sv| filter.includes(sv.deleted))
        {
            if !self.cache.references_schema(subject, sv.version).is_empty() {
                return Err(RegistryError::ReferenceExists(format!(
                    "{}:{}",
                    subject, sv.version
                )));
            }
            if permanent && !sv.deleted {
                return Err(RegistryError::SubjectNotSoftDeleted(subject.to_string()));
            }
            watermark = watermark.max(sv.version);
            deleted_versions.push(sv.version);
        }

        if permanent {
            for version in &deleted_versions {
                self.store
                    .delete(&RegistryKey::schema(subject, *version))
                    .await?;
            }
        } else {
            self.store
                .put(
                    &RegistryKey::DeleteSubject {
                        subject: subject.to_string(),
                    },
                    &RegistryValue::DeleteSubject(DeleteSubjectValue {
                        subject: subject.to_string(),
                        version: watermark,
                    }),
                )
                .await?;
            if self.cache.mode_entry(Some(subject)).is_some() {
                self.store
                    .delete(&RegistryKey::Mode {
                        subject: Some(subject.to_string()),
                    })
                    .await?;
            }
            if self.cache.config_entry(Some(subject)).is_some() {
                self.store
                    .delete(&RegistryKey::Config {
                        subject: Some(subject.to_string()),
                    })
                    .await?;
            }
        }
        info!(subject = %subject, versions = ?deleted_versions, permanent = permanent, "Deleted subject");
        Ok(deleted_versions)
    }

    pub async fn delete_subject_or_forward(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
        permanent: bool,
    ) -> RegistryResult<Vec<u32>> {
        let lock = self.store.lock_for(subject);
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.delete_subject(subject, permanent).await
        } else if let Some(client) = self.leader_client() {
            client.delete_subject(headers, subject, permanent).await
        } else {
            Err(RegistryError::UnknownLeader("Delete subject request".into()))
        }
    }

    // ========================================================================
    // Config
    // ========================================================================

    /// Explicitly-set config for a scope (`None` = global)
    pub fn get_config(&self, subject: Option<&str>) -> Option<ConfigValue> {
        self.cache.config_entry(subject)
    }

    /// Effective config for a subject: subject-specific, else global, else
    /// defaults; a missing compatibility level inherits the global default
    pub fn config_in_scope(&self, subject: &str) -> ConfigValue {
        let global = self.cache.config_entry(None);
        let global_level = global
            .as_ref()
            .and_then(|c| c.compatibility_level)
            .unwrap_or(self.config.compatibility_level);
        let mut config = self
            .cache
            .config_entry(Some(subject))
            .or(global)
            .unwrap_or_default();
        if config.compatibility_level.is_none() {
            config.compatibility_level = Some(global_level);
        }
        config
    }

    /// Merge-and-write a config update; new non-null fields win
    pub async fn update_config(
        &self,
        subject: Option<&str>,
        new_config: ConfigValue,
    ) -> RegistryResult<()> {
        if let Some(subject) = subject {
            if self.mode_in_scope(subject).is_read_only() {
                return Err(RegistryError::OperationNotPermitted(format!(
                    "Subject {} is in read-only mode",
                    subject
                )));
            }
        }
        self.store
            .wait_until_reader_reaches_last_offset(subject, self.config.store_timeout())
            .await?;
        let key = RegistryKey::Config {
            subject: subject.map(str::to_string),
        };
        let old = self.cache.config_entry(subject);
        let merged = ConfigValue::update(old.as_ref(), new_config);
        self.store.put(&key, &RegistryValue::Config(merged)).await?;
        debug!(subject = ?subject, "Wrote config");
        Ok(())
    }

    pub async fn update_config_or_forward(
        &self,
        headers: &HashMap<String, String>,
        subject: Option<&str>,
        new_config: ConfigValue,
    ) -> RegistryResult<()> {
        let lock = self.store.lock_for(subject.unwrap_or_default());
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.update_config(subject, new_config).await
        } else if let Some(client) = self.leader_client() {
            client.update_config(headers, subject, &new_config).await
        } else {
            Err(RegistryError::UnknownLeader("Update config request".into()))
        }
    }

    pub async fn delete_config(&self, subject: Option<&str>) -> RegistryResult<()> {
        if let Some(subject) = subject {
            if self.mode_in_scope(subject).is_read_only() {
                return Err(RegistryError::OperationNotPermitted(format!(
                    "Subject {} is in read-only mode",
                    subject
                )));
            }
        }
        self.store
            .wait_until_reader_reaches_last_offset(subject, self.config.store_timeout())
            .await?;
        self.store
            .delete(&RegistryKey::Config {
                subject: subject.map(str::to_string),
            })
            .await
    }

    pub async fn delete_config_or_forward(
        &self,
        headers: &HashMap<String, String>,
        subject: Option<&str>,
    ) -> RegistryResult<()> {
        let lock = self.store.lock_for(subject.unwrap_or_default());
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.delete_config(subject).await
        } else if let Some(client) = self.leader_client() {
            client.delete_config(headers, subject).await
        } else {
            Err(RegistryError::UnknownLeader("Delete config request".into()))
        }
    }

    // ========================================================================
    // Mode
    // ========================================================================

    /// Effective mode for a subject; a global READONLY_OVERRIDE wins over
    /// everything
    pub fn mode_in_scope(&self, subject: &str) -> Mode {
        let global = self.cache.mode_entry(None).unwrap_or_default();
        if global == Mode::ReadonlyOverride {
            return global;
        }
        self.cache.mode_entry(Some(subject)).unwrap_or(global)
    }

    /// Explicitly-set mode for a scope (`None` = global)
    pub fn get_mode(&self, subject: Option<&str>) -> Option<Mode> {
        self.cache.mode_entry(subject)
    }

    pub async fn set_mode(
        &self,
        subject: Option<&str>,
        mode: Mode,
        force: bool,
    ) -> RegistryResult<()> {
        if !self.config.mode_mutability {
            return Err(RegistryError::OperationNotPermitted(
                "Mode changes are not allowed".into(),
            ));
        }
        self.store
            .wait_until_reader_reaches_last_offset(subject, self.config.store_timeout())
            .await?;

        let scope_mode = match subject {
            Some(s) => self.mode_in_scope(s),
            None => self.cache.mode_entry(None).unwrap_or_default(),
        };
        if mode == Mode::Import && scope_mode != Mode::Import && !force {
            // Importing requires a clean slate for the matching subjects
            if !self
                .cache
                .subjects(subject.unwrap_or_default(), false)
                .is_empty()
            {
                return Err(RegistryError::OperationNotPermitted(
                    "Cannot import since found existing subjects".into(),
                ));
            }
            if let Some(subject) = subject {
                // Evict deleted-schema state so imported ids cannot collide
                // with resurrected ones
                self.store
                    .put(
                        &RegistryKey::ClearSubject {
                            subject: subject.to_string(),
                        },
                        &RegistryValue::ClearSubject(ClearSubjectValue {
                            subject: subject.to_string(),
                        }),
                    )
                    .await?;
            }
        }

        self.store
            .put(
                &RegistryKey::Mode {
                    subject: subject.map(str::to_string),
                },
                &RegistryValue::Mode(ModeValue {
                    subject: subject.map(str::to_string),
                    mode,
                }),
            )
            .await?;
        debug!(subject = ?subject, mode = %mode, "Wrote mode");
        Ok(())
    }

    pub async fn set_mode_or_forward(
        &self,
        headers: &HashMap<String, String>,
        subject: Option<&str>,
        mode: Mode,
        force: bool,
    ) -> RegistryResult<()> {
        let lock = self.store.lock_for(subject.unwrap_or_default());
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.set_mode(subject, mode, force).await
        } else if let Some(client) = self.leader_client() {
            client.set_mode(headers, subject, mode, force).await
        } else {
            Err(RegistryError::UnknownLeader("Update mode request".into()))
        }
    }

    pub async fn delete_subject_mode(&self, subject: &str) -> RegistryResult<()> {
        if !self.config.mode_mutability {
            return Err(RegistryError::OperationNotPermitted(
                "Mode changes are not allowed".into(),
            ));
        }
        self.store
            .wait_until_reader_reaches_last_offset(Some(subject), self.config.store_timeout())
            .await?;
        self.store
            .delete(&RegistryKey::Mode {
                subject: Some(subject.to_string()),
            })
            .await
    }

    pub async fn delete_subject_mode_or_forward(
        &self,
        headers: &HashMap<String, String>,
        subject: &str,
    ) -> RegistryResult<()> {
        let lock = self.store.lock_for(subject);
        let _guard = lock.lock().await;
        if self.is_leader() {
            self.delete_subject_mode(subject).await
        } else if let Some(client) = self.leader_client() {
            client.delete_subject_mode(headers, subject).await
        } else {
            Err(RegistryError::UnknownLeader("Delete mode request".into()))
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn leader_client(&self) -> Option<Arc<LeaderClient>> {
        self.leader_client.read().clone()
    }

    pub fn schema_types(&self) -> Vec<crate::types::SchemaType> {
        self.providers.schema_types()
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }
}

enum DedupOutcome {
    /// The identical schema is already live under this subject
    AlreadyRegistered(u32),
    /// The content owns this id elsewhere; reuse it for the new placement
    ReuseId(u32),
}

#[async_trait::async_trait]
impl LeaderChangeListener for SchemaRegistry {
    /// Learn the current leader. When this node is promoted it must not
    /// assign ids before catching up: the last written offset is invalidated,
    /// the producer epoch is taken (fencing the previous leader), the reader
    /// catches up to the tail, and only then is the id generator re-seeded.
    async fn set_leader(&self, new_leader: Option<RegistryIdentity>) -> RegistryResult<()> {
        debug!(leader = ?new_leader.as_ref().map(|l| l.url()), "Setting leader");
        let leader_lock = self.store.leader_lock();
        let _guard = leader_lock.lock().await;

        let (is_leader, leader_changed) = self.handle_leader_change(new_leader)?;

        if !is_leader {
            // Covers both a handover to another node and leader loss (`None`):
            // in-flight writes on this node must start failing as NotLeader
            self.store.resign_leadership();
        }

        if leader_changed {
            if is_leader {
                self.store.mark_last_written_offset_invalid().await;
                self.store.assume_leadership().await?;
                self.store
                    .wait_until_reader_reaches_last_offset(None, self.config.init_timeout())
                    .await
                    .map_err(|e| {
                        RegistryError::Store(format!("Exception getting latest offset: {}", e))
                    })?;
                self.id_generator.init().await?;
                info!(identity = %self.my_identity, "Now acting as leader");
            }

            for observer in self.leader_observers.read().iter() {
                observer(is_leader);
            }
        }
        Ok(())
    }
}
