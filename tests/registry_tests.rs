//! End-to-end registry tests: registration semantics, deletion lifecycles,
//! contexts, modes and leader transitions over a shared log.

use schemalog::{
    CompatibilityLevel, ConfigValue, LeaderChangeListener, LookupFilter, MemoryLog, Mode,
    RegistryConfig, RegistryError, SchemaInput, SchemaRegistry, SchemaType,
};
use std::collections::HashMap;
use std::sync::Arc;

const RECORD_V1: &str =
    r#"{"type":"record","name":"R","fields":[{"name":"a","type":"int"}]}"#;
const RECORD_REQUIRED_FIELD: &str = r#"{"type":"record","name":"R","fields":[{"name":"a","type":"int"},{"name":"b","type":"string"}]}"#;
const RECORD_OPTIONAL_FIELD: &str = r#"{"type":"record","name":"R","fields":[{"name":"a","type":"int"},{"name":"b","type":"string","default":"x"}]}"#;

fn avro(schema: &str) -> SchemaInput {
    SchemaInput::new(SchemaType::Avro, schema)
}

async fn standalone() -> Arc<SchemaRegistry> {
    SchemaRegistry::standalone(RegistryConfig::default())
        .await
        .unwrap()
}

/// Two nodes over one shared log, first node leading
async fn two_nodes() -> (Arc<SchemaRegistry>, Arc<SchemaRegistry>) {
    let log = Arc::new(MemoryLog::new());
    let a = SchemaRegistry::new(
        RegistryConfig::new("node-a"),
        Arc::clone(&log) as Arc<dyn schemalog::CommitLog>,
        Vec::new(),
    );
    let b = SchemaRegistry::new(
        RegistryConfig::new("node-b"),
        log as Arc<dyn schemalog::CommitLog>,
        Vec::new(),
    );
    a.init().await.unwrap();
    b.init().await.unwrap();

    let leader = a.my_identity().clone();
    a.set_leader(Some(leader.clone())).await.unwrap();
    b.set_leader(Some(leader)).await.unwrap();
    (a, b)
}

#[tokio::test]
async fn test_register_assigns_dense_ids_and_versions() {
    let registry = standalone().await;

    let id = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    assert_eq!(id, 1);

    let schema = registry.get("sub1", 1, false).unwrap();
    assert_eq!(schema.id, 1);
    assert_eq!(schema.version, 1);
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let registry = standalone().await;

    let first = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    let second = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    assert_eq!(first, second);

    // Whitespace variations canonicalize to the same registration
    let spaced = format!(" {} ", RECORD_V1.replace(',', ", "));
    let third = registry.register("sub1", &avro(&spaced), false).await.unwrap();
    assert_eq!(first, third);

    let versions = registry.all_versions("sub1", LookupFilter::Default);
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 1);
}

#[tokio::test]
async fn test_same_schema_shares_id_across_subjects() {
    let registry = standalone().await;

    let id1 = registry.register("events-value", &avro(RECORD_V1), false).await.unwrap();
    let id2 = registry
        .register("audit-value", &avro(RECORD_V1), false)
        .await
        .unwrap();
    assert_eq!(id1, id2);

    let subjects = registry.subjects_for_id(id1, "events-value", false);
    assert_eq!(subjects, vec!["audit-value", "events-value"]);
}

#[tokio::test]
async fn test_backward_compatibility_enforced() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    // Required field without a default cannot be read from old data
    let err = registry
        .register("sub1", &avro(RECORD_REQUIRED_FIELD), false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::IncompatibleSchema(_)));

    // With a default the new reader copes, and ids keep increasing
    let id = registry
        .register("sub1", &avro(RECORD_OPTIONAL_FIELD), false)
        .await
        .unwrap();
    assert_eq!(id, 2);
    let latest = registry.latest_version("sub1").unwrap();
    assert_eq!(latest.version, 2);
}

#[tokio::test]
async fn test_compat_check_probe_does_not_write() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    let errors = registry
        .check_compatibility("sub1", &avro(RECORD_REQUIRED_FIELD))
        .unwrap();
    assert!(!errors.is_empty());

    let errors = registry
        .check_compatibility("sub1", &avro(RECORD_OPTIONAL_FIELD))
        .unwrap();
    assert!(errors.is_empty());
    assert_eq!(registry.all_versions("sub1", LookupFilter::IncludeDeleted).len(), 1);
}

#[tokio::test]
async fn test_full_transitive_checks_whole_history() {
    let registry = standalone().await;
    registry
        .update_config(
            None,
            ConfigValue {
                compatibility_level: Some(CompatibilityLevel::FullTransitive),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    registry
        .register("sub1", &avro(RECORD_OPTIONAL_FIELD), false)
        .await
        .unwrap();

    // Compatible with the latest but not with version one
    let another_required = r#"{"type":"record","name":"R","fields":[{"name":"a","type":"int"},{"name":"b","type":"string","default":"x"},{"name":"c","type":"long"}]}"#;
    let err = registry
        .register("sub1", &avro(another_required), false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::IncompatibleSchema(_)));

    let another_optional = r#"{"type":"record","name":"R","fields":[{"name":"a","type":"int"},{"name":"b","type":"string","default":"x"},{"name":"c","type":"long","default":0}]}"#;
    registry
        .register("sub1", &avro(another_optional), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_hard_delete_requires_soft_delete_first() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    let err = registry
        .delete_schema_version("sub1", 1, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RegistryError::SchemaVersionNotSoftDeleted { .. }
    ));

    registry.delete_schema_version("sub1", 1, false).await.unwrap();
    assert!(registry.get("sub1", 1, false).is_err());
    assert!(registry.get("sub1", 1, true).is_ok());

    registry.delete_schema_version("sub1", 1, true).await.unwrap();
    assert!(registry.get("sub1", 1, true).is_err());
    assert!(registry
        .all_versions("sub1", LookupFilter::IncludeDeleted)
        .is_empty());
}

#[tokio::test]
async fn test_soft_delete_then_reregister_resurrects_id() {
    let registry = standalone().await;

    let original = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    registry.delete_schema_version("sub1", 1, false).await.unwrap();

    let resurrected = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    assert_eq!(original, resurrected);

    let schema = registry.latest_version("sub1").unwrap();
    assert_eq!(schema.version, 2);

    // The superseded soft-deleted version with the same id is tombstoned
    assert!(registry.get("sub1", 1, true).is_err());
    let versions: Vec<u32> = registry
        .all_versions("sub1", LookupFilter::IncludeDeleted)
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(versions, vec![2]);
}

#[tokio::test]
async fn test_delete_subject_soft_and_hard() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    registry
        .register("sub1", &avro(RECORD_OPTIONAL_FIELD), false)
        .await
        .unwrap();

    let deleted = registry.delete_subject("sub1", false).await.unwrap();
    assert_eq!(deleted, vec![1, 2]);
    assert!(registry.list_subjects(LookupFilter::Default).is_empty());
    assert_eq!(
        registry.list_subjects(LookupFilter::DeletedOnly),
        vec!["sub1"]
    );

    let deleted = registry.delete_subject("sub1", true).await.unwrap();
    assert_eq!(deleted, vec![1, 2]);
    assert!(registry
        .all_versions("sub1", LookupFilter::IncludeDeleted)
        .is_empty());
}

#[tokio::test]
async fn test_hard_delete_subject_requires_soft_delete() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    let err = registry.delete_subject("sub1", true).await.unwrap_err();
    assert!(matches!(err, RegistryError::SubjectNotSoftDeleted(_)));
}

#[tokio::test]
async fn test_referenced_version_cannot_be_deleted() {
    let registry = standalone().await;

    let address =
        r#"{"type":"record","name":"Address","fields":[{"name":"city","type":"string"}]}"#;
    registry.register("address", &avro(address), false).await.unwrap();

    let user = r#"{"type":"record","name":"User","fields":[{"name":"addr","type":"Address"}]}"#;
    let input = avro(user).with_references(vec![schemalog::SchemaReference::new(
        "Address", "address", 1,
    )]);
    let user_id = registry.register("user", &input, false).await.unwrap();

    assert_eq!(registry.referenced_by("address", 1), vec![user_id]);
    let err = registry
        .delete_schema_version("address", 1, false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::ReferenceExists(_)));

    // Releasing the referrer unblocks the referent
    registry.delete_schema_version("user", 1, false).await.unwrap();
    registry.delete_schema_version("address", 1, false).await.unwrap();
}

#[tokio::test]
async fn test_contexts_partition_subjects_and_share_ids() {
    let registry = standalone().await;

    let id = registry
        .register(":.ctx:sub1", &avro(RECORD_V1), false)
        .await
        .unwrap();

    // The context marker record appeared
    assert_eq!(registry.list_contexts(), vec!["ctx"]);

    // A bare lookup with no default-context match resolves into the context
    let schema = registry.get_by_id(id, "sub1").unwrap();
    assert_eq!(schema.subject, ":.ctx:sub1");

    // Same content in the default context reuses the global id
    let default_id = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    assert_eq!(default_id, id);

    let qualified = registry.list_subjects_with_prefix(":.ctx:", LookupFilter::Default);
    assert_eq!(qualified, vec![":.ctx:sub1"]);
}

#[tokio::test]
async fn test_import_mode_accepts_caller_identity() {
    let registry = standalone().await;

    registry.set_mode(Some("sub2"), Mode::Import, false).await.unwrap();

    let input = avro(RECORD_V1).with_id(100).with_version(5);
    let id = registry.register("sub2", &input, false).await.unwrap();
    assert_eq!(id, 100);

    let schema = registry.get("sub2", 5, false).unwrap();
    assert_eq!(schema.id, 100);

    // Same id with different content is an overwrite attempt
    let clash = avro(RECORD_OPTIONAL_FIELD).with_id(100).with_version(6);
    let err = registry.register("sub2", &clash, false).await.unwrap_err();
    assert!(matches!(err, RegistryError::OperationNotPermitted(_)));
}

#[tokio::test]
async fn test_caller_id_requires_import_mode() {
    let registry = standalone().await;
    let input = avro(RECORD_V1).with_id(100);
    let err = registry.register("sub1", &input, false).await.unwrap_err();
    assert!(matches!(err, RegistryError::OperationNotPermitted(_)));
}

#[tokio::test]
async fn test_import_mode_requires_clean_slate() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    let err = registry
        .set_mode(Some("sub1"), Mode::Import, false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::OperationNotPermitted(_)));

    // Forcing skips the emptiness check
    registry.set_mode(Some("sub1"), Mode::Import, true).await.unwrap();
    assert_eq!(registry.get_mode(Some("sub1")), Some(Mode::Import));
}

#[tokio::test]
async fn test_readonly_mode_rejects_mutations() {
    let registry = standalone().await;
    registry.set_mode(Some("sub1"), Mode::Readonly, false).await.unwrap();

    let err = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap_err();
    assert!(matches!(err, RegistryError::OperationNotPermitted(_)));

    // A global override locks every subject, set or not
    registry
        .set_mode(None, Mode::ReadonlyOverride, false)
        .await
        .unwrap();
    let err = registry.register("other", &avro(RECORD_V1), false).await.unwrap_err();
    assert!(matches!(err, RegistryError::OperationNotPermitted(_)));
}

#[tokio::test]
async fn test_mode_mutability_can_be_disabled() {
    let registry =
        SchemaRegistry::standalone(RegistryConfig::default().with_mode_mutability(false))
            .await
            .unwrap();
    let err = registry
        .set_mode(Some("sub1"), Mode::Readonly, false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::OperationNotPermitted(_)));
}

#[tokio::test]
async fn test_subject_config_overrides_and_inherits() {
    let registry = standalone().await;

    // Subject override beats the global default
    registry
        .update_config(
            Some("sub1"),
            ConfigValue {
                compatibility_level: Some(CompatibilityLevel::None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    registry
        .register("sub1", &avro(RECORD_REQUIRED_FIELD), false)
        .await
        .unwrap();

    // Updates merge field-wise: the level survives a group-only update
    registry
        .update_config(
            Some("sub1"),
            ConfigValue {
                compatibility_group: Some("app".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let config = registry.get_config(Some("sub1")).unwrap();
    assert_eq!(config.compatibility_level, Some(CompatibilityLevel::None));
    assert_eq!(config.compatibility_group.as_deref(), Some("app"));

    // Unconfigured subjects inherit the global default
    let effective = registry.config_in_scope("unconfigured");
    assert_eq!(
        effective.compatibility_level,
        Some(CompatibilityLevel::Backward)
    );

    registry.delete_config(Some("sub1")).await.unwrap();
    assert!(registry.get_config(Some("sub1")).is_none());
}

#[tokio::test]
async fn test_soft_deleting_last_version_drops_subject_config() {
    let registry = standalone().await;
    registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    registry
        .update_config(
            Some("sub1"),
            ConfigValue {
                compatibility_level: Some(CompatibilityLevel::None),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    registry.delete_schema_version("sub1", 1, false).await.unwrap();
    assert!(registry.get_config(Some("sub1")).is_none());
    assert_eq!(registry.get_mode(Some("sub1")), None);
}

#[tokio::test]
async fn test_lookup_by_content_under_subject() {
    let registry = standalone().await;
    let id = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    let found = registry
        .lookup_schema_under_subject("sub1", &avro(RECORD_V1), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(found.id, id);
    assert_eq!(found.version, 1);

    assert!(registry
        .lookup_schema_under_subject("sub1", &avro(RECORD_OPTIONAL_FIELD), false, false)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_id_and_version_lookups_agree() {
    let registry = standalone().await;
    let id = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    let by_id = registry.get_by_id(id, "sub1").unwrap();
    let by_version = registry.get("sub1", by_id.version, false).unwrap();
    assert_eq!(by_id.schema, by_version.schema);
    assert_eq!(by_id.id, by_version.id);
}

#[tokio::test]
async fn test_latest_with_metadata() {
    let registry = standalone().await;

    let mut prod = schemalog::Metadata::default();
    prod.properties.insert("env".into(), "prod".into());
    registry
        .register("sub1", &avro(RECORD_V1).with_metadata(prod), false)
        .await
        .unwrap();

    let mut staging = schemalog::Metadata::default();
    staging.properties.insert("env".into(), "staging".into());
    registry
        .register(
            "sub1",
            &avro(RECORD_OPTIONAL_FIELD).with_metadata(staging),
            false,
        )
        .await
        .unwrap();

    let mut wanted = HashMap::new();
    wanted.insert("env".to_string(), "prod".to_string());
    let found = registry.latest_with_metadata("sub1", &wanted, false).unwrap();
    assert_eq!(found.version, 1);

    wanted.insert("env".to_string(), "staging".to_string());
    let found = registry.latest_with_metadata("sub1", &wanted, false).unwrap();
    assert_eq!(found.version, 2);

    wanted.insert("env".to_string(), "absent".to_string());
    assert!(registry.latest_with_metadata("sub1", &wanted, false).is_err());
}

#[tokio::test]
async fn test_empty_input_copies_previous_version() {
    let registry = standalone().await;
    let first = registry.register("sub1", &avro(RECORD_V1), false).await.unwrap();

    // Metadata-only update: no schema body, new metadata, same schema text
    let mut meta = schemalog::Metadata::default();
    meta.properties.insert("owner".into(), "team-b".into());
    let input = SchemaInput::default().with_metadata(meta);
    let second = registry.register("sub1", &input, false).await.unwrap();
    assert_ne!(first, second);

    let v2 = registry.get("sub1", 2, false).unwrap();
    assert_eq!(v2.schema, registry.get("sub1", 1, false).unwrap().schema);
    assert_eq!(
        v2.metadata.unwrap().properties.get("owner").map(String::as_str),
        Some("team-b")
    );
}

#[tokio::test]
async fn test_empty_input_without_previous_version_fails() {
    let registry = standalone().await;
    let err = registry
        .register("sub1", &SchemaInput::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidSchema(_)));
}

#[tokio::test]
async fn test_metadata_inherited_from_previous_version() {
    let registry = standalone().await;

    let mut meta = schemalog::Metadata::default();
    meta.properties.insert("owner".into(), "team-a".into());
    registry
        .register("sub1", &avro(RECORD_V1).with_metadata(meta), false)
        .await
        .unwrap();
    registry
        .register("sub1", &avro(RECORD_OPTIONAL_FIELD), false)
        .await
        .unwrap();

    // A registration without metadata inherits the previous version's
    let v2 = registry.get("sub1", 2, false).unwrap();
    assert_eq!(
        v2.metadata.unwrap().properties.get("owner").map(String::as_str),
        Some("team-a")
    );
}

// ============================================================================
// Multi-node behavior
// ============================================================================

#[tokio::test]
async fn test_follower_rejects_direct_writes() {
    let (_leader, follower) = two_nodes().await;
    let err = follower
        .register("sub1", &avro(RECORD_V1), false)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotLeader));
}

#[tokio::test]
async fn test_unknown_leader_surfaces_on_forward() {
    let log = Arc::new(MemoryLog::new());
    let node = SchemaRegistry::new(
        RegistryConfig::new("node-a"),
        log as Arc<dyn schemalog::CommitLog>,
        Vec::new(),
    );
    node.init().await.unwrap();

    let err = node
        .register_or_forward("sub1", &avro(RECORD_V1), false, &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::UnknownLeader(_)));
}

#[tokio::test]
async fn test_followers_observe_leader_writes() {
    let (leader, follower) = two_nodes().await;

    let id = leader.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    follower
        .store()
        .wait_until_reader_reaches_last_offset(Some("sub1"), std::time::Duration::from_secs(5))
        .await
        .unwrap();

    let schema = follower.get("sub1", 1, false).unwrap();
    assert_eq!(schema.id, id);
}

#[tokio::test]
async fn test_promoted_leader_continues_id_sequence() {
    let (a, b) = two_nodes().await;

    a.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    let max_before_promotion = a
        .register("sub2", &avro(RECORD_OPTIONAL_FIELD), false)
        .await
        .unwrap();

    // Leadership moves to b; a's producer epoch is fenced
    let new_leader = b.my_identity().clone();
    a.set_leader(Some(new_leader.clone())).await.unwrap();
    b.set_leader(Some(new_leader)).await.unwrap();

    let err = a.register("sub3", &avro(RECORD_V1), false).await.unwrap_err();
    assert!(matches!(err, RegistryError::NotLeader));

    let next_id = b
        .register("sub3", &avro(RECORD_REQUIRED_FIELD), false)
        .await
        .unwrap();
    assert!(next_id > max_before_promotion);
}

#[tokio::test]
async fn test_register_or_forward_dedups_locally() {
    let (leader, follower) = two_nodes().await;

    let id = leader.register("sub1", &avro(RECORD_V1), false).await.unwrap();
    follower
        .store()
        .wait_until_reader_reaches_last_offset(Some("sub1"), std::time::Duration::from_secs(5))
        .await
        .unwrap();

    // The follower answers identical registrations from its own cache
    // without forwarding
    let answered = follower
        .register_or_forward("sub1", &avro(RECORD_V1), false, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(answered, id);
}
