//! Global schema id generation.
//!
//! Ids are assigned only on the leader, after it has caught up with the log
//! tail. The incrementing generator seeds itself from the largest id the
//! cache has observed; races around a leader transition are caught by the
//! uniqueness re-check in the registration loop and retried.

use crate::error::{RegistryError, RegistryResult};
use crate::store::{LookupCache, SchemaValue};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::info;

/// Hands out globally unique, monotonically increasing schema ids
#[async_trait::async_trait]
pub trait IdGenerator: Send + Sync {
    /// Re-seed after a transition into leadership. No id may be assigned by
    /// this node before init completes.
    async fn init(&self) -> RegistryResult<()>;

    /// Next id for the schema about to be written
    async fn id(&self, value: &SchemaValue) -> RegistryResult<u32>;

    /// Largest id this generator has observed or produced
    fn max_id(&self) -> u32;
}

/// Default incremental generator backed by the lookup cache
pub struct IncrementingIdGenerator {
    cache: Arc<LookupCache>,
    next: AtomicU32,
    ready: AtomicBool,
}

impl IncrementingIdGenerator {
    pub fn new(cache: Arc<LookupCache>) -> Self {
        Self {
            cache,
            next: AtomicU32::new(1),
            ready: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl IdGenerator for IncrementingIdGenerator {
    async fn init(&self) -> RegistryResult<()> {
        let max = self.cache.max_id();
        self.next.store(max + 1, Ordering::SeqCst);
        self.ready.store(true, Ordering::SeqCst);
        info!(next_id = max + 1, "Id generator seeded");
        Ok(())
    }

    async fn id(&self, _value: &SchemaValue) -> RegistryResult<u32> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(RegistryError::IdGeneration(
                "Id generator not initialized on this node".to_string(),
            ));
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn max_id(&self) -> u32 {
        self.next.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RegistryKey, RegistryValue};
    use crate::types::SchemaType;

    fn schema_value(subject: &str, version: u32, id: u32) -> SchemaValue {
        SchemaValue {
            subject: subject.into(),
            version,
            id,
            schema_type: SchemaType::Avro,
            references: vec![],
            metadata: None,
            rule_set: None,
            schema: r#""string""#.into(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_requires_init() {
        let generator = IncrementingIdGenerator::new(Arc::new(LookupCache::new()));
        let err = generator
            .id(&schema_value("s", 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::IdGeneration(_)));
    }

    #[tokio::test]
    async fn test_seeds_past_observed_max() {
        let cache = Arc::new(LookupCache::new());
        cache.apply(
            &RegistryKey::schema("s", 1),
            Some(&RegistryValue::Schema(schema_value("s", 1, 41))),
        );

        let generator = IncrementingIdGenerator::new(Arc::clone(&cache));
        generator.init().await.unwrap();
        assert_eq!(generator.id(&schema_value("s", 2, 0)).await.unwrap(), 42);
        assert_eq!(generator.id(&schema_value("s", 3, 0)).await.unwrap(), 43);
        assert_eq!(generator.max_id(), 43);
    }

    #[tokio::test]
    async fn test_reinit_after_transition() {
        let cache = Arc::new(LookupCache::new());
        let generator = IncrementingIdGenerator::new(Arc::clone(&cache));
        generator.init().await.unwrap();
        assert_eq!(generator.id(&schema_value("s", 1, 0)).await.unwrap(), 1);

        // Another leader wrote ids 2..=7 while we were a follower
        cache.apply(
            &RegistryKey::schema("t", 1),
            Some(&RegistryValue::Schema(schema_value("t", 1, 7))),
        );
        generator.init().await.unwrap();
        assert_eq!(generator.id(&schema_value("s", 2, 0)).await.unwrap(), 8);
    }
}
