//! # schemalog
//!
//! A replicated, log-backed schema registry: versioned Avro, JSON Schema and
//! Protobuf definitions with compatibility enforcement, content-addressed
//! deduplication and single-leader coordination.
//!
//! ## Architecture
//!
//! All writable state lives in one compacted log of keyed records. Every
//! node consumes that log and materializes it into an in-memory
//! [`LookupCache`]; mutations execute on the single leader (or are forwarded
//! to it), reads are served locally behind an optional read barrier.
//!
//! ```text
//! client ──▶ SchemaRegistry ──(leader)──▶ LogStore.put ──▶ commit log
//!                 │                                            │
//!                 └─────────── reads ◀── LookupCache ◀── consumer (every node)
//! ```
//!
//! - [`store::LogStore`]: the durable source of truth with a fenced
//!   producer, a single-threaded consumer, noop read barriers and
//!   per-subject locks
//! - [`store::LookupCache`]: ordered materialization with id,
//!   content-address and reverse-reference indexes
//! - [`provider::SchemaProviders`]: per-type parsing, canonicalization and
//!   compatibility judgment behind a bounded parse cache
//! - [`id::IdGenerator`]: monotonically increasing global ids, re-seeded
//!   after every leader transition
//! - [`election`]: the leader-election seam; any elector with totally
//!   ordered leader changes plugs in
//! - [`SchemaRegistry`]: the orchestration core
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use schemalog::{RegistryConfig, SchemaInput, SchemaRegistry, SchemaType};
//!
//! let registry = SchemaRegistry::standalone(RegistryConfig::default()).await?;
//! let input = SchemaInput::new(
//!     SchemaType::Avro,
//!     r#"{"type":"record","name":"User","fields":[{"name":"id","type":"long"}]}"#,
//! );
//! let id = registry.register("user-value", &input, false).await?;
//! let schema = registry.get_by_id(id, "user-value")?;
//! ```
//!
//! ## Invariants
//!
//! - Versions under a subject strictly increase with registration order.
//! - Ids are globally unique; canonically equal schemas share an id, across
//!   subjects and contexts.
//! - Soft-deleted records keep their version and stay resurrectable; hard
//!   deletes tombstone the key.
//! - Replaying the log into a fresh cache reproduces the node's state.

pub mod config;
pub mod election;
pub mod error;
pub mod forward;
pub mod id;
pub mod provider;
pub mod registry;
pub mod store;
pub mod types;

pub use config::{Listener, RegistryConfig};
pub use election::{LeaderChangeListener, LeaderElector, RegistryIdentity, StaticElector};
pub use error::{error_codes, RegistryError, RegistryResult};
pub use forward::LeaderClient;
pub use id::{IdGenerator, IncrementingIdGenerator};
pub use provider::{ParsedSchema, SchemaProvider, SchemaProviders};
pub use registry::SchemaRegistry;
pub use store::{
    CommitLog, ConfigValue, LogStore, LookupCache, MemoryLog, RegistryKey, RegistryValue,
    StoreUpdateHandler,
};
pub use types::{
    CompatibilityLevel, LookupFilter, Metadata, Mode, QualifiedSubject, Rule, RuleSet, Schema,
    SchemaInput, SchemaReference, SchemaType, SubjectVersion,
};
