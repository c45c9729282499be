//! Registry configuration

use crate::types::CompatibilityLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A listener endpoint this node exposes.
///
/// Listeners may carry a name (`internal://host:port`); the inter-instance
/// identity picks the listener named by
/// [`RegistryConfig::inter_instance_listener_name`] first, else the last
/// listener whose scheme matches [`RegistryConfig::inter_instance_scheme`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: None,
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse `scheme://host:port`; an unknown scheme is treated as a
    /// listener name with scheme `http`.
    pub fn parse(s: &str) -> Option<Self> {
        let (head, rest) = s.split_once("://")?;
        let (host, port) = rest.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        let (name, scheme) = match head.to_ascii_lowercase().as_str() {
            "http" | "https" => (None, head.to_ascii_lowercase()),
            _ => (Some(head.to_string()), "http".to_string()),
        };
        Some(Self {
            name,
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

/// Configuration for a registry node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Hostname advertised when no listener matches
    #[serde(default = "default_host")]
    pub host: String,

    /// Listeners this node exposes
    #[serde(default)]
    pub listeners: Vec<Listener>,

    /// Preferred named listener for inter-instance requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inter_instance_listener_name: Option<String>,

    /// Scheme used to pick a listener when no named match exists
    #[serde(default = "default_scheme")]
    pub inter_instance_scheme: String,

    /// Whether this node may become leader
    #[serde(default = "default_true")]
    pub leader_eligibility: bool,

    /// Defer leader election until `post_init`
    #[serde(default)]
    pub leader_election_delay: bool,

    /// Allow `set_mode` calls
    #[serde(default = "default_true")]
    pub mode_mutability: bool,

    /// Name of the backing log/topic
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Producer and read-barrier deadline in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Catch-up deadline on a leader transition in milliseconds
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Retry budget for id-collision races near leader transitions
    #[serde(default = "default_write_max_retries")]
    pub write_max_retries: u32,

    /// Largest serialized record accepted by the store
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,

    /// Parse-cache capacity (entries)
    #[serde(default = "default_schema_cache_size")]
    pub schema_cache_size: usize,

    /// Parse-cache entry lifetime in seconds
    #[serde(default = "default_schema_cache_expiry_secs")]
    pub schema_cache_expiry_secs: u64,

    /// Global default compatibility level
    #[serde(default)]
    pub compatibility_level: CompatibilityLevel,

    /// Connect timeout for forwarded leader requests in milliseconds
    #[serde(default = "default_leader_connect_timeout_ms")]
    pub leader_connect_timeout_ms: u64,

    /// Read timeout for forwarded leader requests in milliseconds
    #[serde(default = "default_leader_read_timeout_ms")]
    pub leader_read_timeout_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

fn default_topic() -> String {
    "_schemas".to_string()
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_init_timeout_ms() -> u64 {
    60_000
}

fn default_write_max_retries() -> u32 {
    5
}

fn default_max_record_bytes() -> usize {
    1_000_000
}

fn default_schema_cache_size() -> usize {
    1_000
}

fn default_schema_cache_expiry_secs() -> u64 {
    300
}

fn default_leader_connect_timeout_ms() -> u64 {
    60_000
}

fn default_leader_read_timeout_ms() -> u64 {
    60_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            listeners: Vec::new(),
            inter_instance_listener_name: None,
            inter_instance_scheme: default_scheme(),
            leader_eligibility: true,
            leader_election_delay: false,
            mode_mutability: true,
            topic: default_topic(),
            store_timeout_ms: default_store_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            write_max_retries: default_write_max_retries(),
            max_record_bytes: default_max_record_bytes(),
            schema_cache_size: default_schema_cache_size(),
            schema_cache_expiry_secs: default_schema_cache_expiry_secs(),
            compatibility_level: CompatibilityLevel::default(),
            leader_connect_timeout_ms: default_leader_connect_timeout_ms(),
            leader_read_timeout_ms: default_leader_read_timeout_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_compatibility(mut self, level: CompatibilityLevel) -> Self {
        self.compatibility_level = level;
        self
    }

    pub fn with_leader_eligibility(mut self, eligible: bool) -> Self {
        self.leader_eligibility = eligible;
        self
    }

    pub fn with_mode_mutability(mut self, mutability: bool) -> Self {
        self.mode_mutability = mutability;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn leader_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_connect_timeout_ms)
    }

    pub fn leader_read_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_read_timeout_ms)
    }

    pub fn schema_cache_expiry(&self) -> Duration {
        Duration::from_secs(self.schema_cache_expiry_secs)
    }
}
