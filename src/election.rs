//! Leader election seam and node identity.
//!
//! The registry requires only two things from an elector: at most one node
//! believes itself leader at a time from the log's perspective (upheld by the
//! producer epoch fencing, whatever the election transport), and leader
//! changes arrive totally ordered through the [`LeaderChangeListener`]
//! callback. [`StaticElector`] covers standalone deployments and tests;
//! group-coordination electors plug in behind the same trait.

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use tracing::info;

/// Identity a node advertises to its peers: where forwarded requests go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryIdentity {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Whether this node may become leader
    #[serde(default = "default_eligibility")]
    pub leader_eligibility: bool,
}

fn default_eligibility() -> bool {
    true
}

impl RegistryIdentity {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            leader_eligibility: true,
        }
    }

    /// Resolve this node's inter-instance identity from its listeners: the
    /// named listener wins, else the last listener with the configured
    /// scheme, else the bare host.
    pub fn from_config(config: &RegistryConfig) -> Self {
        if let Some(name) = &config.inter_instance_listener_name {
            if let Some(l) = config
                .listeners
                .iter()
                .find(|l| l.name.as_deref() == Some(name.as_str()))
            {
                return Self {
                    scheme: l.scheme.clone(),
                    host: l.host.clone(),
                    port: l.port,
                    leader_eligibility: config.leader_eligibility,
                };
            }
        }
        if let Some(l) = config
            .listeners
            .iter()
            .filter(|l| l.scheme == config.inter_instance_scheme)
            .next_back()
        {
            return Self {
                scheme: l.scheme.clone(),
                host: l.host.clone(),
                port: l.port,
                leader_eligibility: config.leader_eligibility,
            };
        }
        Self {
            scheme: config.inter_instance_scheme.clone(),
            host: config.host.clone(),
            port: config.listeners.first().map(|l| l.port).unwrap_or(8081),
            leader_eligibility: config.leader_eligibility,
        }
    }

    /// Base URL forwarded requests are sent to
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::fmt::Display for RegistryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

/// Callback a registry node implements to learn about leader changes;
/// `None` means no leader is alive
#[async_trait::async_trait]
pub trait LeaderChangeListener: Send + Sync {
    async fn set_leader(&self, leader: Option<RegistryIdentity>) -> RegistryResult<()>;
}

/// Elects at most one leader among eligible nodes
#[async_trait::async_trait]
pub trait LeaderElector: Send + Sync {
    async fn init(&self) -> RegistryResult<()>;
    async fn close(&self);
}

/// Fixed-leader elector for standalone deployments: announces the configured
/// identity (usually this node's own) once at init. Holds the listener
/// non-owning, since the listener typically owns the elector.
pub struct StaticElector {
    leader: RegistryIdentity,
    listener: Weak<dyn LeaderChangeListener>,
}

impl StaticElector {
    pub fn new(leader: RegistryIdentity, listener: Weak<dyn LeaderChangeListener>) -> Self {
        Self { leader, listener }
    }
}

#[async_trait::async_trait]
impl LeaderElector for StaticElector {
    async fn init(&self) -> RegistryResult<()> {
        info!(leader = %self.leader.url(), "Static election");
        let listener = self.listener.upgrade().ok_or_else(|| {
            RegistryError::Initialization("Leader change listener is gone".to_string())
        })?;
        listener.set_leader(Some(self.leader.clone())).await
    }

    async fn close(&self) {}
}
