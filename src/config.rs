//! Gateway configuration

use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;

/// Default listen address, matching the upstream proxy convention.
pub const DEFAULT_BIND: &str = "127.0.0.1:8001";

/// Which permission resolution strategy the gateway runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResolverMode {
    /// Binding-cache resolver: watch RBAC bindings, answer from memory.
    Cache,
    /// Probe resolver: live `SelfSubjectAccessReview` per question.
    Probe,
}

/// Startup configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Service-account name whose permissions the gateway tracks.
    pub identity: String,
    /// Address to serve on.
    pub bind: SocketAddr,
    /// Permission resolution strategy.
    pub resolver: ResolverMode,
    /// Optional bound on each per-namespace upstream call during synthesis.
    pub namespace_timeout: Option<Duration>,
}

impl GatewayConfig {
    /// Config with the given identity and default everything else.
    pub fn for_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            bind: DEFAULT_BIND.parse().expect("default bind address is valid"),
            resolver: ResolverMode::Cache,
            namespace_timeout: None,
        }
    }
}
