//! Scopegate - RBAC-aware aggregating gateway for the Kubernetes API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scopegate::aggregate::Aggregator;
use scopegate::config::{GatewayConfig, ResolverMode, DEFAULT_BIND};
use scopegate::gateway::{self, GatewayState};
use scopegate::perms::{
    AccessResolver, ApiRoleSource, BindingWatcher, CachedResolver, PermissionStore, ProbeResolver,
};

/// Scopegate - RBAC-aware aggregating gateway for the Kubernetes API
#[derive(Parser, Debug)]
#[command(name = "scopegate", version, about, long_about = None)]
struct Cli {
    /// Service-account name whose permissions the gateway tracks
    #[arg(long, env = "SCOPEGATE_IDENTITY")]
    identity: String,

    /// Address to serve the gateway on
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Permission resolution strategy
    #[arg(long, value_enum, default_value_t = ResolverMode::Cache)]
    resolver: ResolverMode,

    /// Per-namespace upstream call timeout in seconds during synthesis
    /// (unbounded when unset)
    #[arg(long)]
    namespace_timeout_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> GatewayConfig {
        GatewayConfig {
            identity: self.identity,
            bind: self.bind,
            resolver: self.resolver,
            namespace_timeout: self.namespace_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Cli::parse().into_config();
    info!(
        identity = %config.identity,
        resolver = ?config.resolver,
        "starting gateway"
    );

    let client = kube::Client::try_default().await?;

    let resolver: Arc<dyn AccessResolver> = match config.resolver {
        ResolverMode::Cache => {
            let store = Arc::new(PermissionStore::new(config.identity.clone()));
            let roles = Arc::new(ApiRoleSource::new(client.clone()));
            let watcher = BindingWatcher::new(store.clone(), roles);

            let watcher_client = client.clone();
            tokio::spawn(async move {
                // the watch streams only end on unrecoverable failure;
                // without them the cache silently goes stale
                if let Err(e) = watcher.run(watcher_client).await {
                    error!(error = %e, "binding watcher exited");
                    std::process::exit(1);
                }
            });

            Arc::new(CachedResolver::new(store))
        }
        ResolverMode::Probe => Arc::new(ProbeResolver::new(client.clone())),
    };

    let aggregator = Aggregator::new(client.clone(), resolver, config.namespace_timeout);
    let state = Arc::new(GatewayState { client, aggregator });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    gateway::serve(listener, state).await?;
    Ok(())
}
