//! Permission tracking for the gateway identity
//!
//! Two interchangeable strategies answer "may the tracked identity do
//! (verb, resource) at cluster scope, and in which namespaces?":
//!
//! - [`CachedResolver`] reads the [`PermissionStore`] kept up to date by the
//!   [`BindingWatcher`] from RBAC binding objects (no per-request I/O).
//! - [`ProbeResolver`] issues live `SelfSubjectAccessReview` probes per
//!   namespace (zero staleness, O(namespaces) round trips).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::request::ResourceRequest;

pub mod probe;
pub mod store;
pub mod watcher;

pub use probe::ProbeResolver;
pub use store::{Grant, PermissionStore, VERB_ALL};
pub use watcher::{ApiRoleSource, BindingWatcher, RoleSource};

/// Resolution strategy for the tracked identity's effective permissions.
#[async_trait]
pub trait AccessResolver: Send + Sync {
    /// Whether the identity holds `verb` on the request's resource at
    /// cluster scope.
    async fn can_cluster(&self, verb: &str, request: &ResourceRequest) -> Result<bool, Error>;

    /// The namespaces in which the identity holds `verb` on the request's
    /// resource.
    async fn permitted_namespaces(
        &self,
        verb: &str,
        request: &ResourceRequest,
    ) -> Result<Vec<String>, Error>;
}

/// Resolver backed by the binding-cache [`PermissionStore`]. Reads never
/// fail and never block on the network.
pub struct CachedResolver {
    store: Arc<PermissionStore>,
}

impl CachedResolver {
    /// Wrap a shared permission store.
    pub fn new(store: Arc<PermissionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AccessResolver for CachedResolver {
    async fn can_cluster(&self, verb: &str, request: &ResourceRequest) -> Result<bool, Error> {
        Ok(self.store.allows_cluster(&request.resource, verb))
    }

    async fn permitted_namespaces(
        &self,
        verb: &str,
        request: &ResourceRequest,
    ) -> Result<Vec<String>, Error> {
        Ok(self.store.namespaces_with(&request.resource, verb))
    }
}
