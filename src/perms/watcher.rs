//! Binding-cache resolver
//!
//! Watches ClusterRoleBinding and RoleBinding objects and keeps the
//! [`PermissionStore`] synchronized with the grants they give the tracked
//! identity. All writes to the store happen on the single task running
//! [`BindingWatcher::run`]; request handlers only read.
//!
//! The kube watcher delivers only the new state of an object, so the
//! watcher remembers, per binding, the grant it last applied for the
//! identity. A binding that newly names the identity has its role resolved
//! and merged; a binding that stops naming it (update or delete) has its
//! remembered grant revoked; an update that leaves membership unchanged is
//! a no-op - role edits do not retrigger resolution (bindings are the only
//! change source, matching the upstream semantics this reproduces).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject,
};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::perms::store::{Grant, PermissionStore};

/// Subject kind that identifies service accounts in binding subject lists.
const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";

/// Source of role rules for binding resolution.
///
/// Abstracted so the watcher's transition logic can be tested without a
/// cluster; the live implementation is [`ApiRoleSource`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleSource: Send + Sync {
    /// Rules of the named ClusterRole.
    async fn cluster_role_rules(&self, name: &str) -> Result<Vec<PolicyRule>, Error>;

    /// Rules of the named Role in `namespace`.
    async fn role_rules(&self, namespace: &str, name: &str) -> Result<Vec<PolicyRule>, Error>;
}

/// [`RoleSource`] backed by the Kubernetes API.
pub struct ApiRoleSource {
    client: Client,
}

impl ApiRoleSource {
    /// Create a role source using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RoleSource for ApiRoleSource {
    async fn cluster_role_rules(&self, name: &str) -> Result<Vec<PolicyRule>, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let role = api.get(name).await?;
        Ok(role.rules.unwrap_or_default())
    }

    async fn role_rules(&self, namespace: &str, name: &str) -> Result<Vec<PolicyRule>, Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        let role = api.get(name).await?;
        Ok(role.rules.unwrap_or_default())
    }
}

/// Keeps the permission store synchronized with RBAC binding objects.
pub struct BindingWatcher {
    store: Arc<PermissionStore>,
    roles: Arc<dyn RoleSource>,
    /// ClusterRoleBinding name -> grant currently applied for it
    cluster_applied: HashMap<String, Grant>,
    /// (namespace, RoleBinding name) -> grant currently applied for it
    namespaced_applied: HashMap<(String, String), Grant>,
}

impl BindingWatcher {
    /// Create a watcher feeding `store`, resolving roles through `roles`.
    pub fn new(store: Arc<PermissionStore>, roles: Arc<dyn RoleSource>) -> Self {
        Self {
            store,
            roles,
            cluster_applied: HashMap::new(),
            namespaced_applied: HashMap::new(),
        }
    }

    /// Watch both binding kinds and apply changes to the store. Blocks for
    /// the lifetime of the process; returning means both watch streams
    /// ended, which the caller should treat as fatal.
    pub async fn run(mut self, client: Client) -> Result<(), Error> {
        let crb_api: Api<ClusterRoleBinding> = Api::all(client.clone());
        let rb_api: Api<RoleBinding> = Api::all(client);

        let crb_events = watcher::watcher(crb_api, watcher::Config::default()).default_backoff();
        let rb_events = watcher::watcher(rb_api, watcher::Config::default()).default_backoff();
        tokio::pin!(crb_events, rb_events);

        info!(
            identity = self.store.identity(),
            "watching cluster role bindings and role bindings"
        );

        loop {
            tokio::select! {
                event = crb_events.next() => match event {
                    Some(Ok(event)) => self.on_cluster_event(event).await,
                    Some(Err(e)) => warn!(error = %e, "ClusterRoleBinding watch error"),
                    None => break,
                },
                event = rb_events.next() => match event {
                    Some(Ok(event)) => self.on_namespaced_event(event).await,
                    Some(Err(e)) => warn!(error = %e, "RoleBinding watch error"),
                    None => break,
                },
            }
        }

        Err(Error::upstream("binding watch streams ended"))
    }

    async fn on_cluster_event(&mut self, event: Event<ClusterRoleBinding>) {
        match event {
            Event::Apply(binding) | Event::InitApply(binding) => {
                self.apply_cluster_binding(binding).await;
            }
            Event::Delete(binding) => {
                let name = binding.name_any();
                if let Some(previous) = self.cluster_applied.remove(&name) {
                    self.store.revoke_cluster(&previous);
                    info!(binding = %name, "revoked cluster grant for deleted binding");
                }
            }
            Event::Init => {
                // relist: contributions are rebuilt from InitApply events
                self.cluster_applied.clear();
                self.store.reset_cluster();
            }
            Event::InitDone => {
                debug!("cluster role binding cache synced");
            }
        }
    }

    async fn on_namespaced_event(&mut self, event: Event<RoleBinding>) {
        match event {
            Event::Apply(binding) | Event::InitApply(binding) => {
                self.apply_namespaced_binding(binding).await;
            }
            Event::Delete(binding) => {
                let key = (binding.namespace().unwrap_or_default(), binding.name_any());
                if let Some(previous) = self.namespaced_applied.remove(&key) {
                    self.store.revoke_namespaced(&key.0, &previous);
                    info!(namespace = %key.0, binding = %key.1, "revoked namespace grant for deleted binding");
                }
            }
            Event::Init => {
                self.namespaced_applied.clear();
                self.store.reset_namespaced();
            }
            Event::InitDone => {
                debug!("role binding cache synced");
            }
        }
    }

    async fn apply_cluster_binding(&mut self, binding: ClusterRoleBinding) {
        let name = binding.name_any();
        let names_identity =
            subjects_name_identity(binding.subjects.as_deref(), self.store.identity());

        match (self.cluster_applied.contains_key(&name), names_identity) {
            (false, true) => {
                let grant = self.resolve_cluster_grant(&binding).await;
                if !grant.is_empty() {
                    self.store.merge_cluster(&grant);
                }
                info!(binding = %name, "applied cluster grant");
                self.cluster_applied.insert(name, grant);
            }
            (true, false) => {
                if let Some(previous) = self.cluster_applied.remove(&name) {
                    self.store.revoke_cluster(&previous);
                    info!(binding = %name, "identity removed from binding subjects, grant revoked");
                }
            }
            // membership unchanged: nothing to do
            _ => {}
        }
    }

    async fn apply_namespaced_binding(&mut self, binding: RoleBinding) {
        let namespace = binding.namespace().unwrap_or_default();
        let name = binding.name_any();
        let key = (namespace, name);
        let names_identity =
            subjects_name_identity(binding.subjects.as_deref(), self.store.identity());

        match (self.namespaced_applied.contains_key(&key), names_identity) {
            (false, true) => {
                let grant = self.resolve_namespaced_grant(&key.0, &binding).await;
                if !grant.is_empty() {
                    self.store.merge_namespaced(&key.0, &grant);
                }
                info!(namespace = %key.0, binding = %key.1, "applied namespace grant");
                self.namespaced_applied.insert(key, grant);
            }
            (true, false) => {
                if let Some(previous) = self.namespaced_applied.remove(&key) {
                    self.store.revoke_namespaced(&key.0, &previous);
                    info!(namespace = %key.0, binding = %key.1, "identity removed from binding subjects, grant revoked");
                }
            }
            _ => {}
        }
    }

    /// Resolve the referenced ClusterRole into a grant. Lookup failures are
    /// logged and contribute an empty grant; they never kill the watcher.
    async fn resolve_cluster_grant(&self, binding: &ClusterRoleBinding) -> Grant {
        match self.roles.cluster_role_rules(&binding.role_ref.name).await {
            Ok(rules) => Grant::from_rules(&rules),
            Err(e) => {
                warn!(
                    role = %binding.role_ref.name,
                    error = %e,
                    "failed to resolve ClusterRole, treating binding as empty grant"
                );
                Grant::default()
            }
        }
    }

    async fn resolve_namespaced_grant(&self, namespace: &str, binding: &RoleBinding) -> Grant {
        match self.roles.role_rules(namespace, &binding.role_ref.name).await {
            Ok(rules) => Grant::from_rules(&rules),
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    role = %binding.role_ref.name,
                    error = %e,
                    "failed to resolve Role, treating binding as empty grant"
                );
                Grant::default()
            }
        }
    }
}

/// True when the subject list names the tracked identity as a service
/// account.
fn subjects_name_identity(subjects: Option<&[Subject]>, identity: &str) -> bool {
    subjects.is_some_and(|subjects| {
        subjects
            .iter()
            .any(|s| s.kind == SERVICE_ACCOUNT_KIND && s.name == identity)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::rbac::v1::RoleRef;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const IDENTITY: &str = "rbac-sa";

    fn subject(kind: &str, name: &str) -> Subject {
        Subject {
            kind: kind.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn cluster_binding(name: &str, role: &str, subjects: Vec<Subject>) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: role.into(),
            },
            subjects: Some(subjects),
        }
    }

    fn role_binding(ns: &str, name: &str, role: &str, subjects: Vec<Subject>) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: role.into(),
            },
            subjects: Some(subjects),
        }
    }

    fn rule(resources: &[&str], verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            resources: Some(resources.iter().map(|s| s.to_string()).collect()),
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn watcher_with(roles: MockRoleSource) -> (BindingWatcher, Arc<PermissionStore>) {
        let store = Arc::new(PermissionStore::new(IDENTITY));
        let watcher = BindingWatcher::new(store.clone(), Arc::new(roles));
        (watcher, store)
    }

    #[test]
    fn subject_matching_requires_kind_and_name() {
        let subjects = vec![
            subject("User", IDENTITY),
            subject(SERVICE_ACCOUNT_KIND, "other-sa"),
        ];
        assert!(!subjects_name_identity(Some(&subjects), IDENTITY));

        let subjects = vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)];
        assert!(subjects_name_identity(Some(&subjects), IDENTITY));
        assert!(!subjects_name_identity(None, IDENTITY));
    }

    #[tokio::test]
    async fn cluster_binding_add_grants_every_listed_verb() {
        let mut roles = MockRoleSource::new();
        roles
            .expect_cluster_role_rules()
            .returning(|_| Ok(vec![rule(&["pods"], &["get", "list", "watch"])]));
        let (mut watcher, store) = watcher_with(roles);

        let binding = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(binding)).await;

        for verb in ["get", "list", "watch"] {
            assert!(store.allows_cluster("pods", verb), "verb {verb}");
        }
        assert!(!store.allows_cluster("pods", "delete"));
    }

    #[tokio::test]
    async fn bindings_for_other_subjects_are_ignored() {
        let mut roles = MockRoleSource::new();
        roles.expect_cluster_role_rules().never();
        let (mut watcher, store) = watcher_with(roles);

        let binding = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, "someone-else")]);
        watcher.on_cluster_event(Event::Apply(binding)).await;
        assert!(!store.allows_cluster("pods", "list"));
    }

    #[tokio::test]
    async fn delete_revokes_what_the_binding_contributed() {
        let mut roles = MockRoleSource::new();
        roles
            .expect_cluster_role_rules()
            .returning(|_| Ok(vec![rule(&["pods"], &["list"])]));
        let (mut watcher, store) = watcher_with(roles);

        let binding = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(binding.clone())).await;
        assert!(store.allows_cluster("pods", "list"));

        watcher.on_cluster_event(Event::Delete(binding)).await;
        assert!(!store.allows_cluster("pods", "list"));
    }

    #[tokio::test]
    async fn update_removing_identity_revokes_the_remembered_grant() {
        let mut roles = MockRoleSource::new();
        // resolution happens once, at apply time; revocation must not
        // re-resolve the role
        roles
            .expect_cluster_role_rules()
            .times(1)
            .returning(|_| Ok(vec![rule(&["jobs"], &["list", "watch"])]));
        let (mut watcher, store) = watcher_with(roles);

        let bound = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(bound)).await;
        assert!(store.allows_cluster("jobs", "watch"));

        let unbound = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, "other")]);
        watcher.on_cluster_event(Event::Apply(unbound)).await;
        assert!(!store.allows_cluster("jobs", "watch"));
        assert!(!store.allows_cluster("jobs", "list"));
    }

    #[tokio::test]
    async fn update_with_unchanged_membership_is_a_noop() {
        let mut roles = MockRoleSource::new();
        roles
            .expect_cluster_role_rules()
            .times(1)
            .returning(|_| Ok(vec![rule(&["pods"], &["list"])]));
        let (mut watcher, store) = watcher_with(roles);

        let binding = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(binding.clone())).await;
        // role edits are not re-resolved while membership is unchanged
        watcher.on_cluster_event(Event::Apply(binding)).await;
        assert!(store.allows_cluster("pods", "list"));
    }

    #[tokio::test]
    async fn role_lookup_failure_contributes_an_empty_grant() {
        let mut roles = MockRoleSource::new();
        roles
            .expect_cluster_role_rules()
            .returning(|_| Err(Error::permission_resolution("ClusterRole viewer not found")));
        let (mut watcher, store) = watcher_with(roles);

        let binding = cluster_binding("bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(binding.clone())).await;
        assert!(!store.allows_cluster("pods", "list"));
        // the binding is still tracked so a later delete stays consistent
        watcher.on_cluster_event(Event::Delete(binding)).await;
    }

    #[tokio::test]
    async fn role_bindings_populate_their_namespace_only() {
        let mut roles = MockRoleSource::new();
        roles
            .expect_role_rules()
            .returning(|_, _| Ok(vec![rule(&["pods"], &["list"])]));
        let (mut watcher, store) = watcher_with(roles);

        let binding = role_binding("team-a", "bind", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_namespaced_event(Event::Apply(binding.clone())).await;

        assert_eq!(store.namespaces_with("pods", "list"), vec!["team-a"]);
        assert!(!store.allows_cluster("pods", "list"));

        watcher.on_namespaced_event(Event::Delete(binding)).await;
        assert!(store.namespaces_with("pods", "list").is_empty());
    }

    #[tokio::test]
    async fn relist_resets_contributions_before_rebuilding() {
        let mut roles = MockRoleSource::new();
        roles
            .expect_cluster_role_rules()
            .returning(|_| Ok(vec![rule(&["pods"], &["list"])]));
        let (mut watcher, store) = watcher_with(roles);

        let stale = cluster_binding("gone", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(stale)).await;
        assert!(store.allows_cluster("pods", "list"));

        // relist without the old binding
        watcher.on_cluster_event(Event::Init).await;
        assert!(!store.allows_cluster("pods", "list"));

        let fresh = cluster_binding("fresh", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::InitApply(fresh)).await;
        watcher.on_cluster_event(Event::InitDone).await;
        assert!(store.allows_cluster("pods", "list"));
    }

    #[tokio::test]
    async fn overlapping_cluster_bindings_expose_the_flat_union_defect() {
        // KNOWN DEFECT (inherited, see perms::store): two bindings grant
        // pods/list; deleting one revokes the pair for both.
        let mut roles = MockRoleSource::new();
        roles
            .expect_cluster_role_rules()
            .returning(|_| Ok(vec![rule(&["pods"], &["list"])]));
        let (mut watcher, store) = watcher_with(roles);

        let a = cluster_binding("a", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        let b = cluster_binding("b", "viewer", vec![subject(SERVICE_ACCOUNT_KIND, IDENTITY)]);
        watcher.on_cluster_event(Event::Apply(a.clone())).await;
        watcher.on_cluster_event(Event::Apply(b)).await;
        assert!(store.allows_cluster("pods", "list"));

        watcher.on_cluster_event(Event::Delete(a)).await;
        // binding b still grants pods/list; the flat union lost it anyway
        assert!(!store.allows_cluster("pods", "list"));
    }
}
