//! Permission store
//!
//! The store is the single source of truth for what the tracked identity
//! may do, at cluster scope and per namespace. It is written by exactly one
//! task (the binding watcher) and read concurrently by every request
//! handler, so all state lives behind one read/write lock and is only ever
//! reached through an owned store object shared by `Arc`.

use std::collections::{BTreeSet, HashMap};

use k8s_openapi::api::rbac::v1::PolicyRule;
use parking_lot::RwLock;

/// Wildcard verb granting every verb on a resource.
pub const VERB_ALL: &str = "*";

/// A resolved grant: plural resource name mapped to the set of allowed verbs.
///
/// A resource entry exists only while it has at least one verb; absence
/// means no grant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grant {
    resources: HashMap<String, BTreeSet<String>>,
}

impl Grant {
    /// Build a grant from RBAC policy rules by unioning, for every rule,
    /// each listed resource with every listed verb. Non-resource rules
    /// (URLs) contribute nothing.
    pub fn from_rules(rules: &[PolicyRule]) -> Self {
        let mut grant = Grant::default();
        for rule in rules {
            let Some(resources) = &rule.resources else {
                continue;
            };
            for resource in resources {
                for verb in &rule.verbs {
                    grant.insert(resource, verb);
                }
            }
        }
        grant
    }

    /// Add one (resource, verb) pair.
    pub fn insert(&mut self, resource: &str, verb: &str) {
        self.resources
            .entry(resource.to_string())
            .or_default()
            .insert(verb.to_string());
    }

    /// True when the grant allows `verb` on `resource`, honoring `*`.
    pub fn allows(&self, resource: &str, verb: &str) -> bool {
        self.resources
            .get(resource)
            .is_some_and(|verbs| verbs.contains(VERB_ALL) || verbs.contains(verb))
    }

    /// True when no resource has any verb.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Union `other` into this grant. Existing verbs are never removed or
    /// overwritten through this path.
    pub fn merge(&mut self, other: &Grant) {
        for (resource, verbs) in &other.resources {
            let entry = self.resources.entry(resource.clone()).or_default();
            for verb in verbs {
                entry.insert(verb.clone());
            }
        }
    }

    /// Remove each (resource, verb) pair of `other` from this grant,
    /// dropping resource entries that end up empty.
    ///
    /// The store keeps no per-binding provenance, so when two bindings
    /// grant the same pair, revoking one removes the pair even though the
    /// other still grants it. Inherited defect, kept deliberately; the
    /// regression test below pins it.
    pub fn revoke(&mut self, other: &Grant) {
        for (resource, verbs) in &other.resources {
            if let Some(entry) = self.resources.get_mut(resource) {
                for verb in verbs {
                    entry.remove(verb);
                }
                if entry.is_empty() {
                    self.resources.remove(resource);
                }
            }
        }
    }

    /// Iterate over (resource, verbs) entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.resources.iter()
    }
}

#[derive(Debug, Default)]
struct Scopes {
    cluster: Grant,
    namespaced: HashMap<String, Grant>,
}

/// Effective permissions of the tracked identity.
///
/// Single-writer (the binding watcher), many concurrent readers (request
/// handlers); all access goes through the interior lock.
#[derive(Debug)]
pub struct PermissionStore {
    identity: String,
    inner: RwLock<Scopes>,
}

impl PermissionStore {
    /// Create an empty store for the given identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            inner: RwLock::new(Scopes::default()),
        }
    }

    /// The service-account name this store tracks.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Union a grant into the cluster-scope permissions.
    pub fn merge_cluster(&self, grant: &Grant) {
        self.inner.write().cluster.merge(grant);
    }

    /// Remove a grant's pairs from the cluster-scope permissions.
    pub fn revoke_cluster(&self, grant: &Grant) {
        self.inner.write().cluster.revoke(grant);
    }

    /// Union a grant into one namespace's permissions.
    pub fn merge_namespaced(&self, namespace: &str, grant: &Grant) {
        if grant.is_empty() {
            return;
        }
        self.inner
            .write()
            .namespaced
            .entry(namespace.to_string())
            .or_default()
            .merge(grant);
    }

    /// Remove a grant's pairs from one namespace's permissions, dropping
    /// the namespace entry once it has no grants left.
    pub fn revoke_namespaced(&self, namespace: &str, grant: &Grant) {
        let mut scopes = self.inner.write();
        if let Some(entry) = scopes.namespaced.get_mut(namespace) {
            entry.revoke(grant);
            if entry.is_empty() {
                scopes.namespaced.remove(namespace);
            }
        }
    }

    /// Drop every cluster-scope grant (watcher relist).
    pub fn reset_cluster(&self) {
        self.inner.write().cluster = Grant::default();
    }

    /// Drop every namespace-scope grant (watcher relist).
    pub fn reset_namespaced(&self) {
        self.inner.write().namespaced.clear();
    }

    /// True when the identity holds `verb` (or `*`) on `resource` at
    /// cluster scope.
    pub fn allows_cluster(&self, resource: &str, verb: &str) -> bool {
        self.inner.read().cluster.allows(resource, verb)
    }

    /// The namespaces in which the identity holds `verb` (or `*`) on
    /// `resource`, sorted so fan-out order is deterministic.
    pub fn namespaces_with(&self, resource: &str, verb: &str) -> Vec<String> {
        let scopes = self.inner.read();
        let mut namespaces: Vec<String> = scopes
            .namespaced
            .iter()
            .filter(|(_, grant)| grant.allows(resource, verb))
            .map(|(ns, _)| ns.clone())
            .collect();
        namespaces.sort();
        namespaces
    }
}
