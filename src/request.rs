//! Request classification
//!
//! Decodes Kubernetes REST paths into typed resource descriptors. The API
//! server exposes two URL roots: `/api/{version}/...` for the core group and
//! `/apis/{group}/{version}/...` for named groups. Under either root a
//! request is cluster-scoped (`{resource}` optionally followed by `{name}`)
//! or namespaced (`namespaces/{ns}/{resource}` optionally followed by
//! `{name}`). Everything here is pure; descriptors are never persisted.

use crate::error::Error;

/// The operation a request performs, derived from its path shape and query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Collection GET
    List,
    /// Single-item GET
    Get,
    /// Collection GET with a `watch` query parameter
    Watch,
}

/// Scope of a request, derived from the presence of a namespace segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestScope {
    /// No namespace segment in the path
    Cluster,
    /// Path contains `namespaces/{ns}`
    Namespaced,
}

/// A typed descriptor for one inbound API request.
///
/// Derived purely from the request path and query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// API group; empty for the core group
    pub group: String,
    /// API version, e.g. `v1`
    pub version: String,
    /// Kind recovered from the plural resource segment (see [`kind_for_resource`])
    pub kind: String,
    /// Plural resource name as it appeared in the path, e.g. `pods`
    pub resource: String,
    /// Namespace, when the path carries one
    pub namespace: Option<String>,
    /// Object name for single-item requests
    pub name: Option<String>,
    /// The requested operation
    pub operation: Operation,
}

impl ResourceRequest {
    /// Scope of the request.
    pub fn scope(&self) -> RequestScope {
        if self.namespace.is_some() {
            RequestScope::Namespaced
        } else {
            RequestScope::Cluster
        }
    }

    /// The RBAC verb this request requires.
    pub fn verb(&self) -> &'static str {
        match self.operation {
            Operation::List => "list",
            Operation::Get => "get",
            Operation::Watch => "watch",
        }
    }

    /// The `apiVersion` value for response envelopes (`v1` or `group/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The list kind for this resource (`Pod` -> `PodList`).
    pub fn list_kind(&self) -> String {
        format!("{}List", self.kind)
    }

    /// True for single-item requests.
    pub fn is_single_item(&self) -> bool {
        self.name.is_some()
    }
}

/// Recover a kind from a plural resource segment.
///
/// Strips one trailing `s` and uppercases the first letter (`pods` -> `Pod`,
/// `jobs` -> `Job`). This is a one-way, lossy heuristic: resources that do
/// not pluralize as `noun+s` (e.g. `endpoints`, `networkpolicies`) are
/// classified incorrectly. Known limitation, kept as-is.
pub fn kind_for_resource(resource: &str) -> String {
    let singular = resource.strip_suffix('s').unwrap_or(resource);
    let mut chars = singular.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// True when the query string carries a `watch` parameter. Presence only;
/// the value is ignored, so `?watch` and `?watch=false` both count.
pub fn has_watch_param(query: &str) -> bool {
    query
        .split('&')
        .any(|param| param == "watch" || param.starts_with("watch="))
}

/// Classify a request path and query into a [`ResourceRequest`].
///
/// Fails with [`Error::MalformedPath`] when the path does not match any of
/// the recognized shapes.
pub fn classify(path: &str, query: &str) -> Result<ResourceRequest, Error> {
    let trimmed = path.trim_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();

    let (group, version, rest) = match segments.first() {
        Some(&"api") if segments.len() >= 3 => (String::new(), segments[1], &segments[2..]),
        Some(&"apis") if segments.len() >= 4 => (segments[1].to_string(), segments[2], &segments[3..]),
        _ => {
            return Err(Error::malformed_path(format!(
                "unrecognized path shape: {path}"
            )))
        }
    };

    if version.is_empty() || (segments[0] == "apis" && group.is_empty()) {
        return Err(Error::malformed_path(format!(
            "empty group or version segment: {path}"
        )));
    }

    let (namespace, resource, name) = match rest {
        [resource] => (None, *resource, None),
        // note `api/v1/namespaces/{name}` lands here: a single-item request
        // for the cluster-scoped `namespaces` resource
        [resource, name] => (None, *resource, Some(*name)),
        ["namespaces", ns, resource] => (Some(*ns), *resource, None),
        ["namespaces", ns, resource, name] => (Some(*ns), *resource, Some(*name)),
        _ => {
            return Err(Error::malformed_path(format!(
                "unrecognized path shape: {path}"
            )))
        }
    };

    if resource.is_empty() || namespace.is_some_and(str::is_empty) {
        return Err(Error::malformed_path(format!(
            "empty path segment: {path}"
        )));
    }

    let operation = if has_watch_param(query) {
        Operation::Watch
    } else if name.is_some() {
        Operation::Get
    } else {
        Operation::List
    };

    Ok(ResourceRequest {
        group,
        version: version.to_string(),
        kind: kind_for_resource(resource),
        resource: resource.to_string(),
        namespace: namespace.map(str::to_string),
        name: name.map(str::to_string),
        operation,
    })
}
