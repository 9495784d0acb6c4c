//! Aggregating access layer
//!
//! Decides whether an inbound request can go straight to the API server or
//! has to be synthesized, and performs the synthesis: one List or Watch
//! call per permitted namespace, spliced into a single cluster-scope
//! response. Works on [`DynamicObject`] so the gateway stays agnostic of
//! resource kinds.

use std::sync::Arc;
use std::time::Duration;

use futures::{Future, StreamExt};
use kube::api::{Api, DynamicObject, ListParams, ObjectList, WatchEvent, WatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::merge::StreamMerger;
use crate::perms::AccessResolver;
use crate::request::ResourceRequest;
use crate::WATCH_SOURCE_BUFFER;

/// How the dispatcher should treat a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward unmodified; the API server enforces access natively.
    Direct,
    /// Synthesize a cluster-scope response from per-namespace calls.
    Aggregate,
}

/// Decide direct-vs-synthesize for a classified request.
///
/// Single-item and namespaced requests always go direct. Cluster-scope
/// list/watch goes direct only when the identity holds the verb (or `*`)
/// cluster-wide.
pub async fn route(
    resolver: &dyn AccessResolver,
    request: &ResourceRequest,
) -> Result<Route, Error> {
    if request.is_single_item() || request.namespace.is_some() {
        return Ok(Route::Direct);
    }
    if resolver.can_cluster(request.verb(), request).await? {
        Ok(Route::Direct)
    } else {
        Ok(Route::Aggregate)
    }
}

/// Performs the per-namespace fan-out and result splicing.
pub struct Aggregator {
    client: Client,
    resolver: Arc<dyn AccessResolver>,
    /// Optional bound on each per-namespace upstream call. Unset means
    /// unbounded, the behavior of the system this replicates.
    namespace_timeout: Option<Duration>,
}

impl Aggregator {
    /// Create an aggregator over the given client and resolution strategy.
    pub fn new(
        client: Client,
        resolver: Arc<dyn AccessResolver>,
        namespace_timeout: Option<Duration>,
    ) -> Self {
        Self {
            client,
            resolver,
            namespace_timeout,
        }
    }

    /// Route decision for this aggregator's resolver.
    pub async fn route(&self, request: &ResourceRequest) -> Result<Route, Error> {
        route(self.resolver.as_ref(), request).await
    }

    /// Synthesize a cluster-scope list by concatenating the lists of every
    /// permitted namespace. A namespace whose call fails is logged and
    /// skipped; the response carries whatever succeeded.
    pub async fn list(&self, request: &ResourceRequest) -> Result<Value, Error> {
        let namespaces = self
            .resolver
            .permitted_namespaces(request.verb(), request)
            .await?;
        debug!(
            resource = %request.resource,
            namespaces = namespaces.len(),
            "synthesizing cluster list"
        );

        let mut pages = Vec::new();
        for namespace in &namespaces {
            let api = self.dynamic_api(request, namespace);
            match self.bounded(api.list(&ListParams::default())).await {
                Ok(page) => pages.push(page),
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        resource = %request.resource,
                        error = %e,
                        "skipping namespace in synthesized list"
                    );
                }
            }
        }

        splice_pages(request, pages)
    }

    /// Synthesize a cluster-scope watch: one upstream watch per permitted
    /// namespace, each piped into the returned merger as `{type, object}`
    /// envelopes. A namespace whose watch cannot start contributes nothing
    /// (its source closes empty); a stream that later errors ends only that
    /// source's contribution.
    pub async fn watch(&self, request: &ResourceRequest) -> Result<StreamMerger<Value>, Error> {
        let namespaces = self
            .resolver
            .permitted_namespaces(request.verb(), request)
            .await?;
        debug!(
            resource = %request.resource,
            namespaces = namespaces.len(),
            "synthesizing cluster watch"
        );

        let mut sources = Vec::new();
        for namespace in &namespaces {
            let (tx, rx) = mpsc::channel(WATCH_SOURCE_BUFFER);
            sources.push(rx);
            tokio::spawn(forward_namespace_watch(
                self.dynamic_api(request, namespace),
                namespace.clone(),
                self.namespace_timeout,
                tx,
            ));
        }

        Ok(StreamMerger::new(sources))
    }

    fn dynamic_api(&self, request: &ResourceRequest, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&request.group, &request.version, &request.kind);
        let ar = ApiResource::from_gvk_with_plural(&gvk, &request.resource);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    /// Apply the configured per-namespace timeout to one upstream call.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, kube::Error>>,
    ) -> Result<T, Error> {
        match self.namespace_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| Error::upstream(format!("namespace call exceeded {limit:?}")))?
                .map_err(Error::from),
            None => call.await.map_err(Error::from),
        }
    }
}

/// Concatenate per-namespace list pages into one cluster-style list
/// envelope. Item order follows page order (namespace iteration order);
/// the carried `resourceVersion` is the last page's, deterministic because
/// permitted namespaces are iterated sorted.
fn splice_pages(
    request: &ResourceRequest,
    pages: Vec<ObjectList<DynamicObject>>,
) -> Result<Value, Error> {
    let mut items = Vec::new();
    let mut resource_version = String::new();
    for page in pages {
        for item in page.items {
            items.push(serde_json::to_value(&item)?);
        }
        if let Some(rv) = page.metadata.resource_version {
            resource_version = rv;
        }
    }

    Ok(json!({
        "kind": request.list_kind(),
        "apiVersion": request.api_version(),
        "metadata": { "resourceVersion": resource_version },
        "items": items,
    }))
}

/// Drive one namespace's upstream watch into its merger source channel.
/// Ends (closing the source) when the watch cannot start, errors, drains,
/// or the merged consumer goes away.
async fn forward_namespace_watch(
    api: Api<DynamicObject>,
    namespace: String,
    timeout: Option<Duration>,
    tx: mpsc::Sender<Value>,
) {
    let params = WatchParams::default();
    let establish = api.watch(&params, "0");
    let started = match timeout {
        Some(limit) => match tokio::time::timeout(limit, establish).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    namespace = %namespace,
                    timeout = ?limit,
                    "namespace watch establishment timed out, skipping"
                );
                return;
            }
        },
        None => establish.await,
    };
    let stream = match started {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                namespace = %namespace,
                error = %e,
                "skipping namespace in synthesized watch"
            );
            return;
        }
    };

    tokio::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let Some(envelope) = watch_envelope(event) {
                    // send fails only when the consumer is gone
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    error = %e,
                    "namespace watch ended abnormally"
                );
                return;
            }
        }
    }
    debug!(namespace = %namespace, "namespace watch drained");
}

/// Map one upstream watch event to the `{type, object}` wire envelope.
///
/// Bookmarks are dropped: their resource versions are scoped to a single
/// namespace and carry no meaning on the merged stream.
fn watch_envelope(event: WatchEvent<DynamicObject>) -> Option<Value> {
    let (event_type, object) = match event {
        WatchEvent::Added(object) => ("ADDED", serde_json::to_value(&object).ok()?),
        WatchEvent::Modified(object) => ("MODIFIED", serde_json::to_value(&object).ok()?),
        WatchEvent::Deleted(object) => ("DELETED", serde_json::to_value(&object).ok()?),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(e) => ("ERROR", serde_json::to_value(&e).unwrap_or_default()),
    };
    Some(json!({
        "type": event_type,
        "object": object,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
    use kube::core::TypeMeta;
    use std::collections::BTreeSet;

    use crate::request::classify;

    /// Resolver with a fixed answer set, standing in for both strategies.
    struct FixedResolver {
        cluster: bool,
        namespaces: Vec<String>,
    }

    #[async_trait]
    impl AccessResolver for FixedResolver {
        async fn can_cluster(&self, _: &str, _: &ResourceRequest) -> Result<bool, Error> {
            Ok(self.cluster)
        }

        async fn permitted_namespaces(
            &self,
            _: &str,
            _: &ResourceRequest,
        ) -> Result<Vec<String>, Error> {
            Ok(self.namespaces.clone())
        }
    }

    fn denied() -> FixedResolver {
        FixedResolver {
            cluster: false,
            namespaces: vec![],
        }
    }

    fn cluster_wide() -> FixedResolver {
        FixedResolver {
            cluster: true,
            namespaces: vec![],
        }
    }

    #[tokio::test]
    async fn single_item_requests_always_go_direct() {
        let request = classify("api/v1/namespaces/default/pods/foo", "").unwrap();
        assert_eq!(route(&denied(), &request).await.unwrap(), Route::Direct);

        let request = classify("api/v1/namespaces/default", "").unwrap();
        assert_eq!(route(&denied(), &request).await.unwrap(), Route::Direct);
    }

    #[tokio::test]
    async fn namespaced_collections_always_go_direct() {
        let request = classify("api/v1/namespaces/default/pods", "").unwrap();
        assert_eq!(route(&denied(), &request).await.unwrap(), Route::Direct);

        let request = classify("api/v1/namespaces/default/pods", "watch=true").unwrap();
        assert_eq!(route(&denied(), &request).await.unwrap(), Route::Direct);
    }

    #[tokio::test]
    async fn cluster_collections_aggregate_without_cluster_grant() {
        let request = classify("api/v1/pods", "").unwrap();
        assert_eq!(route(&denied(), &request).await.unwrap(), Route::Aggregate);

        let request = classify("apis/batch/v1/jobs", "watch").unwrap();
        assert_eq!(route(&denied(), &request).await.unwrap(), Route::Aggregate);
    }

    #[tokio::test]
    async fn cluster_grant_forces_direct_forwarding() {
        // with a cluster-wide grant (including `*`) synthesis must never
        // be chosen
        let request = classify("api/v1/pods", "").unwrap();
        assert_eq!(route(&cluster_wide(), &request).await.unwrap(), Route::Direct);

        let request = classify("api/v1/pods", "watch=true").unwrap();
        assert_eq!(route(&cluster_wide(), &request).await.unwrap(), Route::Direct);
    }

    fn page(ns: &str, names: &[&str], rv: &str) -> ObjectList<DynamicObject> {
        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "pods");
        ObjectList {
            types: TypeMeta::default(),
            metadata: ListMeta {
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            items: names
                .iter()
                .map(|name| DynamicObject::new(name, &ar).within(ns))
                .collect(),
        }
    }

    #[test]
    fn spliced_list_contains_exactly_the_permitted_items() {
        let request = classify("api/v1/pods", "").unwrap();
        let value = splice_pages(
            &request,
            vec![page("a", &["p1", "p2"], "101"), page("b", &["p3"], "57")],
        )
        .unwrap();

        assert_eq!(value["kind"], "PodList");
        assert_eq!(value["apiVersion"], "v1");

        let names: BTreeSet<&str> = value["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["metadata"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, BTreeSet::from(["p1", "p2", "p3"]));
    }

    #[test]
    fn spliced_list_carries_the_last_pages_resource_version() {
        let request = classify("api/v1/pods", "").unwrap();
        let value = splice_pages(
            &request,
            vec![page("a", &["p1"], "101"), page("b", &["p2"], "57")],
        )
        .unwrap();
        assert_eq!(value["metadata"]["resourceVersion"], "57");
    }

    #[test]
    fn empty_namespace_set_produces_an_empty_list() {
        let request = classify("apis/batch/v1/jobs", "").unwrap();
        let value = splice_pages(&request, vec![]).unwrap();
        assert_eq!(value["kind"], "JobList");
        assert_eq!(value["apiVersion"], "batch/v1");
        assert_eq!(value["items"].as_array().unwrap().len(), 0);
        assert_eq!(value["metadata"]["resourceVersion"], "");
    }

    #[test]
    fn watch_envelope_maps_event_types() {
        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let object = DynamicObject::new("p1", &ar).within("a");

        let envelope = watch_envelope(WatchEvent::Added(object.clone())).unwrap();
        assert_eq!(envelope["type"], "ADDED");
        assert_eq!(envelope["object"]["metadata"]["name"], "p1");

        let envelope = watch_envelope(WatchEvent::Deleted(object)).unwrap();
        assert_eq!(envelope["type"], "DELETED");
    }
}
