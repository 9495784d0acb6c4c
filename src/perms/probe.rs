//! Probe resolver
//!
//! Cache-free resolution strategy: every permission question becomes one or
//! more `SelfSubjectAccessReview` round trips issued with the gateway's own
//! credentials. Zero staleness, O(namespace count) latency for the permitted
//! namespace set; a failing probe aborts the whole call rather than
//! returning partial results.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use crate::error::Error;
use crate::perms::AccessResolver;
use crate::request::ResourceRequest;

/// Resolver issuing live authorization probes per question.
pub struct ProbeResolver {
    client: Client,
}

impl ProbeResolver {
    /// Create a probe resolver using the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Issue one access review; `namespace: None` probes cluster scope.
    async fn review(
        &self,
        verb: &str,
        request: &ResourceRequest,
        namespace: Option<&str>,
    ) -> Result<bool, Error> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(resource_attributes(verb, request, namespace)),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), &review).await?;
        let allowed = created.status.map(|s| s.allowed).unwrap_or(false);
        debug!(
            verb = verb,
            resource = %request.resource,
            namespace = namespace.unwrap_or("<cluster>"),
            allowed = allowed,
            "access review"
        );
        Ok(allowed)
    }
}

/// Build the resource attributes for one probe.
fn resource_attributes(
    verb: &str,
    request: &ResourceRequest,
    namespace: Option<&str>,
) -> ResourceAttributes {
    ResourceAttributes {
        verb: Some(verb.to_string()),
        group: Some(request.group.clone()),
        version: Some(request.version.clone()),
        resource: Some(request.resource.clone()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

#[async_trait]
impl AccessResolver for ProbeResolver {
    async fn can_cluster(&self, verb: &str, request: &ResourceRequest) -> Result<bool, Error> {
        self.review(verb, request, None).await
    }

    /// Enumerate every namespace on the cluster and probe each one. Any
    /// probe failure (or a failed namespace list) fails the whole call.
    async fn permitted_namespaces(
        &self,
        verb: &str,
        request: &ResourceRequest,
    ) -> Result<Vec<String>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&ListParams::default()).await?;

        let mut permitted = Vec::new();
        for namespace in namespaces {
            let name = namespace.name_any();
            if self.review(verb, request, Some(&name)).await? {
                permitted.push(name);
            }
        }
        Ok(permitted)
    }
}
