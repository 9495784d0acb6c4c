//! Error types for the gateway

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Request path does not match any recognized API shape
    #[error("malformed request path: {0}")]
    MalformedPath(String),

    /// The upstream API server could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Role or binding lookup failed while recomputing permissions
    #[error("permission resolution error: {0}")]
    PermissionResolution(String),

    /// HTTP request construction error
    #[error("http error: {0}")]
    Http(#[from] http::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a malformed-path error with the given message
    pub fn malformed_path(msg: impl Into<String>) -> Self {
        Self::MalformedPath(msg.into())
    }

    /// Create an upstream-unavailable error with the given message
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Create a permission-resolution error with the given message
    pub fn permission_resolution(msg: impl Into<String>) -> Self {
        Self::PermissionResolution(msg.into())
    }
}
