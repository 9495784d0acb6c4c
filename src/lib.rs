//! Scopegate - RBAC-aware aggregating gateway for the Kubernetes API
//!
//! Scopegate sits in front of a Kubernetes API server and answers
//! cluster-scoped list/watch requests on behalf of a single tracked
//! service account, even when that account only holds namespace-scoped
//! grants. Requests the account is directly authorized for are forwarded
//! unmodified; cluster-scoped reads without a cluster-wide grant are
//! synthesized by fanning the request out to every namespace the account
//! can read and splicing the partial results into one response.
//!
//! # Modules
//!
//! - [`request`] - REST path classification into typed resource descriptors
//! - [`perms`] - permission store plus the two resolution strategies
//!   (RBAC-binding cache and live `SelfSubjectAccessReview` probes)
//! - [`aggregate`] - per-namespace fan-out and response synthesis
//! - [`merge`] - fan-in of per-namespace watch streams
//! - [`gateway`] - HTTP dispatcher deciding direct forward vs synthesis
//! - [`config`] - startup configuration
//! - [`error`] - error types for the gateway

#![deny(missing_docs)]

pub mod aggregate;
pub mod config;
pub mod error;
pub mod gateway;
pub mod merge;
pub mod perms;
pub mod request;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Buffer capacity of each per-namespace watch channel feeding the merger.
pub const WATCH_SOURCE_BUFFER: usize = 32;

/// Buffer capacity of the merged output channel.
pub const MERGED_OUTPUT_BUFFER: usize = 64;

/// Upper bound on buffered request bodies for direct forwarding (2 MiB,
/// the API server's own default limit for most write payloads).
pub const MAX_REQUEST_BODY: usize = 2 * 1024 * 1024;
