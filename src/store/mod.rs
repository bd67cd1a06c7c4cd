//! Versioned routing store
//!
//! The reconciler only needs two operations from the place routing
//! resources live: a read that returns the current version token, and a
//! write that succeeds only if that token is still current. Both the
//! Kubernetes client and the in-memory store implement [`ResourceStore`].

pub mod kube;
pub mod memory;

use crate::codec::{ResourceKey, RoutingResource};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub use kube::KubeStore;
pub use memory::MemoryStore;

/// Opaque version token handed out by a store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(pub String);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource together with the version it was read at
#[derive(Debug, Clone)]
pub struct Versioned {
    pub resource: RoutingResource,
    pub version: Version,
}

/// Errors returned by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resource changed (or was created) since it was read
    #[error("version conflict")]
    Conflict,

    /// Transport failure or server-side error; worth retrying
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request; retrying will not help
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict | StoreError::Unavailable(_))
    }
}

/// Capability interface over the routing store
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Current resource and version, or `None` when it does not exist
    async fn get(&self, key: &ResourceKey) -> Result<Option<Versioned>, StoreError>;

    /// Write `resource` if the stored version still equals `expected`
    ///
    /// `expected == None` means create; it conflicts if the resource
    /// already exists. Returns the new version.
    async fn conditional_put(
        &self,
        resource: &RoutingResource,
        expected: Option<&Version>,
    ) -> Result<Version, StoreError>;

    /// Store name for logging
    fn name(&self) -> &'static str;
}
