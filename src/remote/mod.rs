//! NF-060: Remote CRUD surface, the one seam between the engine and a control plane.
//!
//! Every resource type is reconciled through the same four verbs. The HTTP
//! client, the in-memory fake, and the local random generator all implement
//! [`CrudApi`]; the engine never knows which one it is talking to.

pub mod memory;
pub mod neon;
pub mod retry;

use crate::core::descriptor::ResourceDescriptor;
use crate::core::types::Fields;
use crate::resources::random::RandomApi;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure classes a remote call can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The object does not exist (HTTP 404).
    #[error("not found")]
    NotFound,

    /// Worth retrying: rate limits, timeouts, 5xx.
    #[error("transient error: {0}")]
    Transient(String),

    /// Not worth retrying.
    #[error("{}{message}", .status.map(|s| format!("HTTP {}: ", s)).unwrap_or_default())]
    Fatal { status: Option<u16>, message: String },
}

impl RemoteError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// What a remote call returns: the identity plus every known field.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub id: String,
    pub fields: Fields,
}

/// Uniform create/read/update/delete over any resource type.
#[async_trait]
pub trait CrudApi: Send + Sync {
    /// Create an object. Repeating a call with the same `idempotency_key`
    /// must return the original object instead of creating a second one.
    async fn create(
        &self,
        type_token: &str,
        idempotency_key: &str,
        inputs: &Fields,
    ) -> Result<RemoteObject, RemoteError>;

    /// Fetch an object. `inputs` carries the parent identifiers needed to
    /// address nested objects.
    async fn read(&self, type_token: &str, id: &str, inputs: &Fields) -> Result<RemoteObject, RemoteError>;

    async fn update(
        &self,
        type_token: &str,
        id: &str,
        olds: &Fields,
        news: &Fields,
    ) -> Result<RemoteObject, RemoteError>;

    async fn delete(&self, type_token: &str, id: &str, inputs: &Fields) -> Result<(), RemoteError>;
}

/// Named provider bindings plus the in-process provider for local resources.
#[derive(Clone)]
pub struct ProviderSet {
    bindings: IndexMap<String, Arc<dyn CrudApi>>,
    local: Arc<dyn CrudApi>,
}

impl Default for ProviderSet {
    fn default() -> Self {
        Self {
            bindings: IndexMap::new(),
            local: Arc::new(RandomApi),
        }
    }
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set with `api` bound as `default`.
    pub fn single(api: Arc<dyn CrudApi>) -> Self {
        Self::new().with("default", api)
    }

    pub fn with(mut self, name: &str, api: Arc<dyn CrudApi>) -> Self {
        self.bindings.insert(name.to_string(), api);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// The API that reconciles `descriptor` under `binding`.
    /// Local resources ignore the binding.
    pub fn api_for(&self, descriptor: &ResourceDescriptor, binding: &str) -> Option<Arc<dyn CrudApi>> {
        if descriptor.local {
            return Some(Arc::clone(&self.local));
        }
        self.bindings.get(binding).cloned()
    }
}

impl fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSet")
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}
