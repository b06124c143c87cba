//! Provider configuration.
//!
//! A provider is a logical name the gateway can fail over between: a backend
//! handle plus a model id, credential, endpoint, per-call parameter
//! overrides, and an optional request-transform hook.  Configurations are
//! immutable once registered.
//!
//! Credentials and endpoints are [`Resolvable`]: either a literal or a
//! deferred resolver invoked once per attempt, so rotating or short-lived
//! secrets (OAuth refresh, cloud metadata endpoints) are picked up without
//! re-registering the provider.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::llm::backend::{BackendRequest, ModelBackend};
use crate::llm::types::GenerationParams;

// ---------------------------------------------------------------------------
// Resolvable values
// ---------------------------------------------------------------------------

/// Supplies a value that may change between attempts.
#[async_trait]
pub trait ValueResolver: Send + Sync {
    /// Produce the current value.
    async fn resolve(&self) -> Result<String>;
}

/// A configuration value that is either a literal or resolved on demand.
///
/// Deferred values are resolved exactly once per provider attempt.
#[derive(Clone)]
pub enum Resolvable {
    /// A fixed literal.
    Static(String),
    /// A resolver invoked at attempt time.
    Deferred(Arc<dyn ValueResolver>),
}

impl Resolvable {
    /// Resolve to a concrete value.
    pub async fn resolve(&self) -> Result<String> {
        match self {
            Self::Static(value) => Ok(value.clone()),
            Self::Deferred(resolver) => resolver.resolve().await,
        }
    }

    /// A deferred value read from an environment variable at attempt time.
    pub fn env(var: impl Into<String>) -> Self {
        Self::Deferred(Arc::new(EnvResolver { var: var.into() }))
    }
}

impl From<String> for Resolvable {
    fn from(value: String) -> Self {
        Self::Static(value)
    }
}

impl From<&str> for Resolvable {
    fn from(value: &str) -> Self {
        Self::Static(value.to_owned())
    }
}

impl std::fmt::Debug for Resolvable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print credential material.
        match self {
            Self::Static(_) => write!(f, "Resolvable::Static(..)"),
            Self::Deferred(_) => write!(f, "Resolvable::Deferred(..)"),
        }
    }
}

/// Resolver that reads an environment variable at attempt time.
struct EnvResolver {
    var: String,
}

#[async_trait]
impl ValueResolver for EnvResolver {
    async fn resolve(&self) -> Result<String> {
        std::env::var(&self.var).map_err(|_| AgentError::ConfigError {
            reason: format!("environment variable `{}` is not set", self.var),
        })
    }
}

// ---------------------------------------------------------------------------
// Request transform
// ---------------------------------------------------------------------------

/// Hook applied to the fully defaulted request as the last step before a
/// backend attempt, so it can override anything the defaulting produced.
pub type RequestTransform = Arc<dyn Fn(BackendRequest) -> BackendRequest + Send + Sync>;

// ---------------------------------------------------------------------------
// Provider configuration
// ---------------------------------------------------------------------------

/// Configuration for one logical provider.  Immutable once registered.
#[derive(Clone)]
pub struct ProviderConfig {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn ModelBackend>,
    pub(crate) model: String,
    pub(crate) credential: Resolvable,
    pub(crate) endpoint: Resolvable,
    /// Per-provider parameter overrides, consulted before global defaults.
    pub(crate) params: GenerationParams,
    pub(crate) transform: Option<RequestTransform>,
}

impl ProviderConfig {
    /// Create a provider configuration.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn ModelBackend>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            model: model.into(),
            credential: Resolvable::Static(String::new()),
            endpoint: Resolvable::Static(String::new()),
            params: GenerationParams::default(),
            transform: None,
        }
    }

    /// Builder: set the credential.
    pub fn credential(mut self, credential: impl Into<Resolvable>) -> Self {
        self.credential = credential.into();
        self
    }

    /// Builder: set the endpoint.
    pub fn endpoint(mut self, endpoint: impl Into<Resolvable>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Builder: set per-provider parameter overrides.
    pub fn params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Builder: set the request-transform hook.
    pub fn transform(mut self, transform: RequestTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// The provider's logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The model id this provider requests.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .field("model", &self.model)
            .field("credential", &self.credential)
            .field("endpoint", &self.endpoint)
            .field("params", &self.params)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
