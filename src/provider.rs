use async_trait::async_trait;
use serde_json::Value;

use crate::{EvaluationContext, EventBus, ResolutionDetails, Result};

/// Static information about a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMetadata {
    /// Provider name, e.g. `"flagd"`.
    pub name: String,
}

impl ProviderMetadata {
    /// Create metadata for a provider called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        ProviderMetadata { name: name.into() }
    }
}

/// The evaluation contract every vendor adapter implements.
///
/// Lifecycle methods are async and may touch the network. Resolver methods are synchronous
/// snapshot reads against state the provider already holds, so they can be issued in any order.
/// Callers must await [`Provider::on_context_change`] before reading flags that depend on the new
/// identity.
///
/// Resolver methods never fail: missing, null or unusable values resolve to the caller's default
/// following the rules in [`crate::coerce`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider metadata.
    fn metadata(&self) -> &ProviderMetadata;

    /// Establish the vendor client, targeting `context`'s user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingConfiguration`][crate::Error::MissingConfiguration] before any
    /// network activity if a required configuration value is absent, or a transport error if the
    /// vendor cannot be reached.
    async fn initialize(&self, context: &EvaluationContext) -> Result<()>;

    /// Re-identify the vendor client with `new`'s user.
    async fn on_context_change(
        &self,
        old: &EvaluationContext,
        new: &EvaluationContext,
    ) -> Result<()>;

    /// Resolve a boolean flag.
    fn resolve_boolean_evaluation(&self, flag_key: &str, default_value: bool)
        -> ResolutionDetails<bool>;

    /// Resolve a string flag.
    fn resolve_string_evaluation(
        &self,
        flag_key: &str,
        default_value: &str,
    ) -> ResolutionDetails<String>;

    /// Resolve a numeric flag.
    fn resolve_number_evaluation(&self, flag_key: &str, default_value: f64)
        -> ResolutionDetails<f64>;

    /// Resolve a structured flag.
    fn resolve_object_evaluation(
        &self,
        flag_key: &str,
        default_value: &Value,
    ) -> ResolutionDetails<Value>;

    /// Release vendor resources. The default implementation has nothing to release.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// The provider's event bus, if it emits [`ProviderEvent`][crate::ProviderEvent]s.
    fn events(&self) -> Option<&EventBus> {
        None
    }
}
