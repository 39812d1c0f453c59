//! Ambient context resolution for executions.
//!
//! A `ContextProvider` turns `(actor_id, session_id)` into the JSON value that
//! preconditions, step guards and executors see as `context`. It is resolved
//! once at start and stored on the execution.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

/// Maximum serialized size of a resolved context (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context unavailable for actor '{actor_id}': {reason}")]
    Unavailable { actor_id: String, reason: String },

    #[error("context exceeds {MAX_CONTEXT_SIZE} bytes ({size} bytes)")]
    TooLarge { size: usize },
}

// ---------------------------------------------------------------------------
// ContextProvider trait
// ---------------------------------------------------------------------------

pub trait ContextProvider: Send + Sync + 'static {
    fn resolve(
        &self,
        actor_id: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<Value, ContextError>> + Send;
}

/// Object-safe version of [`ContextProvider`].
pub trait ContextProviderDyn: Send + Sync {
    fn resolve_boxed<'a>(
        &'a self,
        actor_id: &'a str,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ContextError>> + Send + 'a>>;
}

impl<T: ContextProvider> ContextProviderDyn for T {
    fn resolve_boxed<'a>(
        &'a self,
        actor_id: &'a str,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ContextError>> + Send + 'a>> {
        Box::pin(self.resolve(actor_id, session_id))
    }
}

/// Type-erased context provider held by the engine.
pub struct BoxContextProvider {
    inner: Box<dyn ContextProviderDyn + Send + Sync>,
}

impl BoxContextProvider {
    pub fn new<T: ContextProvider>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    /// Resolve and enforce [`MAX_CONTEXT_SIZE`].
    pub async fn resolve(&self, actor_id: &str, session_id: &str) -> Result<Value, ContextError> {
        let context = self.inner.resolve_boxed(actor_id, session_id).await?;
        let size = serde_json::to_vec(&context).map(|v| v.len()).unwrap_or(0);
        if size > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge { size });
        }
        Ok(context)
    }
}

impl std::fmt::Debug for BoxContextProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxContextProvider").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StaticContext
// ---------------------------------------------------------------------------

/// Returns the same context for every actor.
#[derive(Debug, Clone, Default)]
pub struct StaticContext {
    value: Value,
}

impl StaticContext {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

impl ContextProvider for StaticContext {
    async fn resolve(&self, _actor_id: &str, _session_id: &str) -> Result<Value, ContextError> {
        Ok(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Unreachable;

    impl ContextProvider for Unreachable {
        async fn resolve(&self, actor_id: &str, _session_id: &str) -> Result<Value, ContextError> {
            Err(ContextError::Unavailable {
                actor_id: actor_id.to_string(),
                reason: "crm offline".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn static_context_returned_as_is() {
        let provider = BoxContextProvider::new(StaticContext::new(json!({"segment": "smb"})));
        let ctx = provider.resolve("actor-1", "s-1").await.unwrap();
        assert_eq!(ctx["segment"], "smb");
    }

    #[tokio::test]
    async fn provider_errors_propagate() {
        let provider = BoxContextProvider::new(Unreachable);
        let err = provider.resolve("actor-9", "s-1").await.unwrap_err();
        assert!(err.to_string().contains("actor-9"));
        assert!(err.to_string().contains("crm offline"));
    }

    #[tokio::test]
    async fn oversized_context_rejected() {
        let blob = "x".repeat(MAX_CONTEXT_SIZE + 1);
        let provider = BoxContextProvider::new(StaticContext::new(json!({ "blob": blob })));
        let err = provider.resolve("actor-1", "s-1").await.unwrap_err();
        assert!(matches!(err, ContextError::TooLarge { .. }));
    }
}
