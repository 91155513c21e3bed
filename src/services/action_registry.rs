//! Typed registry of workflow action handlers.
//!
//! One registry per orchestrator. Handlers are resolved when a workflow is
//! registered so unknown action ids fail early.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::ActionHandler;

#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the id.
    pub fn register(&mut self, action_id: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let action_id = action_id.into();
        if self.handlers.insert(action_id.clone(), handler).is_some() {
            tracing::warn!(action_id = %action_id, "replaced existing action handler");
        }
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, action_id: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<Value>> + Send + 'static,
    {
        self.register(action_id, Arc::new(FnAction::new(f)));
    }

    pub fn get(&self, action_id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_id).cloned()
    }

    /// Look up a handler, failing with `NoHandler`.
    pub fn resolve(&self, action_id: &str) -> DomainResult<Arc<dyn ActionHandler>> {
        self.get(action_id)
            .ok_or_else(|| DomainError::NoHandler(action_id.to_string()))
    }

    pub fn contains(&self, action_id: &str) -> bool {
        self.handlers.contains_key(action_id)
    }

    /// Fail on the first id without a handler.
    pub fn ensure_registered<'a>(&self, action_ids: impl IntoIterator<Item = &'a str>) -> DomainResult<()> {
        match action_ids.into_iter().find(|id| !self.contains(id)) {
            Some(missing) => Err(DomainError::NoHandler(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Registered ids, sorted.
    pub fn action_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.action_ids())
            .finish()
    }
}

/// Adapts an async closure to [`ActionHandler`].
pub struct FnAction<F> {
    f: F,
    retryable: bool,
}

impl<F> FnAction<F> {
    pub fn new(f: F) -> Self {
        Self { f, retryable: true }
    }

    /// Mark the handler as unsafe to retry.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = DomainResult<Value>> + Send,
{
    async fn invoke(&self, input: Value) -> DomainResult<Value> {
        (self.f)(input).await
    }

    fn retryable(&self) -> bool {
        self.retryable
    }
}
