//! Handler execution boundary and a name-keyed registry of handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::IndexerError;
use crate::types::HandlerInput;

/// What a handler is invoked with: a decoded entity for runtime
/// datasources, or one transformed output of a custom processor.
#[derive(Debug, Clone, Copy)]
pub enum HandlerArgs<'a> {
    Entity(HandlerInput<'a>),
    Transformed(&'a Value),
}

impl HandlerArgs<'_> {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Entity(input) => input.to_json(),
            Self::Transformed(value) => (*value).clone(),
        }
    }
}

/// A request, made by a handler, to instantiate a datasource template.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicDatasourceRequest {
    pub template: String,
    pub args: Option<Value>,
}

/// Per-invocation context handed to handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    block_height: u64,
    requests: Vec<DynamicDatasourceRequest>,
}

impl HandlerContext {
    pub fn new(block_height: u64) -> Self {
        Self {
            block_height,
            requests: Vec::new(),
        }
    }

    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    /// Ask for a datasource from `template`, starting at the current block.
    /// It applies to every entity dispatched after the current one.
    pub fn create_dynamic_datasource(&mut self, template: impl Into<String>, args: Option<Value>) {
        self.requests.push(DynamicDatasourceRequest {
            template: template.into(),
            args,
        });
    }

    pub fn take_requests(&mut self) -> Vec<DynamicDatasourceRequest> {
        std::mem::take(&mut self.requests)
    }
}

/// Opaque "run this handler with this input" capability.
#[async_trait]
pub trait HandlerExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut HandlerContext,
        handler: &str,
        args: HandlerArgs<'_>,
    ) -> Result<(), IndexerError>;
}

#[async_trait]
impl<E: HandlerExecutor + ?Sized> HandlerExecutor for Arc<E> {
    async fn execute(
        &self,
        ctx: &mut HandlerContext,
        handler: &str,
        args: HandlerArgs<'_>,
    ) -> Result<(), IndexerError> {
        (**self).execute(ctx, handler, args).await
    }
}

// ─── HandlerRegistry ─────────────────────────────────────────────────────────

/// A single named handler implemented in Rust.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerContext, args: HandlerArgs<'_>) -> Result<(), IndexerError>;
}

/// Executor dispatching on handler name. Unknown names fail the block.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under the name used in the manifest.
    pub fn on(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl HandlerExecutor for HandlerRegistry {
    async fn execute(
        &self,
        ctx: &mut HandlerContext,
        handler: &str,
        args: HandlerArgs<'_>,
    ) -> Result<(), IndexerError> {
        let h = self
            .handlers
            .get(handler)
            .ok_or_else(|| IndexerError::handler(handler, "no handler registered under this name"))?;
        h.handle(ctx, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter(Arc<AtomicU32>);

    #[async_trait]
    impl Handler for Counter {
        async fn handle(&self, ctx: &mut HandlerContext, _args: HandlerArgs<'_>) -> Result<(), IndexerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.create_dynamic_datasource("Pool", Some(serde_json::json!({ "id": 1 })));
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let count = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry.on("handleBlock", Arc::new(Counter(count.clone())));

        let value = serde_json::json!({ "x": 1 });
        let mut ctx = HandlerContext::new(42);
        registry
            .execute(&mut ctx, "handleBlock", HandlerArgs::Transformed(&value))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let requests = ctx.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].template, "Pool");
        assert!(ctx.take_requests().is_empty());
    }

    #[tokio::test]
    async fn unknown_handler_is_an_execution_error() {
        let registry = HandlerRegistry::new();
        let value = Value::Null;
        let err = registry
            .execute(&mut HandlerContext::new(1), "missing", HandlerArgs::Transformed(&value))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::HandlerExecution);
        assert!(!err.is_transient());
    }
}
