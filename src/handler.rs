//! Task handler interface: what the orchestrator consumes from the
//! otherwise out-of-scope handler catalog (HTTP call, transform, delay,
//! conditional, log). Handlers are registered and dispatched dynamically
//! by `task_type`, so the trait must be object-safe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Error raised by a [`TaskHandler`] invocation. Any error counts as a
/// failed attempt — handlers do not distinguish retryable from
/// non-retryable outcomes; that policy lives entirely in the orchestrator.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub error_type: Option<String>,
    pub details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// A unit of work the orchestrator can dispatch by `task_type`. Handlers
/// must be idempotent or tolerate replay: the orchestrator may re-invoke
/// a handler whose previous attempt partially applied (crash recovery,
/// visibility-timeout recovery).
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// The `task_type` string this handler answers to.
    fn task_type(&self) -> &str;

    async fn execute(
        &self,
        step_config: &Value,
        input_data: &Value,
        timeout: Duration,
    ) -> Result<Option<Value>, HandlerError>;
}

/// Maps `task_type` to its [`TaskHandler`]. A simple string-keyed map
/// suffices here since the handler interface is already object-safe and
/// uniform — no type-erasure wrapper is needed.
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.task_type().to_string(), handler);
    }

    pub fn get_handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn list_task_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        fn task_type(&self) -> &str {
            "echo"
        }

        async fn execute(
            &self,
            _step_config: &Value,
            input_data: &Value,
            _timeout: Duration,
        ) -> Result<Option<Value>, HandlerError> {
            Ok(Some(input_data.clone()))
        }
    }

    #[tokio::test]
    async fn register_and_dispatch() {
        let mut registry = TaskHandlerRegistry::new();
        registry.register(Arc::new(EchoHandler));

        let handler = registry.get_handler("echo").expect("registered");
        let output = handler
            .execute(&json!({}), &json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(output, Some(json!({"x": 1})));
        assert!(registry.get_handler("missing").is_none());
        assert_eq!(registry.list_task_types(), vec!["echo".to_string()]);
    }
}
