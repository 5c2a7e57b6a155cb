//! The connector seam and its registry.
//!
//! Connectors adapt external systems (mailbox providers, identity providers,
//! routers, secret stores) behind a single dispatch method. The engine treats
//! any connector error as a task failure; failures never propagate across
//! sibling tasks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ConnectorError;

/// One side-effecting external operation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn call(&self, operation: &str, payload: &Map<String, Value>)
        -> Result<Value, ConnectorError>;
}

/// Explicit handler registry keyed by task type, injected into the engine.
/// Registration happens at wiring time; lookups are read-only afterward.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector for a task type, replacing any previous handler.
    pub fn register(&mut self, task_type: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(task_type.into(), connector);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(task_type).cloned()
    }

    /// Registered task types, sorted for stable display.
    pub fn task_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connectors.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Connector for Echo {
        async fn call(
            &self,
            operation: &str,
            payload: &Map<String, Value>,
        ) -> Result<Value, ConnectorError> {
            Ok(json!({"operation": operation, "payload": payload}))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Connector for AlwaysFails {
        async fn call(
            &self,
            _operation: &str,
            _payload: &Map<String, Value>,
        ) -> Result<Value, ConnectorError> {
            Err(ConnectorError::Failed("upstream unreachable".into()))
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_task_type() {
        let mut registry = ConnectorRegistry::new();
        registry.register("take_snapshot", Arc::new(Echo));

        let connector = registry.get("take_snapshot").unwrap();
        let out = connector.call("take_snapshot", &Map::new()).await.unwrap();
        assert_eq!(out["operation"], "take_snapshot");

        assert!(registry.get("unregistered").is_none());
    }

    #[tokio::test]
    async fn connector_errors_carry_the_message() {
        let mut registry = ConnectorRegistry::new();
        registry.register("flaky", Arc::new(AlwaysFails));

        let err = registry
            .get("flaky")
            .unwrap()
            .call("flaky", &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "connector call failed: upstream unreachable");
    }

    #[test]
    fn task_types_are_sorted() {
        let mut registry = ConnectorRegistry::new();
        registry.register("b", Arc::new(Echo));
        registry.register("a", Arc::new(Echo));
        assert_eq!(registry.task_types(), vec!["a", "b"]);
    }
}
