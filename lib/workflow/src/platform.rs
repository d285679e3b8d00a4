//! Collaborators made available to node types.
//!
//! Node types never reach for global state. Everything they may touch
//! outside their input envelope is handed to them through [`Platform`].

use crate::error::PlatformError;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessera_core::{RunId, WorkflowId};
use tokio::sync::RwLock;

/// Key/value storage shared by node executions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, PlatformError>;

    /// Writes a value, replacing any previous one.
    async fn put(&self, key: &str, value: JsonValue) -> Result<(), PlatformError>;

    /// Deletes a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), PlatformError>;
}

/// Process-local key/value store.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, JsonValue>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, PlatformError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: JsonValue) -> Result<(), PlatformError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PlatformError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Bridge that lets a node start another workflow.
#[async_trait]
pub trait WorkflowCaller: Send + Sync {
    /// Starts a run of `workflow_id` with `payload` and returns its id.
    async fn call_workflow(
        &self,
        workflow_id: WorkflowId,
        payload: JsonValue,
    ) -> Result<RunId, PlatformError>;
}

/// Handle to the collaborators a node may use.
///
/// Cloning is cheap; all collaborators are shared.
#[derive(Clone)]
pub struct Platform {
    http: reqwest::Client,
    key_value: Arc<dyn KeyValueStore>,
    workflows: Option<Arc<dyn WorkflowCaller>>,
}

impl Platform {
    /// Creates a platform with a default HTTP client and an in-memory
    /// key/value store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            key_value: Arc::new(MemoryKeyValueStore::new()),
            workflows: None,
        }
    }

    /// Replaces the HTTP client.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Replaces the key/value store.
    #[must_use]
    pub fn with_key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value = store;
        self
    }

    /// Installs the workflow-call bridge.
    #[must_use]
    pub fn with_workflow_caller(mut self, caller: Arc<dyn WorkflowCaller>) -> Self {
        self.workflows = Some(caller);
        self
    }

    /// Returns the outbound HTTP client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Returns the key/value store.
    #[must_use]
    pub fn key_value(&self) -> &dyn KeyValueStore {
        self.key_value.as_ref()
    }

    /// Returns the workflow-call bridge.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Unavailable`] if this process has no bridge,
    /// which is the case for remote workers.
    pub fn workflow_caller(&self) -> Result<&dyn WorkflowCaller, PlatformError> {
        self.workflows
            .as_deref()
            .ok_or_else(|| PlatformError::Unavailable {
                capability: "workflow calls".to_string(),
            })
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("workflow_calls", &self.workflows.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_store_put_get_delete() {
        let store = MemoryKeyValueStore::new();
        assert_eq!(store.get("k").await, Ok(None));

        store.put("k", json!({"v": 1})).await.expect("put");
        assert_eq!(store.get("k").await, Ok(Some(json!({"v": 1}))));

        store.delete("k").await.expect("delete");
        store.delete("k").await.expect("delete missing");
        assert_eq!(store.get("k").await, Ok(None));
    }

    #[tokio::test]
    async fn platform_shares_key_value_store_across_clones() {
        let platform = Platform::new();
        let clone = platform.clone();

        platform.key_value().put("shared", json!(true)).await.expect("put");
        assert_eq!(clone.key_value().get("shared").await, Ok(Some(json!(true))));
    }

    #[test]
    fn workflow_caller_missing_is_unavailable() {
        let platform = Platform::new();
        assert!(matches!(
            platform.workflow_caller(),
            Err(PlatformError::Unavailable { .. })
        ));
    }
}
