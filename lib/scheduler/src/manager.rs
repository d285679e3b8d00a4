//! Where triggers come from and where fired triggers go.

use crate::error::{LaunchError, TriggerError};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tessera_core::{RunId, TriggerId};
use tessera_workflow::Trigger;
use tokio::sync::RwLock;

/// Read access to persisted triggers.
#[async_trait]
pub trait TriggerSource: Send + Sync + 'static {
    /// Lists every enabled trigger.
    async fn list_enabled(&self) -> Result<Vec<Trigger>, TriggerError>;

    /// Gets a trigger by ID, enabled or not.
    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, TriggerError>;
}

/// Starts runs on behalf of fired triggers.
#[async_trait]
pub trait RunLauncher: Send + Sync + 'static {
    /// Starts a run of the trigger's workflow.
    ///
    /// Launching twice with the same `dedupe_key` starts at most one run.
    async fn launch(
        &self,
        trigger: &Trigger,
        payload: JsonValue,
        dedupe_key: Option<String>,
    ) -> Result<RunId, LaunchError>;
}

/// A trigger source held in memory.
#[derive(Debug, Default)]
pub struct StaticTriggerSource {
    triggers: RwLock<Vec<Trigger>>,
}

impl StaticTriggerSource {
    /// Creates a source holding `triggers`.
    #[must_use]
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self {
            triggers: RwLock::new(triggers),
        }
    }

    /// Adds a trigger, replacing any trigger with the same ID.
    pub async fn put(&self, trigger: Trigger) {
        let mut triggers = self.triggers.write().await;
        triggers.retain(|existing| existing.id != trigger.id);
        triggers.push(trigger);
    }
}

#[async_trait]
impl TriggerSource for StaticTriggerSource {
    async fn list_enabled(&self) -> Result<Vec<Trigger>, TriggerError> {
        Ok(self
            .triggers
            .read()
            .await
            .iter()
            .filter(|trigger| trigger.enabled)
            .cloned()
            .collect())
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, TriggerError> {
        Ok(self
            .triggers
            .read()
            .await
            .iter()
            .find(|trigger| trigger.id == id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::WorkflowId;
    use tessera_workflow::TriggerConfig;

    #[tokio::test]
    async fn lists_only_enabled_triggers() {
        let workflow_id = WorkflowId::new();
        let enabled = Trigger::new(workflow_id, TriggerConfig::Manual);
        let disabled = Trigger::new(workflow_id, TriggerConfig::Manual).disabled();
        let source = StaticTriggerSource::new(vec![enabled.clone(), disabled.clone()]);

        let listed = source.list_enabled().await.expect("list");
        assert_eq!(listed, vec![enabled]);
        assert_eq!(
            source.get(disabled.id).await.expect("get"),
            Some(disabled)
        );
    }

    #[tokio::test]
    async fn put_replaces_by_id() {
        let trigger = Trigger::new(WorkflowId::new(), TriggerConfig::Manual);
        let source = StaticTriggerSource::default();
        source.put(trigger.clone()).await;
        source.put(trigger.clone().disabled()).await;

        assert!(source.list_enabled().await.expect("list").is_empty());
        assert!(
            !source
                .get(trigger.id)
                .await
                .expect("get")
                .expect("present")
                .enabled
        );
    }
}
