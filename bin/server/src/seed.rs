//! Workflows and triggers loaded into the in-memory store at startup.
//!
//! Workflow and trigger management lives outside the server; with a
//! database they are read from the `workflows` and `triggers` tables, and
//! without one this file stands in for them.

use crate::error::ServerError;
use serde::Deserialize;
use tessera_engine::MemoryStore;
use tessera_scheduler::StaticTriggerSource;
use tessera_workflow::{Trigger, Workflow};
use tracing::info;

/// Contents of a seed file.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl Seed {
    /// Reads and parses a seed file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid seed.
    pub fn read(path: &str) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path).map_err(|e| ServerError::Seed {
            path: path.to_string(),
            details: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ServerError::Seed {
            path: path.to_string(),
            details: e.to_string(),
        })
    }

    /// Loads the seed into the in-memory store and trigger source.
    pub async fn apply(self, store: &MemoryStore, triggers: &StaticTriggerSource) {
        info!(
            workflows = self.workflows.len(),
            triggers = self.triggers.len(),
            "loading seed"
        );
        for workflow in self.workflows {
            store.put_workflow(workflow).await;
        }
        for trigger in self.triggers {
            triggers.put(trigger).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_engine::Store;
    use tessera_scheduler::TriggerSource;

    #[tokio::test]
    async fn applies_workflows_and_triggers() {
        let workflow_id = tessera_core::WorkflowId::new();
        let seed: Seed = serde_json::from_value(json!({
            "workflows": [{
                "id": workflow_id,
                "name": "nightly",
                "nodes": [{"id": "start", "node_type": "passthrough"}],
            }],
            "triggers": [{
                "id": tessera_core::TriggerId::new(),
                "workflow_id": workflow_id,
                "config": {"type": "schedule", "cron": "0 3 * * *"},
                "enabled": true,
            }],
        }))
        .expect("valid seed");

        let store = MemoryStore::new();
        let triggers = StaticTriggerSource::default();
        seed.apply(&store, &triggers).await;

        let workflow = store
            .get_workflow(workflow_id)
            .await
            .expect("read")
            .expect("seeded");
        assert_eq!(workflow.name, "nightly");

        let listed = triggers.list_enabled().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cron(), Some("0 3 * * *"));
    }

    #[test]
    fn missing_file_is_a_seed_error() {
        let err = Seed::read("/nonexistent/tessera-seed.json").expect_err("missing");
        assert!(matches!(err, ServerError::Seed { .. }));
    }
}
