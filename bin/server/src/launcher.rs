//! Starts runs for fired triggers through the engine.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tessera_core::RunId;
use tessera_engine::{CreateRun, Engine, EngineError, Store};
use tessera_scheduler::{LaunchError, RunLauncher};
use tessera_workflow::Trigger;

/// A [`RunLauncher`] backed by the execution engine.
pub struct EngineLauncher<S: Store> {
    engine: Engine<S>,
}

impl<S: Store> EngineLauncher<S> {
    /// Creates a launcher.
    #[must_use]
    pub fn new(engine: Engine<S>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<S: Store> RunLauncher for EngineLauncher<S> {
    async fn launch(
        &self,
        trigger: &Trigger,
        payload: JsonValue,
        dedupe_key: Option<String>,
    ) -> Result<RunId, LaunchError> {
        let mut request = CreateRun::new(trigger.workflow_id)
            .from_trigger(trigger.id)
            .with_payload(payload);
        if let Some(node_id) = &trigger.node_id {
            request = request.at_node(node_id.clone());
        }
        if let Some(key) = dedupe_key {
            request = request.with_dedupe_key(key);
        }

        match self.engine.create_run(request).await {
            Ok(run) => Ok(run.id),
            Err(e @ (EngineError::Validation { .. } | EngineError::WorkflowNotFound { .. })) => {
                Err(LaunchError::Rejected {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(LaunchError::Failed {
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::WorkflowId;
    use tessera_engine::{EngineConfig, MemoryStore};
    use tessera_workflow::{NodeId, NodeRegistry, TriggerConfig, Workflow, WorkflowNode};

    async fn setup() -> (EngineLauncher<MemoryStore>, Arc<MemoryStore>, WorkflowId) {
        let store = Arc::new(MemoryStore::new());
        let workflow = Workflow::new("greet")
            .node(WorkflowNode::new("a", "passthrough"))
            .node(WorkflowNode::new("b", "passthrough"));
        let workflow_id = workflow.id;
        store.put_workflow(workflow).await;
        let engine = Engine::new(
            store.clone(),
            Arc::new(NodeRegistry::with_builtins()),
            EngineConfig::default(),
        );
        (EngineLauncher::new(engine), store, workflow_id)
    }

    #[tokio::test]
    async fn launches_at_the_trigger_node_and_dedupes() {
        let (launcher, store, workflow_id) = setup().await;
        let trigger = Trigger::new(workflow_id, TriggerConfig::Manual).at_node("b");

        let first = launcher
            .launch(&trigger, json!({"n": 1}), Some("k".to_string()))
            .await
            .expect("launch");
        let second = launcher
            .launch(&trigger, json!({"n": 1}), Some("k".to_string()))
            .await
            .expect("launch");
        assert_eq!(first, second);

        let run = store.get_run(first).await.expect("read").expect("run");
        assert_eq!(run.trigger_id, Some(trigger.id));
        assert_eq!(run.entry_nodes, vec![NodeId::from("b")]);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let (launcher, _, _) = setup().await;
        let orphan = Trigger::new(WorkflowId::new(), TriggerConfig::Manual);
        let err = launcher
            .launch(&orphan, JsonValue::Null, None)
            .await
            .expect_err("unknown workflow");
        assert!(matches!(err, LaunchError::Rejected { .. }));

        let (launcher, _, workflow_id) = setup().await;
        let scalar = Trigger::new(workflow_id, TriggerConfig::Manual);
        let err = launcher
            .launch(&scalar, json!(5), None)
            .await
            .expect_err("scalar payload");
        assert!(matches!(err, LaunchError::Rejected { .. }));
    }
}
