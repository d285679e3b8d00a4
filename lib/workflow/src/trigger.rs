//! Trigger definitions.
//!
//! Triggers are owned by an external collaborator and read-only here. The
//! scheduler drives `Schedule` triggers itself; the other kinds are fired
//! through the host's HTTP boundary.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tessera_core::{TriggerId, WorkflowId};

/// The kind of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Cron schedule.
    Schedule,
    /// Inbound HTTP webhook.
    Webhook,
    /// Named event from an integration.
    Event,
    /// User-initiated.
    Manual,
}

/// Kind-specific trigger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Fires on a 5-field cron expression, evaluated in UTC.
    Schedule {
        /// Cron expression (e.g., "0 7 * * *" for 7am daily).
        cron: String,
        /// Payload each fire starts the run with.
        #[serde(default)]
        payload: JsonValue,
    },
    /// Fires when the webhook path is called.
    Webhook {
        /// The webhook path (e.g., "/hooks/my-workflow").
        path: String,
    },
    /// Fires when the named event is observed.
    Event {
        /// The event type to listen for.
        event_type: String,
    },
    /// Fires on explicit request.
    Manual,
}

/// A trigger bound to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Unique identifier.
    pub id: TriggerId,
    /// The workflow the trigger starts.
    pub workflow_id: WorkflowId,
    /// Node to start the run at; all entry nodes when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Kind-specific configuration.
    pub config: TriggerConfig,
    /// Disabled triggers never fire.
    pub enabled: bool,
}

impl Trigger {
    /// Creates an enabled trigger.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, config: TriggerConfig) -> Self {
        Self {
            id: TriggerId::new(),
            workflow_id,
            node_id: None,
            config,
            enabled: true,
        }
    }

    /// Starts runs at a specific node.
    #[must_use]
    pub fn at_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Disables the trigger.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Returns the trigger kind.
    #[must_use]
    pub fn kind(&self) -> TriggerKind {
        match &self.config {
            TriggerConfig::Schedule { .. } => TriggerKind::Schedule,
            TriggerConfig::Webhook { .. } => TriggerKind::Webhook,
            TriggerConfig::Event { .. } => TriggerKind::Event,
            TriggerConfig::Manual => TriggerKind::Manual,
        }
    }

    /// Returns the cron expression of a schedule trigger.
    #[must_use]
    pub fn cron(&self) -> Option<&str> {
        match &self.config {
            TriggerConfig::Schedule { cron, .. } => Some(cron),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kinds_and_cron() {
        let schedule = Trigger::new(
            WorkflowId::new(),
            TriggerConfig::Schedule {
                cron: "0 7 * * *".to_string(),
                payload: json!({}),
            },
        );
        assert_eq!(schedule.kind(), TriggerKind::Schedule);
        assert_eq!(schedule.cron(), Some("0 7 * * *"));

        let webhook = Trigger::new(
            WorkflowId::new(),
            TriggerConfig::Webhook {
                path: "/hooks/x".to_string(),
            },
        );
        assert_eq!(webhook.kind(), TriggerKind::Webhook);
        assert_eq!(webhook.cron(), None);
    }

    #[test]
    fn config_json_is_tagged() {
        let trigger = Trigger::new(
            WorkflowId::new(),
            TriggerConfig::Event {
                event_type: "email.received".to_string(),
            },
        )
        .at_node("start");

        let json = serde_json::to_value(&trigger).expect("serialize");
        assert_eq!(json["config"]["type"], "event");
        assert_eq!(json["node_id"], "start");

        let parsed: Trigger = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, trigger);
    }

    #[test]
    fn schedule_payload_defaults_to_null() {
        let config: TriggerConfig =
            serde_json::from_value(json!({"type": "schedule", "cron": "* * * * *"}))
                .expect("deserialize");
        assert_eq!(
            config,
            TriggerConfig::Schedule {
                cron: "* * * * *".to_string(),
                payload: JsonValue::Null,
            }
        );
    }
}
