//! Built-in control nodes.
//!
//! These carry no business logic. They exist so that workflows can be wired
//! and exercised without any external node types installed.

use crate::envelope::{BRANCH_FIELD, Envelope};
use crate::node::{ExecutionContext, NodeErrorCode, NodeExecutionError, NodeMeta, NodeType};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue, json};
use std::sync::Arc;

/// Returns one instance of every built-in node type.
#[must_use]
pub fn all() -> Vec<Arc<dyn NodeType>> {
    vec![Arc::new(Passthrough), Arc::new(SetVariables), Arc::new(Branch)]
}

/// Forwards its input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

#[async_trait]
impl NodeType for Passthrough {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("passthrough", "Forwards its input unchanged")
    }

    async fn execute_envelope(
        &self,
        ctx: &ExecutionContext,
        _config: &JsonValue,
        input: &Envelope,
    ) -> Result<Envelope, NodeExecutionError> {
        Ok(input.derive(&ctx.node_id))
    }
}

/// Merges its config object into the envelope variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetVariables;

#[async_trait]
impl NodeType for SetVariables {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("set_variables", "Merges its config into the run variables")
            .with_parameters(json!({
                "type": "object",
                "additionalProperties": true
            }))
    }

    async fn execute_envelope(
        &self,
        ctx: &ExecutionContext,
        config: &JsonValue,
        input: &Envelope,
    ) -> Result<Envelope, NodeExecutionError> {
        let JsonValue::Object(values) = config else {
            return Err(ctx.error(
                NodeErrorCode::InvalidInput,
                "set_variables config must be an object",
            ));
        };

        let mut output = input.derive(&ctx.node_id);
        for (name, value) in values {
            output.variables.insert(name.clone(), value.clone());
        }
        Ok(output)
    }
}

/// Selects an output port from a variable.
///
/// Config: `{"variable": "<name>", "default": "<port>"}`. The value of the
/// named variable must be a string naming the port; `default` is used when
/// the variable is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct Branch;

#[async_trait]
impl NodeType for Branch {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("branch", "Routes to the output port named by a variable")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "variable": {"type": "string"},
                    "default": {"type": "string"}
                },
                "required": ["variable"]
            }))
            .branching()
    }

    async fn execute_envelope(
        &self,
        ctx: &ExecutionContext,
        config: &JsonValue,
        input: &Envelope,
    ) -> Result<Envelope, NodeExecutionError> {
        let variable = config
            .get("variable")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ctx.error(NodeErrorCode::InvalidInput, "branch requires `variable`"))?;

        let port = match input.variables.get(variable) {
            Some(JsonValue::String(port)) => port.clone(),
            Some(other) => {
                return Err(ctx.error(
                    NodeErrorCode::InvalidInput,
                    format!("variable `{variable}` must be a string, got {other}"),
                ));
            }
            None => config
                .get("default")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ctx.error(
                        NodeErrorCode::InvalidInput,
                        format!("variable `{variable}` is not set and no default port is configured"),
                    )
                })?,
        };

        let data = match input.data_without_branch() {
            JsonValue::Object(mut map) => {
                map.insert(BRANCH_FIELD.to_string(), JsonValue::String(port));
                JsonValue::Object(map)
            }
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map.insert(BRANCH_FIELD.to_string(), JsonValue::String(port));
                JsonValue::Object(map)
            }
        };

        let data_type = input.data_type.clone();
        Ok(input.derive(&ctx.node_id).with_data(data_type, data))
    }
}
