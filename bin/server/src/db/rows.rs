//! Row types and their conversion into domain records.
//!
//! Ids are stored as their prefixed text form, statuses as snake_case text,
//! and envelopes, contexts and errors as JSONB.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use tessera_workflow::{
    Edge, NodeId, QueueItem, Run, RunContext, Step, Trigger, Worker, Workflow, WorkflowNode,
};

fn invalid(what: &str, value: impl fmt::Display, reason: impl fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {what} '{value}': {reason}"),
    )))
}

fn parse<T>(what: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e| invalid(what, value, e))
}

fn json<T: DeserializeOwned>(what: &str, value: JsonValue) -> Result<T, sqlx::Error> {
    serde_json::from_value(value).map_err(|e| invalid(what, "<json>", e))
}

fn unsigned(what: &str, value: i32) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|e| invalid(what, value, e))
}

/// The `definition` column of a workflow.
#[derive(Deserialize)]
struct Definition {
    nodes: Vec<WorkflowNode>,
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(FromRow)]
pub(crate) struct WorkflowRow {
    id: String,
    name: String,
    definition: JsonValue,
}

impl WorkflowRow {
    pub(crate) fn try_into_record(self) -> Result<Workflow, sqlx::Error> {
        let definition: Definition = json("workflow definition", self.definition)?;
        Ok(Workflow {
            id: parse("workflow id", &self.id)?,
            name: self.name,
            nodes: definition.nodes,
            edges: definition.edges,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct TriggerRow {
    id: String,
    workflow_id: String,
    node_id: Option<String>,
    config: JsonValue,
    enabled: bool,
}

impl TriggerRow {
    pub(crate) fn try_into_record(self) -> Result<Trigger, sqlx::Error> {
        Ok(Trigger {
            id: parse("trigger id", &self.id)?,
            workflow_id: parse("workflow id", &self.workflow_id)?,
            node_id: self.node_id.map(NodeId::from),
            config: json("trigger config", self.config)?,
            enabled: self.enabled,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct RunRow {
    id: String,
    workflow_id: String,
    trigger_id: Option<String>,
    status: String,
    context: JsonValue,
    entry_nodes: JsonValue,
    error: Option<JsonValue>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl RunRow {
    pub(crate) fn try_into_record(self) -> Result<Run, sqlx::Error> {
        let context: RunContext = json("run context", self.context)?;
        Ok(Run {
            id: parse("run id", &self.id)?,
            workflow_id: parse("workflow id", &self.workflow_id)?,
            trigger_id: self
                .trigger_id
                .map(|id| parse("trigger id", &id))
                .transpose()?,
            status: parse("run status", &self.status)?,
            context,
            entry_nodes: json("entry nodes", self.entry_nodes)?,
            error: self.error.map(|e| json("run error", e)).transpose()?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            version: self.version,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct StepRow {
    id: String,
    run_id: String,
    node_id: String,
    status: String,
    input: JsonValue,
    output: Option<JsonValue>,
    error: Option<JsonValue>,
    attempt: i32,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

impl StepRow {
    pub(crate) fn try_into_record(self) -> Result<Step, sqlx::Error> {
        Ok(Step {
            id: parse("step id", &self.id)?,
            run_id: parse("run id", &self.run_id)?,
            node_id: NodeId::from(self.node_id),
            status: parse("step status", &self.status)?,
            input: json("step input", self.input)?,
            output: self.output.map(|o| json("step output", o)).transpose()?,
            error: self.error.map(|e| json("step error", e)).transpose()?,
            attempt: unsigned("attempt", self.attempt)?,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct QueueItemRow {
    id: String,
    run_id: String,
    workflow_id: String,
    node_id: String,
    node_type: String,
    config: JsonValue,
    status: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    attempt: i32,
    max_attempts: i32,
    timeout_ms: Option<i64>,
    payload: JsonValue,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

impl QueueItemRow {
    pub(crate) fn try_into_record(self) -> Result<QueueItem, sqlx::Error> {
        Ok(QueueItem {
            id: parse("queue item id", &self.id)?,
            run_id: parse("run id", &self.run_id)?,
            workflow_id: parse("workflow id", &self.workflow_id)?,
            node_id: NodeId::from(self.node_id),
            node_type: self.node_type,
            config: self.config,
            status: parse("queue item status", &self.status)?,
            lease_owner: self
                .lease_owner
                .map(|owner| parse("worker id", &owner))
                .transpose()?,
            lease_expires_at: self.lease_expires_at,
            attempt: unsigned("attempt", self.attempt)?,
            max_attempts: unsigned("max attempts", self.max_attempts)?,
            timeout_ms: self
                .timeout_ms
                .map(|ms| u64::try_from(ms).map_err(|e| invalid("timeout", ms, e)))
                .transpose()?,
            payload: json("payload", self.payload)?,
            enqueued_at: self.enqueued_at,
            available_at: self.available_at,
            claimed_at: self.claimed_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct WorkerRow {
    id: String,
    name: String,
    concurrency: i32,
    last_heartbeat: DateTime<Utc>,
    registered_at: DateTime<Utc>,
}

impl WorkerRow {
    pub(crate) fn try_into_record(self) -> Result<Worker, sqlx::Error> {
        Ok(Worker {
            id: parse("worker id", &self.id)?,
            name: self.name,
            concurrency: unsigned("concurrency", self.concurrency)?,
            last_heartbeat: self.last_heartbeat,
            registered_at: self.registered_at,
        })
    }
}
