//! The envelope passed between nodes.
//!
//! An envelope is never mutated in place once issued. Nodes derive a new
//! envelope from their input with [`Envelope::derive`], which assigns a fresh
//! id and timestamp and advances the trace by the executing node.

use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tessera_core::EnvelopeId;

/// The current envelope format version.
pub const CURRENT_VERSION: u32 = 1;

/// Reserved data field a branching node uses to select its output port(s).
pub const BRANCH_FIELD: &str = "_branch";

/// Data type assigned to the merged input of a join.
pub const JOIN_DATA_TYPE: &str = "join";

/// Data type assigned to the initial payload of a run.
pub const TRIGGER_DATA_TYPE: &str = "trigger";

/// Ordered list of the nodes an envelope has passed through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace(Vec<NodeId>);

impl Trace {
    /// Creates an empty trace.
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns a new trace with `node_id` appended.
    ///
    /// The receiver is left untouched.
    #[must_use]
    pub fn next(&self, node_id: &NodeId) -> Self {
        let mut entries = self.0.clone();
        entries.push(node_id.clone());
        Self(entries)
    }

    /// Returns true if `prefix` is a prefix of this trace.
    #[must_use]
    pub fn extends(&self, prefix: &Trace) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Returns a new trace made of this trace followed by every entry of
    /// `other` not already present.
    #[must_use]
    pub fn merged_with(&self, other: &Trace) -> Self {
        let mut entries = self.0.clone();
        for node_id in &other.0 {
            if !entries.contains(node_id) {
                entries.push(node_id.clone());
            }
        }
        Self(entries)
    }

    /// Returns the most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// Returns true if the trace contains `node_id`.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.0.contains(node_id)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the trace is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the entries in order.
    #[must_use]
    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }
}

impl<I: Into<NodeId>> FromIterator<I> for Trace {
    fn from_iter<T: IntoIterator<Item = I>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// The unit of data flowing along workflow edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique identifier of this envelope.
    pub id: EnvelopeId,
    /// When this envelope was issued.
    pub issued_at: DateTime<Utc>,
    /// Envelope format version.
    pub version: u32,
    /// Free-form tag describing the shape of `data`.
    pub data_type: String,
    /// The payload.
    pub data: JsonValue,
    /// Nodes this envelope has passed through.
    #[serde(default)]
    pub trace: Trace,
    /// Variables carried along the run.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
}

impl Envelope {
    /// Creates a fresh envelope with an empty trace and no variables.
    #[must_use]
    pub fn new(data_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            id: EnvelopeId::new(),
            issued_at: Utc::now(),
            version: CURRENT_VERSION,
            data_type: data_type.into(),
            data,
            trace: Trace::new(),
            variables: Map::new(),
        }
    }

    /// Creates the envelope handed to the entry nodes of a run.
    #[must_use]
    pub fn initial(payload: JsonValue, variables: Map<String, JsonValue>) -> Self {
        Self {
            variables,
            ..Self::new(TRIGGER_DATA_TYPE, payload)
        }
    }

    /// Derives the output envelope of `node_id` from this envelope.
    ///
    /// The result has a fresh id and timestamp and its trace ends with
    /// `node_id`. Data, data type and variables are copied and can then be
    /// replaced with the `with_*` builders.
    #[must_use]
    pub fn derive(&self, node_id: &NodeId) -> Self {
        Self {
            id: EnvelopeId::new(),
            issued_at: Utc::now(),
            version: CURRENT_VERSION,
            data_type: self.data_type.clone(),
            data: self.data.clone(),
            trace: self.trace.next(node_id),
            variables: self.variables.clone(),
        }
    }

    /// Replaces the data and its type.
    #[must_use]
    pub fn with_data(mut self, data_type: impl Into<String>, data: JsonValue) -> Self {
        self.data_type = data_type.into();
        self.data = data;
        self
    }

    /// Sets a single variable.
    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// Replaces all variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables = variables;
        self
    }

    /// Replaces the trace.
    #[must_use]
    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = trace;
        self
    }

    /// Returns the output ports selected through [`BRANCH_FIELD`], if any.
    ///
    /// The field may hold a single port name or an array of port names.
    /// Any other shape is treated as no selection.
    #[must_use]
    pub fn branch_selection(&self) -> Option<Vec<String>> {
        match self.data.get(BRANCH_FIELD)? {
            JsonValue::String(port) => Some(vec![port.clone()]),
            JsonValue::Array(ports) => ports
                .iter()
                .map(|p| p.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    /// Returns a copy of `data` with [`BRANCH_FIELD`] removed.
    #[must_use]
    pub fn data_without_branch(&self) -> JsonValue {
        match &self.data {
            JsonValue::Object(map) if map.contains_key(BRANCH_FIELD) => {
                let mut map = map.clone();
                map.remove(BRANCH_FIELD);
                JsonValue::Object(map)
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str) -> NodeId {
        NodeId::from(id)
    }

    #[test]
    fn trace_next_does_not_mutate_receiver() {
        let trace = Trace::new().next(&node("a"));
        let extended = trace.next(&node("b"));

        assert_eq!(trace.len(), 1);
        assert_eq!(extended.as_slice(), &[node("a"), node("b")]);
    }

    #[test]
    fn trace_extends_prefix() {
        let base: Trace = ["a", "b"].into_iter().collect();
        let longer = base.next(&node("c"));
        let other: Trace = ["x"].into_iter().collect();

        assert!(longer.extends(&base));
        assert!(base.extends(&base));
        assert!(!base.extends(&longer));
        assert!(!longer.extends(&other));
    }

    #[test]
    fn trace_merge_keeps_first_order_and_appends_unseen() {
        let left: Trace = ["start", "left"].into_iter().collect();
        let right: Trace = ["start", "right"].into_iter().collect();

        let merged = left.merged_with(&right);
        assert_eq!(merged.as_slice(), &[node("start"), node("left"), node("right")]);
    }

    #[test]
    fn clone_is_independent() {
        let original = Envelope::new("test", json!({"nested": {"value": 1}}))
            .with_variable("count", json!(1));
        let mut copy = original.clone();

        copy.data["nested"]["value"] = json!(2);
        copy.variables.insert("count".to_string(), json!(99));
        copy.trace = copy.trace.next(&node("x"));

        assert_eq!(original.data["nested"]["value"], json!(1));
        assert_eq!(original.variables["count"], json!(1));
        assert!(original.trace.is_empty());
    }

    #[test]
    fn derive_builds_linear_trace() {
        let start = Envelope::initial(json!({"x": 1}), Map::new());
        let a = start.derive(&node("A"));
        let b = a.derive(&node("B"));
        let c = b.derive(&node("C"));

        assert_eq!(c.trace.as_slice(), &[node("A"), node("B"), node("C")]);
        assert_ne!(a.id, b.id);
        assert_eq!(c.data, json!({"x": 1}));
        assert!(start.trace.is_empty());
    }

    #[test]
    fn branch_selection_accepts_string_or_array() {
        let single = Envelope::new("t", json!({"_branch": "yes"}));
        assert_eq!(single.branch_selection(), Some(vec!["yes".to_string()]));

        let many = Envelope::new("t", json!({"_branch": ["a", "b"]}));
        assert_eq!(
            many.branch_selection(),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let malformed = Envelope::new("t", json!({"_branch": ["a", 1]}));
        assert_eq!(malformed.branch_selection(), None);

        let none = Envelope::new("t", json!({"value": 1}));
        assert_eq!(none.branch_selection(), None);
    }

    #[test]
    fn data_without_branch_strips_reserved_field() {
        let env = Envelope::new("t", json!({"_branch": "yes", "value": 3}));
        assert_eq!(env.data_without_branch(), json!({"value": 3}));
        assert!(env.data.get(BRANCH_FIELD).is_some());
    }

    #[test]
    fn envelope_json_uses_camel_case() {
        let env = Envelope::new("greeting", json!("hi"));
        let json = serde_json::to_value(&env).expect("to_value");

        assert!(json.get("issuedAt").is_some());
        assert_eq!(json["dataType"], "greeting");
        assert_eq!(json["version"], CURRENT_VERSION);
        assert!(json.get("id").and_then(JsonValue::as_str).is_some());
    }
}
