//! Core record types: events, tokens, node configuration and node state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::enums::{ActivityLevel, EventType, NodeType, TokenKind};
use crate::ids::{EventId, NodeId, TokenId};

/// Metadata key naming the port an emission left from or an arrival lands on.
pub const PORT_KEY: &str = "port";

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable entry in the event log.
///
/// Events are created once by the event store and never mutated afterwards.
/// Causal order is expressed only through [`caused_by`](Event::caused_by),
/// never through queue or log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Event {
    /// Unique event identifier, assigned on append.
    pub id: EventId,
    /// Logical tick at which the event takes effect.
    pub tick: u64,
    /// Wall-clock time the event was appended.
    pub real_timestamp: DateTime<Utc>,
    /// Simulation-timeline timestamp derived from the tick.
    pub simulation_timestamp: DateTime<Utc>,
    /// The category of event.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The node that produced (or is the subject of) the event.
    pub source_node_id: NodeId,
    /// The node that must handle the event, when it differs from the source.
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    /// The parent event, if this event was derived from another.
    #[serde(default)]
    pub caused_by: Option<EventId>,
    /// Business lineage identifiers propagated across hops.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    /// Type-specific payload (a serialized [`Token`] for token events).
    #[serde(default)]
    pub data: Value,
    /// Free-form metadata (for example the `port`).
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Event {
    /// The node whose processor handles this event.
    pub fn handler_node(&self) -> &NodeId {
        self.target_node_id.as_ref().unwrap_or(&self.source_node_id)
    }

    /// The port recorded in the event metadata, if any.
    pub fn port(&self) -> Option<&str> {
        self.metadata.get(PORT_KEY).and_then(Value::as_str)
    }

    /// Decode the token carried in the payload, if the payload is a token.
    pub fn token(&self) -> Option<Token> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// A partially filled event handed to the event store for appending.
///
/// The store assigns a fresh id (unless one is preassigned) and fills in
/// missing timing before the event becomes immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    /// Preassigned id, used when importing or when a batch references itself.
    #[serde(default)]
    pub id: Option<EventId>,
    /// Logical tick at which the event takes effect.
    pub tick: u64,
    /// The category of event.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The node that produced the event.
    pub source_node_id: NodeId,
    /// The node that must handle the event.
    #[serde(default)]
    pub target_node_id: Option<NodeId>,
    /// The parent event.
    #[serde(default)]
    pub caused_by: Option<EventId>,
    /// Business lineage identifiers.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Wall-clock time; defaults to the append time.
    #[serde(default)]
    pub real_timestamp: Option<DateTime<Utc>>,
    /// Simulation-timeline time; defaults to the tick clock's mapping.
    #[serde(default)]
    pub simulation_timestamp: Option<DateTime<Utc>>,
}

impl NewEvent {
    /// Start a draft with empty payload.
    pub fn new(tick: u64, event_type: EventType, source_node_id: NodeId) -> Self {
        Self {
            id: None,
            tick,
            event_type,
            source_node_id,
            target_node_id: None,
            caused_by: None,
            correlation_ids: Vec::new(),
            data: Value::Null,
            metadata: BTreeMap::new(),
            real_timestamp: None,
            simulation_timestamp: None,
        }
    }

    /// Canonical kickoff event for `node` at `tick`.
    pub fn simulation_start(node: &NodeId, tick: u64) -> Self {
        Self::new(tick, EventType::SimulationStart, node.clone())
    }

    /// Deliver a token to `target` on `port`.
    pub fn token_arrival(
        tick: u64,
        source: &NodeId,
        target: &NodeId,
        port: &str,
        token: &Token,
    ) -> Self {
        Self::new(tick, EventType::TokenArrival, source.clone())
            .with_target(target.clone())
            .with_token(token)
            .with_meta(PORT_KEY, Value::String(port.to_owned()))
    }

    /// Preassign the id.
    #[must_use]
    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the handling node.
    #[must_use]
    pub fn with_target(mut self, target: NodeId) -> Self {
        self.target_node_id = Some(target);
        self
    }

    /// Set the parent event.
    #[must_use]
    pub fn with_caused_by(mut self, parent: EventId) -> Self {
        self.caused_by = Some(parent);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Carry `token` as the payload and adopt its correlation ids.
    #[must_use]
    pub fn with_token(mut self, token: &Token) -> Self {
        self.correlation_ids.clone_from(&token.correlation_ids);
        self.data = serde_json::to_value(token).unwrap_or(Value::Null);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_owned(), value);
        self
    }

    /// Replace the correlation ids.
    #[must_use]
    pub fn with_correlation_ids(mut self, ids: Vec<String>) -> Self {
        self.correlation_ids = ids;
        self
    }

    /// Fix the wall-clock timestamp instead of using the append time.
    #[must_use]
    pub fn with_real_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.real_timestamp = Some(at);
        self
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// A unit of data flowing between graph nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Token {
    /// Token identifier.
    pub id: TokenId,
    /// Payload value.
    pub value: Value,
    /// Lineage identifiers, preserved and merged across derived tokens.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    /// Tick at which the token was minted.
    pub created_at_tick: u64,
    /// Node that minted the token.
    pub origin_node_id: NodeId,
    /// Classification used by batching.
    #[serde(default)]
    pub kind: TokenKind,
    /// Routing decisions, state tags and other annotations.
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
}

impl Token {
    /// Create a data token with no correlation ids or tags.
    pub fn new(id: TokenId, value: Value, origin_node_id: NodeId, created_at_tick: u64) -> Self {
        Self {
            id,
            value,
            correlation_ids: Vec::new(),
            created_at_tick,
            origin_node_id,
            kind: TokenKind::Data,
            tags: BTreeMap::new(),
        }
    }

    /// Replace the correlation ids.
    #[must_use]
    pub fn with_correlation_ids(mut self, ids: Vec<String>) -> Self {
        self.correlation_ids = ids;
        self
    }

    /// Set the token kind.
    #[must_use]
    pub fn with_kind(mut self, kind: TokenKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add or replace a tag.
    #[must_use]
    pub fn with_tag(mut self, key: &str, value: Value) -> Self {
        self.tags.insert(key.to_owned(), value);
        self
    }

    /// Derive a successor token minted by `node` at `tick`.
    ///
    /// The payload, kind, correlation ids and existing tags carry over;
    /// identity and origin are replaced.
    #[must_use]
    pub fn derive(&self, id: TokenId, node: &NodeId, tick: u64) -> Self {
        Self {
            id,
            value: self.value.clone(),
            correlation_ids: self.correlation_ids.clone(),
            created_at_tick: tick,
            origin_node_id: node.clone(),
            kind: self.kind,
            tags: self.tags.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario description
// ---------------------------------------------------------------------------

fn default_inputs() -> Vec<String> {
    vec!["in".to_owned()]
}

fn default_outputs() -> Vec<String> {
    vec!["out".to_owned()]
}

/// Static, externally supplied description of one node. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NodeConfig {
    /// Node identifier, unique within a scenario.
    pub id: NodeId,
    /// Node type; selects the processor.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Optional display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Declared input ports.
    #[serde(default = "default_inputs")]
    pub inputs: Vec<String>,
    /// Declared output ports.
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
    /// Type-specific parameters, parsed by the processor.
    #[serde(default)]
    pub params: Value,
}

impl NodeConfig {
    /// Create a configuration with default ports and no parameters.
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            name: None,
            inputs: default_inputs(),
            outputs: default_outputs(),
            params: Value::Null,
        }
    }

    /// Replace the parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Replace the declared output ports.
    #[must_use]
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    /// Replace the declared input ports.
    #[must_use]
    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|p| (*p).to_owned()).collect();
        self
    }
}

/// A directed edge from a source output port to a destination input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Edge {
    /// Emitting node.
    pub source: NodeId,
    /// Output port on the emitting node.
    #[serde(default = "default_out_port")]
    pub source_port: String,
    /// Receiving node.
    pub target: NodeId,
    /// Input port on the receiving node.
    #[serde(default = "default_in_port")]
    pub target_port: String,
}

fn default_out_port() -> String {
    "out".to_owned()
}

fn default_in_port() -> String {
    "in".to_owned()
}

impl Edge {
    /// Connect `source.source_port` to `target.target_port`.
    pub fn new(
        source: impl Into<NodeId>,
        source_port: &str,
        target: impl Into<NodeId>,
        target_port: &str,
    ) -> Self {
        Self {
            source: source.into(),
            source_port: source_port.to_owned(),
            target: target.into(),
            target_port: target_port.to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Node internal state
// ---------------------------------------------------------------------------

/// One entry of an FSM's append-only transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct StateTransitionRecord {
    /// State before the transition.
    pub from: String,
    /// State after the transition.
    pub to: String,
    /// Tick at which the transition happened.
    pub tick: u64,
    /// What triggered it (token id, or the event type for non-token triggers).
    pub trigger: String,
}

/// Tokens accumulated by a batcher for the batch currently open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct BatchAccumulator {
    /// Marker identifying this batch; timers capture it to detect staleness.
    pub batch_seq: u64,
    /// Tick the first member arrived.
    pub started_at_tick: u64,
    /// Members in arrival order.
    pub tokens: Vec<Token>,
}

/// Mutable per-node state threaded through processing.
///
/// Owned by the replay engine. Processors receive a copy and return a new
/// version; nothing mutates it between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct NodeInternalState {
    /// Owning node.
    pub node_id: NodeId,
    /// Owning node's type.
    pub node_type: NodeType,
    /// Current FSM state, for state-machine nodes.
    #[serde(default)]
    pub current_state: Option<String>,
    /// Named variables (FSM variables, aggregation scratch values).
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Append-only FSM transition history.
    #[serde(default)]
    pub state_history: Vec<StateTransitionRecord>,
    /// One buffer per declared input port.
    #[serde(default)]
    pub input_buffers: BTreeMap<String, Vec<Token>>,
    /// Tokens waiting to leave the node.
    #[serde(default)]
    pub output_buffer: Vec<Token>,
    /// Named monotonic counters.
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Open batch, for batcher nodes.
    #[serde(default)]
    pub batch: Option<BatchAccumulator>,
    /// Cyclic routing index, for round-robin multiplexers.
    #[serde(default)]
    pub routing_index: usize,
    /// Tick until which a single-server node is busy.
    #[serde(default)]
    pub busy_until: Option<u64>,
    /// Error messages recorded against this node.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Tick of the last event this node processed.
    #[serde(default)]
    pub last_tick: Option<u64>,
}

impl NodeInternalState {
    /// Allocate empty state with one buffer per input port.
    pub fn new(config: &NodeConfig) -> Self {
        let input_buffers = config
            .inputs
            .iter()
            .map(|port| (port.clone(), Vec::new()))
            .collect();
        Self {
            node_id: config.id.clone(),
            node_type: config.node_type,
            current_state: None,
            variables: BTreeMap::new(),
            state_history: Vec::new(),
            input_buffers,
            output_buffer: Vec::new(),
            counters: BTreeMap::new(),
            batch: None,
            routing_index: 0,
            busy_until: None,
            errors: Vec::new(),
            last_tick: None,
        }
    }

    /// Read a counter, defaulting to zero.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Increment a counter and return its new value.
    pub fn increment(&mut self, name: &str) -> u64 {
        let slot = self.counters.entry(name.to_owned()).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Mutable access to an input buffer, creating it if the port is new.
    pub fn buffer_mut(&mut self, port: &str) -> &mut Vec<Token> {
        self.input_buffers.entry(port.to_owned()).or_default()
    }

    /// Total number of tokens held across all input buffers.
    pub fn buffered(&self) -> usize {
        self.input_buffers.values().map(Vec::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

/// A human-readable record of what a processor did for one event.
///
/// Activities are a side channel: they are forwarded to an external logger
/// and never feed back into state computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct Activity {
    /// Node that produced the activity.
    pub node_id: NodeId,
    /// Tick of the event being processed.
    pub tick: u64,
    /// Event being processed, when known.
    pub event_id: Option<EventId>,
    /// Severity.
    pub level: ActivityLevel,
    /// Short machine-friendly category (`"emit"`, `"transition"`, ...).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    /// Structured details.
    #[serde(default)]
    pub data: Value,
}

impl Activity {
    /// Build an activity for `event` handled by `node`.
    pub fn for_event(
        node_id: &NodeId,
        event: &Event,
        level: ActivityLevel,
        kind: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.clone(),
            tick: event.tick,
            event_id: Some(event.id),
            level,
            kind: kind.to_owned(),
            message: message.into(),
            data: Value::Null,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Whether this activity records a failed step.
    pub fn is_error(&self) -> bool {
        self.level == ActivityLevel::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_allocates_buffer_per_input_port() {
        let config = NodeConfig::new("join", NodeType::ProcessNode).with_inputs(&["left", "right"]);
        let state = NodeInternalState::new(&config);
        assert_eq!(state.input_buffers.len(), 2);
        assert!(state.input_buffers.contains_key("left"));
        assert!(state.input_buffers.contains_key("right"));
    }

    #[test]
    fn counters_start_at_zero_and_increment() {
        let config = NodeConfig::new("sink", NodeType::Sink);
        let mut state = NodeInternalState::new(&config);
        assert_eq!(state.counter("received"), 0);
        assert_eq!(state.increment("received"), 1);
        assert_eq!(state.increment("received"), 2);
        assert_eq!(state.counter("received"), 2);
    }

    #[test]
    fn node_config_defaults_ports() {
        let json = serde_json::json!({ "id": "q", "type": "queue" });
        let config: Result<NodeConfig, _> = serde_json::from_value(json);
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| NodeConfig::new("x", NodeType::Sink));
        assert_eq!(config.inputs, vec!["in".to_owned()]);
        assert_eq!(config.outputs, vec!["out".to_owned()]);
        assert_eq!(config.node_type, NodeType::Queue);
    }

    #[test]
    fn derived_token_keeps_lineage() {
        let token = Token::new(TokenId::new("t1"), serde_json::json!(5), NodeId::new("src"), 0)
            .with_correlation_ids(vec!["order-1".to_owned()]);
        let next = token.derive(TokenId::new("t2"), &NodeId::new("mux"), 3);
        assert_eq!(next.correlation_ids, vec!["order-1".to_owned()]);
        assert_eq!(next.origin_node_id, NodeId::new("mux"));
        assert_eq!(next.created_at_tick, 3);
        assert_eq!(next.value, serde_json::json!(5));
    }
}
