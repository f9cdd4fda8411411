//! The node processor contract and the invocation boundary.
//!
//! A [`NodeProcessor`] is a stateless value: it receives an event, the
//! node's static configuration and an owned copy of the node's state, and
//! returns new events, the successor state and activity entries. It performs
//! no I/O and reads no clocks, so the same inputs always yield the same
//! outputs.
//!
//! [`invoke`] is the only way the replay engine calls a processor. It rejects
//! unsupported event types, contains panics, and on any failure returns the
//! input state unchanged together with an error activity.

use std::panic::{self, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokenflow_types::{
    Activity, ActivityLevel, Event, EventType, NewEvent, NodeConfig, NodeId, NodeInternalState,
    NodeType, PORT_KEY, Token, TokenId,
};
use tracing::{debug, warn};

use crate::error::ProcessorError;

/// Counter used to mint deterministic token ids.
pub const MINTED_COUNTER: &str = "minted";

/// Key under which timer payloads name their purpose.
pub const TIMER_PURPOSE: &str = "purpose";

/// The output of one processor call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorResult {
    /// Events to append to the store, in order.
    pub new_events: Vec<NewEvent>,
    /// The node's state after the event.
    pub new_state: NodeInternalState,
    /// Side-channel activity entries.
    pub activities: Vec<Activity>,
}

impl ProcessorResult {
    /// A result that only carries the successor state.
    pub const fn unchanged(new_state: NodeInternalState) -> Self {
        Self {
            new_events: Vec::new(),
            new_state,
            activities: Vec::new(),
        }
    }
}

/// A pure transform for one node type.
pub trait NodeProcessor: Send + Sync {
    /// The node type this processor implements.
    fn node_type(&self) -> NodeType;

    /// Event types the processor accepts. Anything else is rejected at the
    /// invocation boundary before [`process`](Self::process) runs.
    fn supported_events(&self) -> &'static [EventType];

    /// Allocate the node's initial state.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::InvalidParams`] when the configuration
    /// cannot produce a valid state.
    fn initialize_state(&self, config: &NodeConfig) -> Result<NodeInternalState, ProcessorError> {
        Ok(NodeInternalState::new(config))
    }

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns a [`ProcessorError`] describing why the event could not be
    /// processed. The caller discards `state` changes on error.
    fn process(
        &self,
        event: &Event,
        config: &NodeConfig,
        state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError>;
}

/// The outcome of [`invoke`]: always a usable result, plus the error if the
/// step failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// New events, successor state and activities. On failure this holds the
    /// input state and a single error activity.
    pub result: ProcessorResult,
    /// The failure, if any.
    pub error: Option<ProcessorError>,
}

impl Invocation {
    /// Whether the processor call succeeded.
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Run `processor` for `event` at the fail-soft boundary.
pub fn invoke(
    processor: &dyn NodeProcessor,
    event: &Event,
    config: &NodeConfig,
    state: &NodeInternalState,
) -> Invocation {
    if !processor.supported_events().contains(&event.event_type) {
        let error = ProcessorError::UnsupportedEvent {
            node: config.id.clone(),
            node_type: processor.node_type(),
            event_type: event.event_type,
        };
        return failed(event, config, state, error);
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        processor.process(event, config, state.clone())
    }));

    match outcome {
        Ok(Ok(mut result)) => {
            result.new_state.last_tick = Some(event.tick);
            debug!(
                node = %config.id,
                event_type = %event.event_type,
                tick = event.tick,
                emitted = result.new_events.len(),
                "Processor step complete"
            );
            Invocation {
                result,
                error: None,
            }
        }
        Ok(Err(error)) => failed(event, config, state, error),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            let error = ProcessorError::Panicked {
                node: config.id.clone(),
                message,
            };
            failed(event, config, state, error)
        }
    }
}

fn failed(
    event: &Event,
    config: &NodeConfig,
    state: &NodeInternalState,
    error: ProcessorError,
) -> Invocation {
    warn!(
        node = %config.id,
        event_id = %event.id,
        tick = event.tick,
        kind = error.kind(),
        "Processor step failed: {error}"
    );
    let activity = Activity::for_event(
        &config.id,
        event,
        ActivityLevel::Error,
        error.kind(),
        error.to_string(),
    )
    .with_data(json!({ "eventType": event.event_type }));
    Invocation {
        result: ProcessorResult {
            new_events: Vec::new(),
            new_state: state.clone(),
            activities: vec![activity],
        },
        error: Some(error),
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the processors
// ---------------------------------------------------------------------------

/// Deserialize the node's typed parameters. A `null` params value is
/// treated as an empty object so every field takes its default.
pub(crate) fn parse_params<T: DeserializeOwned>(config: &NodeConfig) -> Result<T, ProcessorError> {
    let raw = if config.params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        config.params.clone()
    };
    serde_json::from_value(raw).map_err(|e| ProcessorError::InvalidParams {
        node: config.id.clone(),
        reason: e.to_string(),
    })
}

/// Decode the token carried by an arrival event.
pub(crate) fn arriving_token(event: &Event, node: &NodeId) -> Result<Token, ProcessorError> {
    event.token().ok_or_else(|| ProcessorError::MissingToken {
        node: node.clone(),
        event: event.id,
    })
}

/// Mint the next deterministic token id for `state`'s node.
pub(crate) fn mint_token_id(state: &mut NodeInternalState, tick: u64) -> TokenId {
    let sequence = state.increment(MINTED_COUNTER);
    TokenId::derived(&state.node_id, tick, sequence)
}

/// The first declared output port, or `"out"` when none are declared.
pub(crate) fn primary_output(config: &NodeConfig) -> &str {
    config.outputs.first().map_or("out", String::as_str)
}

/// A `TokenEmitted` event for `token` leaving `node` on `port`.
pub(crate) fn emit_token(
    cause: &Event,
    node: &NodeId,
    port: &str,
    token: &Token,
    tick: u64,
) -> NewEvent {
    NewEvent::new(tick, EventType::TokenEmitted, node.clone())
        .with_caused_by(cause.id)
        .with_token(token)
        .with_meta(PORT_KEY, Value::String(port.to_owned()))
}

/// A `Timer` event addressed back to `node`.
pub(crate) fn schedule_timer(cause: &Event, node: &NodeId, tick: u64, data: Value) -> NewEvent {
    NewEvent::new(tick, EventType::Timer, node.clone())
        .with_target(node.clone())
        .with_caused_by(cause.id)
        .with_correlation_ids(cause.correlation_ids.clone())
        .with_data(data)
}

/// An audit event recorded on behalf of `node` with no handler.
pub(crate) fn audit_event(
    cause: &Event,
    node: &NodeId,
    event_type: EventType,
    data: Value,
) -> NewEvent {
    NewEvent::new(cause.tick, event_type, node.clone())
        .with_caused_by(cause.id)
        .with_correlation_ids(cause.correlation_ids.clone())
        .with_data(data)
}

/// Evaluation context for condition expressions: the token's value, the
/// whole token, the node's variables and its current FSM state.
pub(crate) fn condition_context(token: &Token, state: &NodeInternalState) -> Value {
    json!({
        "value": token.value,
        "token": token,
        "vars": state.variables,
        "state": state.current_state,
    })
}

/// Read a timer's `purpose` field.
pub(crate) fn timer_purpose(event: &Event) -> Option<&str> {
    event.data.get(TIMER_PURPOSE).and_then(Value::as_str)
}

/// An informational activity.
pub(crate) fn info(node: &NodeId, event: &Event, kind: &str, message: impl Into<String>) -> Activity {
    Activity::for_event(node, event, ActivityLevel::Info, kind, message)
}

/// A warning activity.
pub(crate) fn warning(
    node: &NodeId,
    event: &Event,
    kind: &str,
    message: impl Into<String>,
) -> Activity {
    Activity::for_event(node, event, ActivityLevel::Warn, kind, message)
}
