//! Enumeration types shared across the engine.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A type of event recorded in the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EventType {
    // --- Lifecycle ---
    /// Canonical kickoff for a node. Carries an empty payload.
    SimulationStart,
    /// End of the simulation for a node.
    SimulationEnd,

    // --- Token flow ---
    /// A token arrived at a node's input port.
    TokenArrival,
    /// A node emitted a token on one of its output ports.
    TokenEmitted,
    /// A terminal node consumed a token.
    TokenConsumed,
    /// A token was discarded (capacity overflow).
    TokenDropped,

    // --- Scheduling ---
    /// A self-scheduled wake-up (timeouts, delayed emission, service completion).
    Timer,

    // --- Audit ---
    /// A finite-state-machine node changed state.
    StateTransition,
    /// A batcher flushed an accumulated batch.
    BatchFlushed,
}

impl EventType {
    /// Return the `snake_case` name used in serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SimulationStart => "simulation_start",
            Self::SimulationEnd => "simulation_end",
            Self::TokenArrival => "token_arrival",
            Self::TokenEmitted => "token_emitted",
            Self::TokenConsumed => "token_consumed",
            Self::TokenDropped => "token_dropped",
            Self::Timer => "timer",
            Self::StateTransition => "state_transition",
            Self::BatchFlushed => "batch_flushed",
        }
    }

    /// Whether the replay engine delivers this event to a node processor.
    ///
    /// Emissions are routed along edges instead, and audit or lifecycle
    /// markers are only recorded.
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::SimulationStart | Self::TokenArrival | Self::Timer)
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node types
// ---------------------------------------------------------------------------

/// The kind of processing node. Each variant maps to exactly one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum NodeType {
    /// Emits tokens on start and on a fixed interval.
    DataSource,
    /// Single-server buffer with a service time.
    Queue,
    /// Transformation, windowed aggregation, or port join.
    ProcessNode,
    /// Finite-state machine driven by token arrivals.
    Fsm,
    /// Routes each token to exactly one output.
    Multiplexer,
    /// Accumulates tokens into batches.
    Batcher,
    /// Terminal consumer.
    Sink,
}

impl NodeType {
    /// All node types, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::DataSource,
        Self::Queue,
        Self::ProcessNode,
        Self::Fsm,
        Self::Multiplexer,
        Self::Batcher,
        Self::Sink,
    ];

    /// Return the `snake_case` name used in serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DataSource => "data_source",
            Self::Queue => "queue",
            Self::ProcessNode => "process_node",
            Self::Fsm => "fsm",
            Self::Multiplexer => "multiplexer",
            Self::Batcher => "batcher",
            Self::Sink => "sink",
        }
    }
}

impl core::fmt::Display for NodeType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Token kinds
// ---------------------------------------------------------------------------

/// Classification of a token. Non-data kinds bypass batching.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum TokenKind {
    /// Ordinary payload.
    #[default]
    Data,
    /// Urgent payload delivered ahead of any batching.
    Priority,
    /// Control signal.
    Control,
    /// Error report travelling through the graph.
    Error,
}

impl TokenKind {
    /// Return the `snake_case` name used in serialized form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Priority => "priority",
            Self::Control => "control",
            Self::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Activity levels
// ---------------------------------------------------------------------------

/// Severity of an activity entry produced during processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ActivityLevel {
    /// Normal processing step.
    Info,
    /// Something unusual that did not fail the step.
    Warn,
    /// The step failed; state was passed through unchanged.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_names_match_serde() {
        for ty in [
            EventType::SimulationStart,
            EventType::TokenArrival,
            EventType::Timer,
            EventType::BatchFlushed,
        ] {
            let json = serde_json::to_string(&ty).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn node_type_names_match_serde() {
        for ty in NodeType::ALL {
            let json = serde_json::to_string(&ty).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn only_inputs_are_dispatched() {
        assert!(EventType::SimulationStart.is_dispatchable());
        assert!(EventType::TokenArrival.is_dispatchable());
        assert!(EventType::Timer.is_dispatchable());
        assert!(!EventType::TokenEmitted.is_dispatchable());
        assert!(!EventType::StateTransition.is_dispatchable());
        assert!(!EventType::SimulationEnd.is_dispatchable());
    }

    #[test]
    fn token_kind_defaults_to_data() {
        assert_eq!(TokenKind::default(), TokenKind::Data);
    }
}
