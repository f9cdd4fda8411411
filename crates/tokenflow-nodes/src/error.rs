//! Error types for the `tokenflow-nodes` crate.
//!
//! Processors never panic on bad input; every failure is a
//! [`ProcessorError`] that the invocation boundary converts into an error
//! activity with the node's state passed through unchanged.

use tokenflow_types::{EventId, EventType, NodeId, NodeType};

use crate::expr::ExprError;

/// Errors raised by a node processor for a single event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessorError {
    /// The processor does not handle this event type.
    #[error("{node_type} node {node} does not handle {event_type} events")]
    UnsupportedEvent {
        /// The node.
        node: NodeId,
        /// The node's type.
        node_type: NodeType,
        /// The rejected event type.
        event_type: EventType,
    },

    /// The node's parameters could not be parsed or are inconsistent.
    #[error("invalid parameters for node {node}: {reason}")]
    InvalidParams {
        /// The node.
        node: NodeId,
        /// What is wrong.
        reason: String,
    },

    /// A token event arrived without a decodable token payload.
    #[error("event {event} for node {node} carries no token")]
    MissingToken {
        /// The node.
        node: NodeId,
        /// The malformed event.
        event: EventId,
    },

    /// A token's value is unusable for the configured operation.
    #[error("node {node} cannot process token value: {reason}")]
    InvalidToken {
        /// The node.
        node: NodeId,
        /// What is wrong.
        reason: String,
    },

    /// A condition expression failed to parse or evaluate.
    #[error("expression error in node {node}: {source}")]
    Expression {
        /// The node.
        node: NodeId,
        /// The underlying expression error.
        source: ExprError,
    },

    /// The processor panicked; the panic was contained at the boundary.
    #[error("processor for node {node} panicked: {message}")]
    Panicked {
        /// The node.
        node: NodeId,
        /// The panic payload, when it was a string.
        message: String,
    },
}

impl ProcessorError {
    /// The node the error is attributed to.
    pub const fn node(&self) -> &NodeId {
        match self {
            Self::UnsupportedEvent { node, .. }
            | Self::InvalidParams { node, .. }
            | Self::MissingToken { node, .. }
            | Self::InvalidToken { node, .. }
            | Self::Expression { node, .. }
            | Self::Panicked { node, .. } => node,
        }
    }

    /// Short category name used as the activity kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedEvent { .. } => "unsupported_event",
            Self::InvalidParams { .. } => "invalid_params",
            Self::MissingToken { .. } => "missing_token",
            Self::InvalidToken { .. } => "invalid_token",
            Self::Expression { .. } => "expression_error",
            Self::Panicked { .. } => "panic",
        }
    }
}
