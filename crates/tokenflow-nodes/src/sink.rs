//! Terminal sink: counts and retains the tokens that reach it.

use serde::Deserialize;
use serde_json::json;
use tokenflow_types::{Event, EventType, NodeConfig, NodeInternalState, NodeType};

use crate::error::ProcessorError;
use crate::processor::{
    NodeProcessor, ProcessorResult, arriving_token, audit_event, info, parse_params,
};

/// Counter of tokens received.
pub const RECEIVED: &str = "received";

/// Tokens retained per port when `maxRetained` is not given.
pub const DEFAULT_MAX_RETAINED: usize = 100;

/// Parameters for a sink node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkParams {
    /// Retain at most this many tokens per port, oldest evicted first.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

impl Default for SinkParams {
    fn default() -> Self {
        Self {
            max_retained: DEFAULT_MAX_RETAINED,
        }
    }
}

const fn default_max_retained() -> usize {
    DEFAULT_MAX_RETAINED
}

/// Processor for [`NodeType::Sink`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkProcessor;

impl NodeProcessor for SinkProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Sink
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::TokenArrival]
    }

    fn process(
        &self,
        event: &Event,
        config: &NodeConfig,
        mut state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError> {
        if event.event_type == EventType::SimulationStart {
            return Ok(ProcessorResult::unchanged(state));
        }
        let params: SinkParams = parse_params(config)?;
        let node = config.id.clone();
        let token = arriving_token(event, &node)?;
        let port = event.port().unwrap_or("in").to_owned();

        let total = state.increment(RECEIVED);
        let consumed = audit_event(event, &node, EventType::TokenConsumed, event.data.clone());
        let activity = info(&node, event, "consume", format!("received {}", token.id))
            .with_data(json!({ "received": total, "value": token.value }));

        let buffer = state.buffer_mut(&port);
        buffer.push(token);
        let excess = buffer.len().saturating_sub(params.max_retained);
        buffer.drain(..excess);

        Ok(ProcessorResult {
            new_events: vec![consumed],
            new_state: state,
            activities: vec![activity],
        })
    }
}
