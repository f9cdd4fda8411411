//! Data source: the entry point of token flow.
//!
//! On `SimulationStart` the source emits one token. With `interval_ticks`
//! set it schedules a `Timer` to itself and emits again on each wake-up
//! until `max_emissions` tokens have left the node.

use serde::Deserialize;
use serde_json::{Value, json};
use tokenflow_types::{Event, EventType, NodeConfig, NodeInternalState, NodeType, Token, TokenKind};

use crate::error::ProcessorError;
use crate::processor::{
    NodeProcessor, ProcessorResult, TIMER_PURPOSE, emit_token, info, mint_token_id,
    parse_params, primary_output, schedule_timer, timer_purpose,
};

const EMITTED: &str = "emitted";
const PURPOSE_EMIT: &str = "emit";

fn default_value() -> Value {
    json!(1)
}

/// Parameters for a data source node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceParams {
    /// Value carried by every token when `values` is empty.
    #[serde(default = "default_value")]
    pub value: Value,
    /// Values cycled through in order, one per emission.
    #[serde(default)]
    pub values: Vec<Value>,
    /// Ticks between emissions. `None` emits once per `SimulationStart`.
    #[serde(default)]
    pub interval_ticks: Option<u64>,
    /// Upper bound on emissions from timers.
    #[serde(default)]
    pub max_emissions: Option<u64>,
    /// Prefix for correlation ids; defaults to the node id.
    #[serde(default)]
    pub correlation_prefix: Option<String>,
    /// Kind assigned to emitted tokens.
    #[serde(default)]
    pub kind: TokenKind,
    /// Ticks between the triggering event and the emission.
    #[serde(default)]
    pub processing_delay: u64,
}

/// Processor for [`NodeType::DataSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSourceProcessor;

impl DataSourceProcessor {
    fn next_value(params: &DataSourceParams, emitted_before: u64) -> Value {
        if params.values.is_empty() {
            return params.value.clone();
        }
        let len = u64::try_from(params.values.len()).unwrap_or(u64::MAX);
        let slot = usize::try_from(emitted_before.checked_rem(len).unwrap_or(0)).unwrap_or(0);
        params.values.get(slot).cloned().unwrap_or(Value::Null)
    }
}

impl NodeProcessor for DataSourceProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::DataSource
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::Timer]
    }

    fn initialize_state(&self, config: &NodeConfig) -> Result<NodeInternalState, ProcessorError> {
        let params: DataSourceParams = parse_params(config)?;
        if params.interval_ticks == Some(0) {
            return Err(ProcessorError::InvalidParams {
                node: config.id.clone(),
                reason: "intervalTicks must be positive".to_owned(),
            });
        }
        Ok(NodeInternalState::new(config))
    }

    fn process(
        &self,
        event: &Event,
        config: &NodeConfig,
        mut state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError> {
        let params: DataSourceParams = parse_params(config)?;
        let node = config.id.clone();

        if event.event_type == EventType::Timer && timer_purpose(event) != Some(PURPOSE_EMIT) {
            return Ok(ProcessorResult::unchanged(state));
        }
        let limit_reached = params
            .max_emissions
            .is_some_and(|max| state.counter(EMITTED) >= max);
        if limit_reached {
            let activity = info(&node, event, "exhausted", "emission limit reached");
            return Ok(ProcessorResult {
                new_events: Vec::new(),
                new_state: state,
                activities: vec![activity],
            });
        }

        let emitted_before = state.counter(EMITTED);
        let count = state.increment(EMITTED);
        let emit_tick = event.tick.saturating_add(params.processing_delay);
        let prefix = params
            .correlation_prefix
            .clone()
            .unwrap_or_else(|| node.to_string());
        let token = Token::new(
            mint_token_id(&mut state, emit_tick),
            Self::next_value(&params, emitted_before),
            node.clone(),
            emit_tick,
        )
        .with_correlation_ids(vec![format!("{prefix}-{count}")])
        .with_kind(params.kind);

        let port = primary_output(config);
        let mut new_events = vec![emit_token(event, &node, port, &token, emit_tick)];

        let more_allowed = params.max_emissions.is_none_or(|max| count < max);
        if let Some(interval) = params.interval_ticks.filter(|_| more_allowed) {
            new_events.push(schedule_timer(
                event,
                &node,
                event.tick.saturating_add(interval),
                json!({ TIMER_PURPOSE: PURPOSE_EMIT }),
            ));
        }

        let activity = info(&node, event, "emit", format!("emitted token {}", token.id))
            .with_data(json!({ "port": port, "value": token.value }));
        state.output_buffer = vec![token];

        Ok(ProcessorResult {
            new_events,
            new_state: state,
            activities: vec![activity],
        })
    }
}
