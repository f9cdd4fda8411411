//! General-purpose processing node: transform, aggregate or join.

use serde::Deserialize;
use serde_json::{Map, Number, Value, json};
use tokenflow_types::{Event, EventType, NodeConfig, NodeId, NodeInternalState, NodeType, Token};

use crate::error::ProcessorError;
use crate::processor::{
    NodeProcessor, ProcessorResult, arriving_token, emit_token, info, mint_token_id,
    parse_params, primary_output,
};

/// What the node does with arriving tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// One token in, one token out.
    #[default]
    Transform,
    /// Collect `window` tokens, emit one summary.
    Aggregate,
    /// Wait for one token per input port, emit an object keyed by port.
    Join,
}

/// Operation applied in transform mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Pass the value through.
    #[default]
    Identity,
    /// Add `operand` to a numeric value.
    Add,
    /// Multiply a numeric value by `operand`.
    Multiply,
    /// Replace the value with `operand`.
    Set,
}

/// Summary function in aggregate mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    /// Sum of values.
    #[default]
    Sum,
    /// Arithmetic mean.
    Avg,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Number of tokens.
    Count,
}

const fn default_window() -> usize {
    1
}

/// Parameters for a process node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessParams {
    /// Processing mode.
    #[serde(default)]
    pub mode: ProcessMode,
    /// Transform operation.
    #[serde(default)]
    pub operation: Operation,
    /// Operand for `add`, `multiply` and `set`.
    #[serde(default)]
    pub operand: Value,
    /// Aggregate function.
    #[serde(default)]
    pub function: AggregateFn,
    /// Tokens per aggregate.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Ticks between arrival and emission.
    #[serde(default)]
    pub processing_delay: u64,
}

/// Processor for [`NodeType::ProcessNode`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessNodeProcessor;

fn numeric(node: &NodeId, value: &Value) -> Result<f64, ProcessorError> {
    value.as_f64().ok_or_else(|| ProcessorError::InvalidToken {
        node: node.clone(),
        reason: format!("expected a number, got {value}"),
    })
}

/// Keep integral results as JSON integers.
#[allow(clippy::cast_possible_truncation)]
fn number(n: f64) -> Value {
    if n.trunc().total_cmp(&n).is_eq() && n.abs() < 9.0e15 {
        return json!(n as i64);
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}

fn transform(
    node: &NodeId,
    params: &ProcessParams,
    value: &Value,
) -> Result<Value, ProcessorError> {
    match params.operation {
        Operation::Identity => Ok(value.clone()),
        Operation::Set => Ok(params.operand.clone()),
        Operation::Add => Ok(number(numeric(node, value)? + numeric(node, &params.operand)?)),
        Operation::Multiply => {
            Ok(number(numeric(node, value)? * numeric(node, &params.operand)?))
        }
    }
}

fn aggregate(
    node: &NodeId,
    function: AggregateFn,
    tokens: &[Token],
) -> Result<Value, ProcessorError> {
    if function == AggregateFn::Count {
        return Ok(json!(tokens.len()));
    }
    let values = tokens
        .iter()
        .map(|t| numeric(node, &t.value))
        .collect::<Result<Vec<_>, _>>()?;
    let sum: f64 = values.iter().sum();
    let result = match function {
        AggregateFn::Sum => sum,
        #[allow(clippy::cast_precision_loss)]
        AggregateFn::Avg => sum / values.len().max(1) as f64,
        AggregateFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Count => return Ok(json!(values.len())),
    };
    Ok(number(result))
}

fn union_lineage(tokens: &[Token]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in tokens.iter().flat_map(|t| t.correlation_ids.iter()) {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}

impl ProcessNodeProcessor {
    fn combined(
        state: &mut NodeInternalState,
        node: &NodeId,
        tick: u64,
        value: Value,
        members: &[Token],
    ) -> Token {
        Token::new(mint_token_id(state, tick), value, node.clone(), tick)
            .with_correlation_ids(union_lineage(members))
    }
}

impl NodeProcessor for ProcessNodeProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::ProcessNode
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::TokenArrival]
    }

    fn initialize_state(&self, config: &NodeConfig) -> Result<NodeInternalState, ProcessorError> {
        let params: ProcessParams = parse_params(config)?;
        if params.mode == ProcessMode::Aggregate && params.window == 0 {
            return Err(ProcessorError::InvalidParams {
                node: config.id.clone(),
                reason: "window must be positive".to_owned(),
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
        if event.event_type == EventType::SimulationStart {
            return Ok(ProcessorResult::unchanged(state));
        }
        let params: ProcessParams = parse_params(config)?;
        let node = config.id.clone();
        let token = arriving_token(event, &node)?;
        let tick = event.tick.saturating_add(params.processing_delay);
        let port = primary_output(config);

        let out = match params.mode {
            ProcessMode::Transform => {
                let value = transform(&node, &params, &token.value)?;
                let mut out = token.derive(mint_token_id(&mut state, tick), &node, tick);
                out.value = value;
                Some(out)
            }
            ProcessMode::Aggregate => {
                let input = event.port().unwrap_or("in").to_owned();
                state.buffer_mut(&input).push(token);
                let ready = state.buffered() >= params.window.max(1);
                if ready {
                    let members: Vec<Token> =
                        state.input_buffers.values_mut().flat_map(std::mem::take).collect();
                    let value = aggregate(&node, params.function, &members)?;
                    Some(Self::combined(&mut state, &node, tick, value, &members))
                } else {
                    None
                }
            }
            ProcessMode::Join => {
                let input = event.port().unwrap_or("in").to_owned();
                state.buffer_mut(&input).push(token);
                let ready = config
                    .inputs
                    .iter()
                    .all(|p| state.input_buffers.get(p).is_some_and(|b| !b.is_empty()));
                if ready {
                    let mut joined = Map::new();
                    let mut members = Vec::new();
                    for p in &config.inputs {
                        let head = state
                            .input_buffers
                            .get_mut(p)
                            .filter(|b| !b.is_empty())
                            .map(|b| b.remove(0));
                        if let Some(t) = head {
                            joined.insert(p.clone(), t.value.clone());
                            members.push(t);
                        }
                    }
                    Some(Self::combined(&mut state, &node, tick, Value::Object(joined), &members))
                } else {
                    None
                }
            }
        };

        let Some(out) = out else {
            return Ok(ProcessorResult::unchanged(state));
        };
        state.increment("processed");
        let activity = info(&node, event, "process", format!("emitted {}", out.id))
            .with_data(json!({ "value": out.value }));
        let emission = emit_token(event, &node, port, &out, tick);
        state.output_buffer = vec![out];
        Ok(ProcessorResult {
            new_events: vec![emission],
            new_state: state,
            activities: vec![activity],
        })
    }
}
