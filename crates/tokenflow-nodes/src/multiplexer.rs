//! Routing multiplexer: each arriving token leaves on exactly one output.
//!
//! `random` and `weighted` draw from a [`StdRng`] seeded from the configured
//! seed, the node id, the tick and the number of tokens already routed, so
//! a replay of the same log makes the same choices.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{Value, json};
use tokenflow_types::{
    Activity, Event, EventType, NodeConfig, NodeId, NodeInternalState, NodeType, Token,
};

use crate::error::ProcessorError;
use crate::expr::Expr;
use crate::processor::{
    NodeProcessor, ProcessorResult, arriving_token, condition_context, emit_token, info,
    mint_token_id, parse_params, warning,
};

/// Tag naming the chosen output port.
pub const ROUTED_TO_TAG: &str = "routed_to";
/// Tag naming the strategy that made the choice.
pub const STRATEGY_TAG: &str = "route_strategy";

const ROUTED: &str = "routed";

/// How the output port is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Cycle through outputs in declaration order.
    #[default]
    RoundRobin,
    /// Uniform choice.
    Random,
    /// Choice proportional to `weights`.
    Weighted,
    /// First output whose condition matches.
    Conditional,
}

impl RoutingStrategy {
    const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Weighted => "weighted",
            Self::Conditional => "conditional",
        }
    }
}

/// Parameters for a multiplexer node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplexerParams {
    /// Routing strategy.
    #[serde(default)]
    pub strategy: RoutingStrategy,
    /// One weight per output, for `weighted`.
    #[serde(default)]
    pub weights: Vec<f64>,
    /// Output port to condition expression, for `conditional`.
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    /// Base seed for `random` and `weighted`.
    #[serde(default)]
    pub seed: u64,
    /// Ticks between arrival and emission.
    #[serde(default)]
    pub processing_delay: u64,
}

/// Processor for [`NodeType::Multiplexer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiplexerProcessor;

/// FNV-1a over the node id.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Mix the routing inputs into one seed.
fn routing_seed(seed: u64, node: &NodeId, tick: u64, routed: u64) -> u64 {
    [fnv1a(node.as_str().as_bytes()), tick, routed]
        .into_iter()
        .fold(seed, |acc, part| {
            (acc ^ part)
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                .rotate_left(31)
        })
}

/// Cumulative-weight pick. `None` when the weights cannot be sampled.
fn pick_weighted(weights: &[f64], draw: f64) -> Option<usize> {
    let valid = weights.iter().all(|w| w.is_finite() && *w >= 0.0);
    let total: f64 = weights.iter().sum();
    if !valid || total <= 0.0 {
        return None;
    }
    let target = draw * total;
    let mut cumulative = 0.0;
    for (idx, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if target < cumulative {
            return Some(idx);
        }
    }
    weights.iter().rposition(|w| *w > 0.0)
}

impl MultiplexerProcessor {
    fn round_robin(state: &mut NodeInternalState, n: usize) -> usize {
        let idx = state.routing_index.checked_rem(n).unwrap_or(0);
        state.routing_index = idx.saturating_add(1).checked_rem(n).unwrap_or(0);
        idx
    }

    fn choose(
        event: &Event,
        config: &NodeConfig,
        params: &MultiplexerParams,
        state: &mut NodeInternalState,
        token: &Token,
        activities: &mut Vec<Activity>,
    ) -> Result<(usize, RoutingStrategy), ProcessorError> {
        let node = &config.id;
        let n = config.outputs.len();
        let seed = routing_seed(params.seed, node, event.tick, state.counter(ROUTED));
        let rng = || StdRng::seed_from_u64(seed);

        match params.strategy {
            RoutingStrategy::RoundRobin => Ok((Self::round_robin(state, n), params.strategy)),
            RoutingStrategy::Random => Ok((rng().random_range(0..n), params.strategy)),
            RoutingStrategy::Weighted => {
                let draw: f64 = rng().random();
                let picked = if params.weights.len() == n {
                    pick_weighted(&params.weights, draw)
                } else {
                    None
                };
                if let Some(idx) = picked {
                    return Ok((idx, params.strategy));
                }
                activities.push(
                    warning(node, event, "weights_fallback", "weights unusable, using round robin")
                        .with_data(json!({ "weights": params.weights, "outputs": n })),
                );
                Ok((Self::round_robin(state, n), RoutingStrategy::RoundRobin))
            }
            RoutingStrategy::Conditional => {
                let ctx = condition_context(token, state);
                for (idx, port) in config.outputs.iter().enumerate() {
                    let Some(condition) = params.conditions.get(port) else {
                        continue;
                    };
                    let hit = Expr::parse(condition)
                        .and_then(|expr| expr.matches(&ctx))
                        .map_err(|source| ProcessorError::Expression {
                            node: node.clone(),
                            source,
                        })?;
                    if hit {
                        return Ok((idx, params.strategy));
                    }
                }
                Ok((0, params.strategy))
            }
        }
    }
}

impl NodeProcessor for MultiplexerProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Multiplexer
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::TokenArrival]
    }

    fn initialize_state(&self, config: &NodeConfig) -> Result<NodeInternalState, ProcessorError> {
        let _params: MultiplexerParams = parse_params(config)?;
        if config.outputs.is_empty() {
            return Err(ProcessorError::InvalidParams {
                node: config.id.clone(),
                reason: "multiplexer needs at least one output".to_owned(),
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
        let params: MultiplexerParams = parse_params(config)?;
        let node = config.id.clone();
        if config.outputs.is_empty() {
            return Err(ProcessorError::InvalidParams {
                node,
                reason: "multiplexer needs at least one output".to_owned(),
            });
        }
        let token = arriving_token(event, &node)?;

        let mut activities = Vec::new();
        let (idx, strategy) =
            Self::choose(event, config, &params, &mut state, &token, &mut activities)?;
        let port = config.outputs.get(idx).map_or("out", String::as_str);

        state.increment(ROUTED);
        state.increment(&format!("{ROUTED}:{port}"));
        let tick = event.tick.saturating_add(params.processing_delay);
        let out = token
            .derive(mint_token_id(&mut state, tick), &node, tick)
            .with_tag(ROUTED_TO_TAG, Value::String(port.to_owned()))
            .with_tag(STRATEGY_TAG, Value::String(strategy.as_str().to_owned()));

        activities.push(info(&node, event, "route", format!("routed {} to {port}", token.id)));
        let emission = emit_token(event, &node, port, &out, tick);
        state.output_buffer = vec![out];

        Ok(ProcessorResult {
            new_events: vec![emission],
            new_state: state,
            activities,
        })
    }
}
