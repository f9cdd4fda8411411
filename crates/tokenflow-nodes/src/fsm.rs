//! Finite-state-machine node.
//!
//! Every arriving token is tested against the transitions leaving the
//! current state, in declaration order; the first one whose guard matches
//! (an absent guard always matches) fires. Whether or not a transition
//! fires, the token is forwarded downstream tagged with the node's current
//! state.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};
use tokenflow_types::{
    Event, EventType, NodeConfig, NodeInternalState, NodeType, StateTransitionRecord,
};

use crate::error::ProcessorError;
use crate::expr::Expr;
use crate::processor::{
    NodeProcessor, ProcessorResult, arriving_token, audit_event, condition_context, emit_token,
    info, mint_token_id, parse_params, primary_output,
};

/// Tag carrying the FSM state on forwarded tokens.
pub const STATE_TAG: &str = "fsm_state";

/// One declared transition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDef {
    /// Source state.
    pub from: String,
    /// Destination state.
    pub to: String,
    /// Optional condition expression.
    #[serde(default)]
    pub guard: Option<String>,
    /// Variable assignments applied when the transition fires.
    #[serde(default)]
    pub set: BTreeMap<String, Value>,
}

/// Parameters for an FSM node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmParams {
    /// State entered on start.
    pub initial_state: String,
    /// Declared states. When non-empty, transitions must stay within it.
    #[serde(default)]
    pub states: Vec<String>,
    /// Transitions in priority order.
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
    /// Initial variable values.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Ticks between arrival and forwarding.
    #[serde(default)]
    pub processing_delay: u64,
}

impl FsmParams {
    fn validate(&self, config: &NodeConfig) -> Result<(), ProcessorError> {
        if self.states.is_empty() {
            return Ok(());
        }
        let known = |s: &String| self.states.contains(s);
        let unknown = std::iter::once(&self.initial_state)
            .chain(self.transitions.iter().flat_map(|t| [&t.from, &t.to]))
            .find(|s| !known(s));
        match unknown {
            Some(state) => Err(ProcessorError::InvalidParams {
                node: config.id.clone(),
                reason: format!("undeclared state `{state}`"),
            }),
            None => Ok(()),
        }
    }
}

/// Processor for [`NodeType::Fsm`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FsmProcessor;

fn reset(state: &mut NodeInternalState, params: &FsmParams) {
    state.current_state = Some(params.initial_state.clone());
    state.variables.clone_from(&params.variables);
}

impl NodeProcessor for FsmProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Fsm
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::TokenArrival]
    }

    fn initialize_state(&self, config: &NodeConfig) -> Result<NodeInternalState, ProcessorError> {
        let params: FsmParams = parse_params(config)?;
        params.validate(config)?;
        let mut state = NodeInternalState::new(config);
        reset(&mut state, &params);
        Ok(state)
    }

    fn process(
        &self,
        event: &Event,
        config: &NodeConfig,
        mut state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError> {
        let params: FsmParams = parse_params(config)?;
        let node = config.id.clone();

        if event.event_type == EventType::SimulationStart {
            reset(&mut state, &params);
            let activity = info(&node, event, "start", format!("entered {}", params.initial_state));
            return Ok(ProcessorResult {
                new_events: Vec::new(),
                new_state: state,
                activities: vec![activity],
            });
        }

        let token = arriving_token(event, &node)?;
        let current = state
            .current_state
            .clone()
            .unwrap_or_else(|| params.initial_state.clone());
        state.current_state = Some(current.clone());

        let ctx = condition_context(&token, &state);
        let mut fired = None;
        for transition in params.transitions.iter().filter(|t| t.from == current) {
            let matches = match &transition.guard {
                None => true,
                Some(guard) => Expr::parse(guard)
                    .and_then(|expr| expr.matches(&ctx))
                    .map_err(|source| ProcessorError::Expression {
                        node: node.clone(),
                        source,
                    })?,
            };
            if matches {
                fired = Some(transition);
                break;
            }
        }

        let mut new_events = Vec::new();
        let mut activities = Vec::new();
        if let Some(transition) = fired {
            let record = StateTransitionRecord {
                from: current.clone(),
                to: transition.to.clone(),
                tick: event.tick,
                trigger: token.id.to_string(),
            };
            for (key, value) in &transition.set {
                state.variables.insert(key.clone(), value.clone());
            }
            state.current_state = Some(transition.to.clone());
            state.increment("transitions");
            new_events.push(audit_event(
                event,
                &node,
                EventType::StateTransition,
                serde_json::to_value(&record).unwrap_or_default(),
            ));
            activities.push(
                info(&node, event, "transition", format!("{} -> {}", record.from, record.to))
                    .with_data(json!({ "trigger": record.trigger })),
            );
            state.state_history.push(record);
        } else {
            activities.push(info(&node, event, "absorb", format!("no transition from {current}")));
        }

        let tick = event.tick.saturating_add(params.processing_delay);
        let tag = state.current_state.clone().map_or(Value::Null, Value::String);
        let out = token
            .derive(mint_token_id(&mut state, tick), &node, tick)
            .with_tag(STATE_TAG, tag);
        new_events.push(emit_token(event, &node, primary_output(config), &out, tick));
        state.output_buffer = vec![out];

        Ok(ProcessorResult {
            new_events,
            new_state: state,
            activities,
        })
    }
}
