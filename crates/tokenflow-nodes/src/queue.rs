//! Single-server queue node.
//!
//! Arrivals are served immediately when the server is idle, buffered while
//! it is busy, and dropped with a `TokenDropped` event once the buffer is at
//! capacity. Service completion is a self-addressed `Timer`.
//!
//! Every input port feeds one arrival-ordered waiting line, kept under the
//! first declared input, so the discipline holds across ports.

use serde::Deserialize;
use serde_json::json;
use tokenflow_types::{
    Event, EventType, NewEvent, NodeConfig, NodeId, NodeInternalState, NodeType, Token,
};

use crate::error::ProcessorError;
use crate::processor::{
    NodeProcessor, ProcessorResult, TIMER_PURPOSE, arriving_token, audit_event, emit_token, info,
    mint_token_id, parse_params, primary_output, schedule_timer, timer_purpose, warning,
};

const PURPOSE_SERVICE: &str = "service_complete";

/// Which buffered token is served next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Discipline {
    /// Oldest first.
    #[default]
    Fifo,
    /// Newest first.
    Lifo,
}

/// Parameters for a queue node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueParams {
    /// Maximum number of buffered tokens. Unbounded when absent.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// Service order.
    #[serde(default)]
    pub discipline: Discipline,
    /// Ticks needed to serve one token.
    #[serde(default)]
    pub service_ticks: u64,
}

/// Processor for [`NodeType::Queue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueProcessor;

struct Step<'a> {
    event: &'a Event,
    config: &'a NodeConfig,
    params: &'a QueueParams,
    events: Vec<NewEvent>,
}

impl Step<'_> {
    fn node(&self) -> &NodeId {
        &self.config.id
    }

    /// Start serving `token` at the event's tick.
    fn serve(&mut self, state: &mut NodeInternalState, token: &Token) {
        let tick = self.event.tick;
        let done = tick.saturating_add(self.params.service_ticks);
        let out = token.derive(mint_token_id(state, done), self.node(), done);
        let port = primary_output(self.config);
        self.events.push(emit_token(self.event, self.node(), port, &out, done));
        state.increment("served");
        if self.params.service_ticks > 0 {
            state.busy_until = Some(done);
            self.events.push(schedule_timer(
                self.event,
                self.node(),
                done,
                json!({ TIMER_PURPOSE: PURPOSE_SERVICE }),
            ));
        }
    }
}

/// Input buffer holding the waiting line.
fn waiting_line(config: &NodeConfig) -> &str {
    config.inputs.first().map_or("in", String::as_str)
}

fn take_next(buffer: &mut Vec<Token>, discipline: Discipline) -> Option<Token> {
    if buffer.is_empty() {
        return None;
    }
    match discipline {
        Discipline::Fifo => Some(buffer.remove(0)),
        Discipline::Lifo => buffer.pop(),
    }
}

impl NodeProcessor for QueueProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Queue
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::TokenArrival, EventType::Timer]
    }

    fn process(
        &self,
        event: &Event,
        config: &NodeConfig,
        mut state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError> {
        let params: QueueParams = parse_params(config)?;
        let node = config.id.clone();
        let mut step = Step {
            event,
            config,
            params: &params,
            events: Vec::new(),
        };
        let mut activities = Vec::new();
        let line = waiting_line(config);

        match event.event_type {
            EventType::TokenArrival => {
                let token = arriving_token(event, &node)?;
                let busy = state.busy_until.is_some_and(|until| until > event.tick);
                if !busy && state.buffered() == 0 {
                    step.serve(&mut state, &token);
                    activities.push(info(&node, event, "serve", format!("serving {}", token.id)));
                } else if params.capacity.is_some_and(|cap| state.buffered() >= cap) {
                    state.increment("dropped");
                    let payload = serde_json::to_value(&token).unwrap_or_default();
                    step.events.push(
                        audit_event(event, &node, EventType::TokenDropped, payload)
                            .with_meta("reason", json!("capacity")),
                    );
                    activities.push(
                        warning(&node, event, "drop", format!("dropped {} at capacity", token.id))
                            .with_data(json!({ "capacity": params.capacity })),
                    );
                } else {
                    state.buffer_mut(line).push(token);
                    state.increment("enqueued");
                }
            }
            EventType::Timer if timer_purpose(event) == Some(PURPOSE_SERVICE) => {
                state.busy_until = None;
                let next = take_next(state.buffer_mut(line), params.discipline);
                if let Some(token) = next {
                    step.serve(&mut state, &token);
                }
            }
            _ => {}
        }

        Ok(ProcessorResult {
            new_events: step.events,
            new_state: state,
            activities,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::processor::invoke;
    use crate::processor::tests::{arrival, emitted, event};

    fn config(params: Value) -> NodeConfig {
        NodeConfig::new("q", NodeType::Queue).with_params(params)
    }

    fn service_timer(tick: u64) -> Event {
        let mut ev = event(tick, EventType::Timer, "q");
        ev.data = json!({ TIMER_PURPOSE: PURPOSE_SERVICE });
        ev
    }

    #[test]
    fn idle_queue_forwards_immediately() {
        let cfg = config(Value::Null);
        let state = QueueProcessor.initialize_state(&cfg).unwrap();
        let out = invoke(&QueueProcessor, &arrival(2, "q", "in", json!(7)), &cfg, &state);

        let tokens = emitted(&out.result);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.first().map(|(_, t)| t.value.clone()), Some(json!(7)));
        assert_eq!(out.result.new_state.busy_until, None);
    }

    #[test]
    fn busy_server_buffers_then_drops_over_capacity() {
        let cfg = config(json!({ "capacity": 1, "serviceTicks": 5 }));
        let s0 = QueueProcessor.initialize_state(&cfg).unwrap();
        let s1 = invoke(&QueueProcessor, &arrival(0, "q", "in", json!(1)), &cfg, &s0);
        assert_eq!(s1.result.new_state.busy_until, Some(5));
        assert_eq!(s1.result.new_events.first().map(|e| e.tick), Some(5));

        let s2 = invoke(
            &QueueProcessor,
            &arrival(1, "q", "in", json!(2)),
            &cfg,
            &s1.result.new_state,
        );
        assert!(s2.result.new_events.is_empty());
        assert_eq!(s2.result.new_state.buffered(), 1);

        let s3 = invoke(
            &QueueProcessor,
            &arrival(2, "q", "in", json!(3)),
            &cfg,
            &s2.result.new_state,
        );
        assert_eq!(
            s3.result.new_events.first().map(|e| e.event_type),
            Some(EventType::TokenDropped)
        );
        assert_eq!(s3.result.new_state.counter("dropped"), 1);

        let s4 = invoke(&QueueProcessor, &service_timer(5), &cfg, &s3.result.new_state);
        let tokens = emitted(&s4.result);
        assert_eq!(tokens.first().map(|(_, t)| t.value.clone()), Some(json!(2)));
        assert_eq!(s4.result.new_state.buffered(), 0);
        assert_eq!(s4.result.new_state.busy_until, Some(10));
    }

    #[test]
    fn lifo_serves_newest() {
        let cfg = config(json!({ "serviceTicks": 1, "discipline": "lifo" }));
        let mut state = QueueProcessor.initialize_state(&cfg).unwrap();
        for (tick, v) in [(0, 1), (0, 2), (0, 3)] {
            state = invoke(&QueueProcessor, &arrival(tick, "q", "in", json!(v)), &cfg, &state)
                .result
                .new_state;
        }
        let out = invoke(&QueueProcessor, &service_timer(1), &cfg, &state);
        assert_eq!(emitted(&out.result).first().map(|(_, t)| t.value.clone()), Some(json!(3)));
    }

    #[test]
    fn fifo_spans_every_input_port() {
        let cfg = NodeConfig::new("q", NodeType::Queue)
            .with_inputs(&["x", "y"])
            .with_params(json!({ "serviceTicks": 10 }));
        let mut state = QueueProcessor.initialize_state(&cfg).unwrap();
        let mut served = Vec::new();
        let arrivals = [
            (0, "x", "a1"),
            (0, "y", "b1"),
            (1, "y", "b2"),
            (2, "y", "b3"),
            (3, "x", "a2"),
            (6, "x", "a3"),
        ];
        for (tick, port, v) in arrivals {
            let out = invoke(&QueueProcessor, &arrival(tick, "q", port, json!(v)), &cfg, &state);
            served.extend(emitted(&out.result).into_iter().map(|(_, t)| t.value));
            state = out.result.new_state;
        }
        for tick in [10, 20, 30, 40, 50] {
            let out = invoke(&QueueProcessor, &service_timer(tick), &cfg, &state);
            served.extend(emitted(&out.result).into_iter().map(|(_, t)| t.value));
            state = out.result.new_state;
        }
        let order = ["a1", "b1", "b2", "b3", "a2", "a3"].map(|v| json!(v));
        assert_eq!(served, order);
        assert_eq!(state.buffered(), 0);
    }
}
