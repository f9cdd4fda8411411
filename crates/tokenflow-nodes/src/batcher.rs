//! Batcher: accumulates data tokens and flushes them as one batch token.
//!
//! A batch opens with its first token. It flushes when it reaches
//! `batch_size`, when the flush condition matches, or when its timeout timer
//! fires. Timers carry the sequence number of the batch that scheduled
//! them, so a timer that outlives its batch is recognised as stale and
//! ignored. Tokens of any kind other than `data` skip batching entirely.

use std::cmp::Reverse;

use serde::Deserialize;
use serde_json::{Value, json};
use tokenflow_types::{
    BatchAccumulator, Event, EventType, NewEvent, NodeConfig, NodeId, NodeInternalState, NodeType,
    Token, TokenKind,
};

use crate::error::ProcessorError;
use crate::expr::Expr;
use crate::processor::{
    NodeProcessor, ProcessorResult, TIMER_PURPOSE, arriving_token, audit_event, condition_context,
    emit_token, info, mint_token_id, parse_params, primary_output, schedule_timer, timer_purpose,
};

const PURPOSE_TIMEOUT: &str = "batch_timeout";
const BATCH_SEQ_KEY: &str = "batchSeq";
/// Tag read by `priority` ordering. Higher values flush first.
pub const PRIORITY_TAG: &str = "priority";

/// Order of members inside a flushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOrdering {
    /// Arrival order.
    #[default]
    Fifo,
    /// Reverse arrival order.
    Lifo,
    /// Descending `priority` tag, ties in arrival order.
    Priority,
    /// Ascending creation tick, ties in arrival order.
    Timestamp,
}

const fn default_batch_size() -> usize {
    10
}

/// Parameters for a batcher node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherParams {
    /// Members per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Ticks after the first member before a partial batch flushes.
    #[serde(default)]
    pub timeout_ticks: Option<u64>,
    /// Member order in the flushed token.
    #[serde(default)]
    pub ordering: BatchOrdering,
    /// Extra flush trigger evaluated after each arrival.
    #[serde(default)]
    pub flush_condition: Option<String>,
    /// Ticks between the trigger and the emission.
    #[serde(default)]
    pub processing_delay: u64,
}

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Size,
    Condition,
    Timeout,
}

impl FlushReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::Condition => "condition",
            Self::Timeout => "timeout",
        }
    }
}

/// Processor for [`NodeType::Batcher`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatcherProcessor;

fn order_members(mut tokens: Vec<Token>, ordering: BatchOrdering) -> Vec<Token> {
    match ordering {
        BatchOrdering::Fifo => {}
        BatchOrdering::Lifo => tokens.reverse(),
        BatchOrdering::Priority => {
            tokens.sort_by_key(|t| {
                let p = t.tags.get(PRIORITY_TAG).and_then(Value::as_i64).unwrap_or(0);
                Reverse(p)
            });
        }
        BatchOrdering::Timestamp => tokens.sort_by_key(|t| t.created_at_tick),
    }
    tokens
}

fn union_lineage(tokens: &[Token]) -> Vec<String> {
    let mut ids = Vec::new();
    for id in tokens.iter().flat_map(|t| &t.correlation_ids) {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}

fn flush(
    event: &Event,
    config: &NodeConfig,
    params: &BatcherParams,
    state: &mut NodeInternalState,
    reason: FlushReason,
) -> Vec<NewEvent> {
    let Some(batch) = state.batch.take() else {
        return Vec::new();
    };
    let node = &config.id;
    let tick = event.tick.saturating_add(params.processing_delay);
    let members = order_members(batch.tokens, params.ordering);
    let size = members.len();
    let member_ids: Vec<String> = members.iter().map(|t| t.id.to_string()).collect();
    let values: Vec<Value> = members.iter().map(|t| t.value.clone()).collect();

    let out = Token::new(mint_token_id(state, tick), Value::Array(values), node.clone(), tick)
        .with_correlation_ids(union_lineage(&members))
        .with_tag("batch_size", json!(size))
        .with_tag("batch_seq", json!(batch.batch_seq))
        .with_tag("flush_reason", json!(reason.as_str()));
    state.increment("batches_flushed");

    let audit = audit_event(
        event,
        node,
        EventType::BatchFlushed,
        json!({
            BATCH_SEQ_KEY: batch.batch_seq,
            "size": size,
            "reason": reason.as_str(),
            "members": member_ids,
            "startedAtTick": batch.started_at_tick,
        }),
    )
    .with_correlation_ids(out.correlation_ids.clone());
    let emission = emit_token(event, node, primary_output(config), &out, tick);
    state.output_buffer = vec![out];
    vec![audit, emission]
}

impl BatcherProcessor {
    fn arrival(
        event: &Event,
        config: &NodeConfig,
        params: &BatcherParams,
        mut state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError> {
        let node: &NodeId = &config.id;
        let token = arriving_token(event, node)?;
        let mut new_events = Vec::new();
        let mut activities = Vec::new();

        if token.kind != TokenKind::Data {
            let tick = event.tick.saturating_add(params.processing_delay);
            let out = token
                .derive(mint_token_id(&mut state, tick), node, tick)
                .with_tag("bypassed_batch", Value::Bool(true));
            state.increment("bypassed");
            let message = format!("{} token bypassed batch", token.kind.as_str());
            activities.push(info(node, event, "bypass", message));
            new_events.push(emit_token(event, node, primary_output(config), &out, tick));
            return Ok(ProcessorResult {
                new_events,
                new_state: state,
                activities,
            });
        }

        if state.batch.is_none() {
            let seq = state.increment("batches_opened");
            state.batch = Some(BatchAccumulator {
                batch_seq: seq,
                started_at_tick: event.tick,
                tokens: Vec::new(),
            });
            if let Some(timeout) = params.timeout_ticks {
                new_events.push(schedule_timer(
                    event,
                    node,
                    event.tick.saturating_add(timeout),
                    json!({ TIMER_PURPOSE: PURPOSE_TIMEOUT, BATCH_SEQ_KEY: seq }),
                ));
            }
        }

        let (size, age) = match state.batch.as_mut() {
            Some(batch) => {
                batch.tokens.push(token.clone());
                (batch.tokens.len(), event.tick.saturating_sub(batch.started_at_tick))
            }
            None => (0, 0),
        };

        let mut reason = (size >= params.batch_size).then_some(FlushReason::Size);
        if let (None, Some(condition)) = (reason, params.flush_condition.as_ref()) {
            let mut ctx = condition_context(&token, &state);
            if let Some(obj) = ctx.as_object_mut() {
                obj.insert("batch".to_owned(), json!({ "size": size, "age": age }));
            }
            let hit = Expr::parse(condition)
                .and_then(|expr| expr.matches(&ctx))
                .map_err(|source| ProcessorError::Expression {
                    node: node.clone(),
                    source,
                })?;
            if hit {
                reason = Some(FlushReason::Condition);
            }
        }

        if let Some(reason) = reason {
            activities.push(
                info(node, event, "flush", format!("flushed {size} tokens"))
                    .with_data(json!({ "reason": reason.as_str() })),
            );
            new_events.extend(flush(event, config, params, &mut state, reason));
        }

        Ok(ProcessorResult {
            new_events,
            new_state: state,
            activities,
        })
    }

    fn timeout(
        event: &Event,
        config: &NodeConfig,
        params: &BatcherParams,
        mut state: NodeInternalState,
    ) -> ProcessorResult {
        let node = &config.id;
        let timer_seq = event.data.get(BATCH_SEQ_KEY).and_then(Value::as_u64);
        let current = state.batch.as_ref().map(|b| b.batch_seq);

        if timer_seq.is_none() || timer_seq != current {
            state.increment("stale_timers");
            let activity = info(node, event, "stale_timer", "ignored timer for a finished batch")
                .with_data(json!({ "timerSeq": timer_seq, "openSeq": current }));
            return ProcessorResult {
                new_events: Vec::new(),
                new_state: state,
                activities: vec![activity],
            };
        }

        let activity = info(node, event, "flush", "batch timed out")
            .with_data(json!({ "reason": FlushReason::Timeout.as_str() }));
        let new_events = flush(event, config, params, &mut state, FlushReason::Timeout);
        ProcessorResult {
            new_events,
            new_state: state,
            activities: vec![activity],
        }
    }
}

impl NodeProcessor for BatcherProcessor {
    fn node_type(&self) -> NodeType {
        NodeType::Batcher
    }

    fn supported_events(&self) -> &'static [EventType] {
        &[EventType::SimulationStart, EventType::TokenArrival, EventType::Timer]
    }

    fn initialize_state(&self, config: &NodeConfig) -> Result<NodeInternalState, ProcessorError> {
        let params: BatcherParams = parse_params(config)?;
        if params.batch_size == 0 {
            return Err(ProcessorError::InvalidParams {
                node: config.id.clone(),
                reason: "batchSize must be positive".to_owned(),
            });
        }
        Ok(NodeInternalState::new(config))
    }

    fn process(
        &self,
        event: &Event,
        config: &NodeConfig,
        state: NodeInternalState,
    ) -> Result<ProcessorResult, ProcessorError> {
        let params: BatcherParams = parse_params(config)?;
        match event.event_type {
            EventType::TokenArrival => Self::arrival(event, config, &params, state),
            EventType::Timer if timer_purpose(event) == Some(PURPOSE_TIMEOUT) => {
                Ok(Self::timeout(event, config, &params, state))
            }
            _ => Ok(ProcessorResult::unchanged(state)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokenflow_types::TokenId;

    use super::*;
    use crate::processor::invoke;
    use crate::processor::tests::{arrival, arrival_of, emitted, event};

    fn batcher(params: Value) -> NodeConfig {
        NodeConfig::new("b", NodeType::Batcher).with_params(params)
    }

    fn timeout_event(tick: u64, seq: u64) -> Event {
        let mut ev = event(tick, EventType::Timer, "b");
        ev.data = json!({ TIMER_PURPOSE: PURPOSE_TIMEOUT, BATCH_SEQ_KEY: seq });
        ev
    }

    fn feed(cfg: &NodeConfig, events: &[Event]) -> (NodeInternalState, Vec<Token>) {
        let mut state = BatcherProcessor.initialize_state(cfg).unwrap();
        let mut out = Vec::new();
        for ev in events {
            let step = invoke(&BatcherProcessor, ev, cfg, &state);
            assert!(step.is_ok(), "{:?}", step.error);
            out.extend(emitted(&step.result).into_iter().map(|(_, t)| t));
            state = step.result.new_state;
        }
        (state, out)
    }

    #[test]
    fn size_flush_leaves_remainder_pending() {
        let cfg = batcher(json!({ "batchSize": 3 }));
        let arrivals: Vec<Event> = ["a", "b", "c", "d"]
            .iter()
            .zip(0_u64..)
            .map(|(v, tick)| arrival(tick, "b", "in", json!(v)))
            .collect();
        let (state, out) = feed(&cfg, &arrivals);

        assert_eq!(out.len(), 1);
        let batch = out.first().unwrap();
        assert_eq!(batch.value, json!(["a", "b", "c"]));
        assert_eq!(batch.correlation_ids, vec!["c0", "c1", "c2"]);
        assert_eq!(batch.tags.get("flush_reason"), Some(&json!("size")));
        let pending = state.batch.unwrap();
        assert_eq!(pending.tokens.len(), 1);
        assert_eq!(pending.batch_seq, 2);
    }

    #[test]
    fn stale_timer_does_not_flush_again() {
        let cfg = batcher(json!({ "batchSize": 2, "timeoutTicks": 10 }));
        let events = [
            arrival(0, "b", "in", json!(1)),
            arrival(1, "b", "in", json!(2)),
            timeout_event(10, 1),
        ];
        let (state, out) = feed(&cfg, &events);
        assert_eq!(out.len(), 1);
        assert_eq!(state.counter("stale_timers"), 1);
        assert_eq!(state.counter("batches_flushed"), 1);
    }

    #[test]
    fn live_timer_flushes_partial_batch() {
        let cfg = batcher(json!({ "batchSize": 5, "timeoutTicks": 4 }));
        let first = arrival(0, "b", "in", json!(1));
        let state = BatcherProcessor.initialize_state(&cfg).unwrap();
        let step = invoke(&BatcherProcessor, &first, &cfg, &state);
        let timer = step
            .result
            .new_events
            .iter()
            .find(|e| e.event_type == EventType::Timer)
            .unwrap();
        assert_eq!(timer.tick, 4);

        let mut wake = event(4, EventType::Timer, "b");
        wake.data = timer.data.clone();
        let flushed = invoke(&BatcherProcessor, &wake, &cfg, &step.result.new_state);
        let tokens = emitted(&flushed.result);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.first().map(|(_, t)| t.value.clone()), Some(json!([1])));
        assert!(flushed.result.new_state.batch.is_none());
        assert!(
            flushed
                .result
                .new_events
                .iter()
                .any(|e| e.event_type == EventType::BatchFlushed)
        );
    }

    #[test]
    fn control_tokens_bypass_batching() {
        let cfg = batcher(json!({ "batchSize": 3 }));
        let token = Token::new(TokenId::new("ctl"), json!("stop"), NodeId::new("up"), 0)
            .with_kind(TokenKind::Control);
        let (state, out) = feed(&cfg, &[arrival_of(0, "b", "in", &token)]);
        assert_eq!(out.len(), 1);
        assert!(state.batch.is_none());
        assert_eq!(state.counter("bypassed"), 1);
    }

    #[test]
    fn flush_condition_and_priority_ordering() {
        let cfg = batcher(json!({
            "batchSize": 10,
            "ordering": "priority",
            "flushCondition": "batch.size >= 2 && value == 'urgent'"
        }));
        let low = Token::new(TokenId::new("low"), json!("normal"), NodeId::new("up"), 0)
            .with_tag(PRIORITY_TAG, json!(1));
        let high = Token::new(TokenId::new("high"), json!("urgent"), NodeId::new("up"), 1)
            .with_tag(PRIORITY_TAG, json!(9));
        let (_, out) = feed(
            &cfg,
            &[arrival_of(0, "b", "in", &low), arrival_of(1, "b", "in", &high)],
        );
        assert_eq!(out.first().map(|t| t.value.clone()), Some(json!(["urgent", "normal"])));
        assert_eq!(
            out.first().and_then(|t| t.tags.get("flush_reason").cloned()),
            Some(json!("condition"))
        );
    }
}
