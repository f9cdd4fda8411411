//! The replay engine: drives processors over the event log.
//!
//! A [`ReplayEngine`] owns the canonical node-state table for one session.
//! Each step takes the next event, resolves its handler node and processor,
//! runs the processor through [`invoke`], replaces only that node's entry in
//! the state table and, in live mode, appends the produced events to the
//! store and routes emitted tokens along scenario edges.
//!
//! # Lifecycle
//!
//! ```text
//! Configured --start_replay--> Replaying --stop--> Stopped
//!                                  ^                  |
//!                                  +--start_replay----+
//! ```
//!
//! # Time travel
//!
//! Every applied event is recorded on a timeline together with the events
//! it enqueued. Stepping backward or seeking restores the nearest snapshot
//! at or before the target (or the initial snapshot) and re-applies the
//! recorded steps forward, so history is never appended twice.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokenflow_events::{EventQueue, SharedEventStore, StoreError};
use tokenflow_nodes::{ProcessorRegistry, invoke};
use tokenflow_types::{
    Activity, ActivityLevel, Event, EventId, EventType, NewEvent, NodeId, NodeInternalState,
    PORT_KEY, Token,
};
use tracing::{debug, info, warn};

use crate::activity::{ActivityLogger, NoopActivityLogger};
use crate::config::ReplayConfig;
use crate::scenario::{Scenario, ScenarioError};
use crate::snapshot::{NodeStates, SnapshotCache, StateSnapshot};

/// Errors returned by replay operations.
///
/// Failures inside a single step are not errors here; they are recorded
/// as [`StepError`]s and the session continues.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The session has not been started.
    #[error("replay has not been started")]
    NotStarted,

    /// The session was stopped.
    #[error("replay is stopped")]
    Stopped,

    /// The requested event is not part of this session's timeline.
    #[error("event {id} is not on the replay timeline")]
    EventNotFound {
        /// The requested event.
        id: EventId,
    },

    /// The requested position lies beyond every known event.
    #[error("index {index} is beyond the {available} known events")]
    IndexOutOfRange {
        /// Requested position.
        index: usize,
        /// Number of events reachable.
        available: usize,
    },

    /// The scenario failed validation.
    #[error("invalid scenario: {source}")]
    Scenario {
        /// The underlying scenario error.
        #[from]
        source: ScenarioError,
    },

    /// The event store could not be read.
    #[error("event store error: {source}")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    /// Scenario loaded, not started.
    Configured,
    /// Actively stepping.
    Replaying,
    /// Idle; retains the last state.
    Stopped,
}

/// Where events come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaySource {
    /// The queue is seeded from the store's root events and produced events
    /// are appended back to the store.
    Live,
    /// An explicit, already complete event list. Produced events are
    /// discarded because the list already contains them.
    Recorded(Vec<Event>),
}

/// A failure attached to one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    /// Replay step (0-based) at which the failure happened.
    pub step: usize,
    /// The event being processed, if any.
    pub event_id: Option<EventId>,
    /// The node the failure is attributed to.
    pub node_id: Option<NodeId>,
    /// Short category (`"missing_node"`, `"invalid_params"`, ...).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

/// Summary returned by [`ReplayEngine::replay_all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    /// Whether no step failed.
    pub success: bool,
    /// Steps applied during this call.
    pub events_processed: usize,
    /// Every step failure recorded in the session.
    pub errors: Vec<StepError>,
    /// Tick of the last applied event.
    pub final_tick: u64,
}

/// Position of the session within its known events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayProgress {
    /// Session state.
    pub status: ReplayStatus,
    /// Steps applied.
    pub current_index: usize,
    /// Events known so far: the timeline plus, in live mode, the events
    /// pending at the frontier.
    pub total_events: usize,
    /// Events waiting in the queue right now.
    pub pending: usize,
    /// Tick of the last applied event.
    pub current_tick: u64,
    /// Store position of the last applied event.
    pub current_event_index: Option<usize>,
    /// `current_index / total_events`, 0 when nothing is known.
    pub fraction: f64,
}

/// One applied event and the events it placed on the queue.
#[derive(Debug, Clone)]
struct TimelineEntry {
    event: Event,
    enqueued: Vec<Event>,
    /// The step's state update was dropped because its events could not be
    /// committed. Re-applying the step drops it again.
    discarded: bool,
}

/// What dispatching one event produced, before it is committed.
#[derive(Debug, Default)]
struct Dispatch {
    update: Option<(NodeId, NodeInternalState)>,
    drafts: Vec<NewEvent>,
    activities: Vec<Activity>,
    error: Option<StepError>,
}

/// Report for one applied step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Steps applied after this one.
    pub cursor: usize,
    /// The applied event.
    pub event_id: EventId,
    /// Its tick.
    pub tick: u64,
    /// Events placed on the queue by this step.
    pub enqueued: usize,
    /// Whether the step recorded a failure.
    pub failed: bool,
}

/// Replays events through node processors with snapshot-based time travel.
pub struct ReplayEngine {
    scenario: Scenario,
    registry: ProcessorRegistry,
    store: SharedEventStore,
    config: ReplayConfig,
    logger: Arc<dyn ActivityLogger>,
    source: ReplaySource,
    status: ReplayStatus,

    node_states: NodeStates,
    queue: EventQueue,
    timeline: Vec<TimelineEntry>,
    cursor: usize,
    high_water: usize,
    frontier_pending: usize,
    current_tick: u64,
    current_event: Option<EventId>,
    current_event_index: Option<usize>,

    initial: Option<StateSnapshot>,
    snapshots: SnapshotCache,
    errors: Vec<StepError>,
}

impl core::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("status", &self.status)
            .field("cursor", &self.cursor)
            .field("timeline", &self.timeline.len())
            .field("pending", &self.queue.len())
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

impl ReplayEngine {
    /// Create a live session over `store`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Scenario`] if the scenario does not validate
    /// against `registry`.
    pub fn new(
        scenario: Scenario,
        registry: ProcessorRegistry,
        store: SharedEventStore,
        config: ReplayConfig,
    ) -> Result<Self, ReplayError> {
        scenario.validate(&registry)?;
        let snapshots = SnapshotCache::new(config.max_snapshots);
        Ok(Self {
            scenario,
            registry,
            store,
            config,
            logger: Arc::new(NoopActivityLogger),
            source: ReplaySource::Live,
            status: ReplayStatus::Configured,
            node_states: NodeStates::new(),
            queue: EventQueue::new(),
            timeline: Vec::new(),
            cursor: 0,
            high_water: 0,
            frontier_pending: 0,
            current_tick: 0,
            current_event: None,
            current_event_index: None,
            initial: None,
            snapshots,
            errors: Vec::new(),
        })
    }

    /// Replace the activity logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn ActivityLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Replace the event source. Takes effect at the next
    /// [`start_replay`](Self::start_replay).
    #[must_use]
    pub fn with_source(mut self, source: ReplaySource) -> Self {
        self.source = source;
        self
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Reset every node through its processor's `initialize_state`, seed
    /// the event source and capture the initial snapshot.
    ///
    /// A node whose parameters fail initialization starts from empty state
    /// and the failure is recorded as a step error.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Store`] if the store cannot be read.
    pub fn start_replay(&mut self) -> Result<(), ReplayError> {
        self.errors.clear();
        self.snapshots.clear();
        self.node_states = NodeStates::new();
        self.queue = EventQueue::new();
        self.cursor = 0;
        self.high_water = 0;
        self.current_tick = 0;
        self.current_event = None;
        self.current_event_index = None;

        for config in &self.scenario.nodes {
            let initialized = self
                .registry
                .get(config.node_type)
                .map(|processor| processor.initialize_state(config));
            let state = match initialized {
                Some(Ok(state)) => state,
                Some(Err(error)) => {
                    warn!(node = %config.id, "Node initialization failed: {error}");
                    self.errors.push(StepError {
                        step: 0,
                        event_id: None,
                        node_id: Some(config.id.clone()),
                        kind: "initialization".to_owned(),
                        message: error.to_string(),
                    });
                    NodeInternalState::new(config)
                }
                None => NodeInternalState::new(config),
            };
            self.node_states.insert(config.id.clone(), state);
        }

        match &self.source {
            ReplaySource::Live => {
                self.timeline.clear();
                let scenario = &self.scenario;
                let roots: Vec<Event> = self.store.read(|store| {
                    store
                        .root_events()
                        .into_iter()
                        .filter(|e| routable(scenario, e))
                        .cloned()
                        .collect()
                })?;
                self.queue.enqueue_all(roots);
                self.frontier_pending = self.queue.len();
            }
            ReplaySource::Recorded(events) => {
                self.timeline = events
                    .iter()
                    .map(|event| TimelineEntry {
                        event: event.clone(),
                        enqueued: Vec::new(),
                        discarded: false,
                    })
                    .collect();
                self.frontier_pending = 0;
            }
        }

        let initial = self.capture("initial");
        self.initial = Some(initial);
        self.status = ReplayStatus::Replaying;
        info!(
            nodes = self.node_states.len(),
            pending = self.queue.len(),
            timeline = self.timeline.len(),
            "Replay started"
        );
        Ok(())
    }

    /// Stop the session. Already applied state is kept; further steps are
    /// refused until [`start_replay`](Self::start_replay) is called again.
    pub fn stop(&mut self) {
        if self.status == ReplayStatus::Replaying {
            info!(cursor = self.cursor, "Replay stopped");
        }
        self.status = ReplayStatus::Stopped;
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Apply the next event. Returns `None` when no event is left.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::NotStarted`] or [`ReplayError::Stopped`] when
    /// the session is not replaying.
    pub fn step_forward(&mut self) -> Result<Option<StepReport>, ReplayError> {
        self.ensure_replaying()?;
        Ok(self.advance())
    }

    /// Undo the last step. Returns `false` when already at the start.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::NotStarted`] or [`ReplayError::Stopped`] when
    /// the session is not replaying.
    pub fn step_backward(&mut self) -> Result<bool, ReplayError> {
        self.ensure_replaying()?;
        let Some(target) = self.cursor.checked_sub(1) else {
            return Ok(false);
        };
        self.rewind_to(target)?;
        Ok(true)
    }

    /// Move to the state after `index` steps.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::IndexOutOfRange`] if fewer than `index` events
    /// can be reached, leaving the session at the furthest reachable step.
    pub fn seek_to_index(&mut self, index: usize) -> Result<(), ReplayError> {
        self.ensure_replaying()?;
        self.rewind_to(index)?;
        while self.cursor < index {
            if self.advance().is_none() {
                return Err(ReplayError::IndexOutOfRange {
                    index,
                    available: self.cursor,
                });
            }
        }
        Ok(())
    }

    /// Move to the state right after `id` was applied.
    ///
    /// An event that is never dispatched itself, such as a `TokenEmitted`,
    /// seeks to the step that produced it. In live mode a stored event not
    /// yet applied is searched for by stepping past the frontier, at most
    /// `max_steps` steps.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::EventNotFound`] if the event is unknown or not
    /// reached. The session is then left where it was.
    pub fn seek_to_event(&mut self, id: EventId) -> Result<(), ReplayError> {
        self.ensure_replaying()?;
        let target = self.seek_target(id)?;
        if let Some(pos) = self.timeline.iter().position(|e| e.event.id == target) {
            return self.seek_to_index(pos.saturating_add(1));
        }
        if !matches!(self.source, ReplaySource::Live) {
            return Err(ReplayError::EventNotFound { id });
        }

        let saved = self.cursor;
        self.rewind_to(self.timeline.len())?;
        let mut searched: usize = 0;
        while searched < self.config.max_steps {
            let Some(report) = self.advance() else {
                break;
            };
            if report.event_id == target {
                return Ok(());
            }
            searched = searched.saturating_add(1);
        }
        debug!(%id, searched, "Seek target not reached, returning to the saved step");
        self.rewind_to(saved)?;
        Err(ReplayError::EventNotFound { id })
    }

    /// Move to the state after every event with `tick <= bound` was applied.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::NotStarted`] or [`ReplayError::Stopped`] when
    /// the session is not replaying.
    pub fn seek_to_timestamp(&mut self, bound: u64) -> Result<(), ReplayError> {
        self.ensure_replaying()?;
        let within = self
            .timeline
            .iter()
            .position(|e| e.event.tick > bound)
            .unwrap_or(self.timeline.len());
        self.rewind_to(within)?;
        while self.cursor < within {
            if self.advance().is_none() {
                break;
            }
        }
        let at_frontier = self.cursor >= self.timeline.len();
        if at_frontier && matches!(self.source, ReplaySource::Live) {
            while self.queue.peek_tick().is_some_and(|tick| tick <= bound) {
                if self.advance().is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Step until no event is left or `max_steps` steps were taken.
    ///
    /// Starts the session first if it is still configured. Step failures
    /// never abort the run; they are collected in the result.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Stopped`] for a stopped session, or a store
    /// error from starting.
    pub fn replay_all(&mut self) -> Result<ReplayResult, ReplayError> {
        if self.status == ReplayStatus::Configured {
            self.start_replay()?;
        }
        self.ensure_replaying()?;

        let mut processed: usize = 0;
        while processed < self.config.max_steps {
            if self.advance().is_none() {
                break;
            }
            processed = processed.saturating_add(1);
        }
        if processed >= self.config.max_steps {
            warn!(max_steps = self.config.max_steps, "Replay hit the step limit");
        }

        info!(
            events_processed = processed,
            errors = self.errors.len(),
            final_tick = self.current_tick,
            "Replay finished"
        );
        Ok(ReplayResult {
            success: self.errors.is_empty(),
            events_processed: processed,
            errors: self.errors.clone(),
            final_tick: self.current_tick,
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Session state.
    pub const fn status(&self) -> ReplayStatus {
        self.status
    }

    /// The current node-state table.
    pub const fn get_current_state(&self) -> &NodeStates {
        &self.node_states
    }

    /// One node's current state.
    pub fn get_node_state(&self, node: &NodeId) -> Option<&NodeInternalState> {
        self.node_states.get(node)
    }

    /// Where the session stands.
    pub fn get_progress(&self) -> ReplayProgress {
        let total_events = self.timeline.len().saturating_add(self.frontier_pending);
        #[allow(clippy::cast_precision_loss)]
        let fraction = if total_events == 0 {
            0.0
        } else {
            self.cursor as f64 / total_events as f64
        };
        ReplayProgress {
            status: self.status,
            current_index: self.cursor,
            total_events,
            pending: self.queue.len(),
            current_tick: self.current_tick,
            current_event_index: self.current_event_index,
            fraction,
        }
    }

    /// Cached snapshots, oldest first.
    pub const fn snapshots(&self) -> &SnapshotCache {
        &self.snapshots
    }

    /// The snapshot captured by [`start_replay`](Self::start_replay).
    pub const fn initial_snapshot(&self) -> Option<&StateSnapshot> {
        self.initial.as_ref()
    }

    /// Every step failure recorded in this session.
    pub fn errors(&self) -> &[StepError] {
        &self.errors
    }

    /// Events applied so far, in order.
    pub fn applied_events(&self) -> impl Iterator<Item = &Event> {
        self.timeline.iter().take(self.cursor).map(|e| &e.event)
    }

    /// The last applied event.
    pub const fn current_event(&self) -> Option<EventId> {
        self.current_event
    }

    /// The store this session reads from and appends to.
    pub const fn store(&self) -> &SharedEventStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// The id of the step that applies `id`: the event itself when it is
    /// dispatched, otherwise its cause.
    fn seek_target(&self, id: EventId) -> Result<EventId, ReplayError> {
        if self.timeline.iter().any(|e| e.event.id == id) {
            return Ok(id);
        }
        let stored = self.store.read(|store| store.get_event_by_id(id).cloned())?;
        let Some(event) = stored else {
            return Err(ReplayError::EventNotFound { id });
        };
        if routable(&self.scenario, &event) {
            return Ok(id);
        }
        event.caused_by.ok_or(ReplayError::EventNotFound { id })
    }

    const fn ensure_replaying(&self) -> Result<(), ReplayError> {
        match self.status {
            ReplayStatus::Replaying => Ok(()),
            ReplayStatus::Configured => Err(ReplayError::NotStarted),
            ReplayStatus::Stopped => Err(ReplayError::Stopped),
        }
    }

    /// Apply one step. Steps below the high-water mark re-apply history
    /// quietly: nothing is appended, logged or recorded as an error again.
    fn advance(&mut self) -> Option<StepReport> {
        let live = matches!(self.source, ReplaySource::Live);
        let fresh = live && self.cursor >= self.timeline.len();
        let event = if live {
            self.queue.dequeue()?
        } else {
            self.timeline.get(self.cursor)?.event.clone()
        };
        let quiet = self.cursor < self.high_water;
        let step = self.cursor;

        let dispatch = self.dispatch(&event, step);
        let mut error = dispatch.error;
        let mut update = dispatch.update;
        if !fresh && self.timeline.get(step).is_some_and(|entry| entry.discarded) {
            update = None;
        }
        let mut discarded = false;

        let enqueued = if fresh {
            match self.commit(&event, dispatch.drafts) {
                Ok(enqueued) => enqueued,
                Err(store_error) => {
                    warn!(event_id = %event.id, "Failed to append produced events: {store_error}");
                    update = None;
                    discarded = true;
                    error = Some(StepError {
                        step,
                        event_id: Some(event.id),
                        node_id: Some(event.handler_node().clone()),
                        kind: "store".to_owned(),
                        message: store_error.to_string(),
                    });
                    Vec::new()
                }
            }
        } else if live {
            self.timeline
                .get(step)
                .map(|entry| entry.enqueued.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        if let Some((node, state)) = update {
            self.node_states.insert(node, state);
        }
        let enqueued_count = enqueued.len();
        if fresh {
            self.queue.enqueue_all(enqueued.iter().cloned());
            self.timeline.push(TimelineEntry {
                event: event.clone(),
                enqueued,
                discarded,
            });
            self.frontier_pending = self.queue.len();
        } else if live {
            self.queue.enqueue_all(enqueued);
        }

        if !quiet {
            for activity in &dispatch.activities {
                self.logger.log(activity);
            }
            if let Some(err) = &error {
                self.errors.push(err.clone());
            }
        }

        self.cursor = self.cursor.saturating_add(1);
        self.high_water = self.high_water.max(self.cursor);
        self.current_tick = event.tick;
        self.current_event = Some(event.id);
        self.current_event_index = self
            .store
            .read(|store| store.position_of(event.id))
            .ok()
            .flatten();

        if self
            .config
            .snapshot_strategy
            .is_due(self.cursor, self.config.snapshot_interval)
            && !self.snapshots.contains(self.cursor)
        {
            let snapshot = self.capture("step");
            self.snapshots.insert(snapshot);
        }

        debug!(
            step,
            event_id = %event.id,
            event_type = %event.event_type,
            tick = event.tick,
            enqueued = enqueued_count,
            "Step applied"
        );
        Some(StepReport {
            cursor: self.cursor,
            event_id: event.id,
            tick: event.tick,
            enqueued: enqueued_count,
            failed: error.is_some(),
        })
    }

    /// Resolve the handler and run its processor. Pure with respect to the
    /// engine: nothing is committed here.
    fn dispatch(&self, event: &Event, step: usize) -> Dispatch {
        if !event.event_type.is_dispatchable() {
            return Dispatch::default();
        }
        let node_id = event.handler_node();
        let Some(config) = self.scenario.node(node_id) else {
            return protocol_violation(
                event,
                step,
                "missing_node",
                format!("no node {node_id} in scenario"),
            );
        };
        let Some(processor) = self.registry.get(config.node_type) else {
            return protocol_violation(
                event,
                step,
                "unregistered_processor",
                format!("no processor for node type {}", config.node_type),
            );
        };

        let current = self
            .node_states
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| NodeInternalState::new(config));
        let invocation = invoke(processor, event, config, &current);
        let error = invocation.error.map(|e| StepError {
            step,
            event_id: Some(event.id),
            node_id: Some(e.node().clone()),
            kind: e.kind().to_owned(),
            message: e.to_string(),
        });
        let update = error
            .is_none()
            .then(|| (node_id.clone(), invocation.result.new_state));
        Dispatch {
            update,
            drafts: invocation.result.new_events,
            activities: invocation.result.activities,
            error,
        }
    }

    /// Append produced events plus the arrivals their emissions route to,
    /// atomically. Returns the appended events that belong on the queue.
    ///
    /// When the store already holds what `cause` produced, from an earlier
    /// session over the same log, those events are reused and nothing is
    /// appended.
    fn commit(&self, cause: &Event, drafts: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let recorded = self.recorded_consequences(cause.id)?;
        if !recorded.is_empty() {
            debug!(
                cause = %cause.id,
                recorded = recorded.len(),
                "Reusing recorded consequences"
            );
            return Ok(recorded
                .into_iter()
                .filter(|e| routable(&self.scenario, e))
                .collect());
        }
        let mut batch = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if draft.event_type != EventType::TokenEmitted {
                batch.push(draft);
                continue;
            }
            let id = draft.id.unwrap_or_else(EventId::new);
            let draft = draft.with_id(id);
            let port = draft
                .metadata
                .get(PORT_KEY)
                .and_then(Value::as_str)
                .unwrap_or("out")
                .to_owned();
            let token: Option<Token> = serde_json::from_value(draft.data.clone()).ok();
            let arrivals: Vec<NewEvent> = token.as_ref().map_or_else(Vec::new, |token| {
                self.scenario
                    .outgoing(&draft.source_node_id, &port)
                    .map(|edge| {
                        NewEvent::token_arrival(
                            draft.tick,
                            &draft.source_node_id,
                            &edge.target,
                            &edge.target_port,
                            token,
                        )
                        .with_caused_by(id)
                    })
                    .collect()
            });
            if arrivals.is_empty() {
                debug!(
                    node = %draft.source_node_id,
                    port = %port,
                    cause = %cause.id,
                    "Emission has no downstream edge"
                );
            }
            batch.push(draft);
            batch.extend(arrivals);
        }

        let appended = self.store.append_events(batch)?;
        Ok(appended
            .into_iter()
            .filter(|e| routable(&self.scenario, e))
            .collect())
    }

    /// Events already stored as produced by `cause`, with the arrivals their
    /// emissions routed to, in store order.
    fn recorded_consequences(&self, cause: EventId) -> Result<Vec<Event>, StoreError> {
        self.store.read(|store| {
            let mut derived: Vec<&Event> = Vec::new();
            for child in store.get_children(cause) {
                derived.push(child);
                if child.event_type == EventType::TokenEmitted {
                    derived.extend(store.get_children(child.id));
                }
            }
            derived.sort_by_key(|e| store.position_of(e.id));
            derived.into_iter().cloned().collect()
        })
    }

    fn capture(&self, kind: &str) -> StateSnapshot {
        let source = match self.source {
            ReplaySource::Live => "live",
            ReplaySource::Recorded(_) => "recorded",
        };
        StateSnapshot {
            timestamp: Utc::now(),
            tick: self.current_tick,
            event_id: self.current_event,
            event_index: self.current_event_index,
            cursor: self.cursor,
            node_states: self.node_states.clone(),
            pending: self.queue.clone(),
            metadata: [
                ("kind".to_owned(), json!(kind)),
                ("source".to_owned(), json!(source)),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn restore(&mut self, snapshot: &StateSnapshot) {
        self.node_states = snapshot.node_states.clone();
        self.queue = snapshot.pending.clone();
        self.cursor = snapshot.cursor;
        self.current_tick = snapshot.tick;
        self.current_event = snapshot.event_id;
        self.current_event_index = snapshot.event_index;
    }

    /// Bring the session to `target` steps using recorded history only.
    /// Targets beyond the recorded timeline stop at its end.
    fn rewind_to(&mut self, target: usize) -> Result<(), ReplayError> {
        let target = target.min(self.high_water);
        let forward_from_here = self.cursor <= target;
        let base = match self.snapshots.nearest_at_or_before(target) {
            Some(snapshot) => snapshot.clone(),
            None => self.initial.clone().ok_or(ReplayError::NotStarted)?,
        };

        if !(forward_from_here && self.cursor >= base.cursor) {
            debug!(from = self.cursor, to = target, snapshot = base.cursor, "Restoring snapshot");
            self.restore(&base);
        }
        while self.cursor < target {
            if self.advance().is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Whether `event` goes on the queue: it must be a processor input whose
/// handler node exists in the scenario.
fn routable(scenario: &Scenario, event: &Event) -> bool {
    event.event_type.is_dispatchable() && scenario.node(event.handler_node()).is_some()
}

fn protocol_violation(event: &Event, step: usize, kind: &str, message: String) -> Dispatch {
    let node = event.handler_node().clone();
    warn!(event_id = %event.id, %node, kind, "{message}");
    let activity = Activity::for_event(&node, event, ActivityLevel::Error, kind, message.clone());
    Dispatch {
        update: None,
        drafts: Vec::new(),
        activities: vec![activity],
        error: Some(StepError {
            step,
            event_id: Some(event.id),
            node_id: Some(node),
            kind: kind.to_owned(),
            message,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tokenflow_events::EventStore;
    use tokenflow_types::{Edge, NodeConfig, NodeType};

    use super::*;
    use crate::snapshot::SnapshotStrategy;

    fn pipeline() -> Scenario {
        Scenario::new(
            vec![
                NodeConfig::new("src", NodeType::DataSource).with_params(json!({ "value": 5 })),
                NodeConfig::new("mux", NodeType::Multiplexer).with_outputs(&["a", "b"]),
                NodeConfig::new("left", NodeType::Sink),
                NodeConfig::new("right", NodeType::Sink),
            ],
            vec![
                Edge::new("src", "out", "mux", "in"),
                Edge::new("mux", "a", "left", "in"),
                Edge::new("mux", "b", "right", "in"),
            ],
        )
    }

    fn ticking_source() -> Scenario {
        Scenario::new(
            vec![
                NodeConfig::new("src", NodeType::DataSource)
                    .with_params(json!({ "intervalTicks": 2, "maxEmissions": 3 })),
                NodeConfig::new("sink", NodeType::Sink),
            ],
            vec![Edge::new("src", "out", "sink", "in")],
        )
    }

    fn seeded_store(starts: &[(&str, u64)]) -> SharedEventStore {
        let store = SharedEventStore::new(EventStore::default());
        for (node, tick) in starts {
            store
                .append_event(NewEvent::simulation_start(&NodeId::new(*node), *tick))
                .unwrap();
        }
        store
    }

    fn engine(scenario: Scenario, store: SharedEventStore) -> ReplayEngine {
        ReplayEngine::new(
            scenario,
            ProcessorRegistry::standard(),
            store,
            ReplayConfig::default(),
        )
        .unwrap()
    }

    fn received(engine: &ReplayEngine, node: &str) -> u64 {
        engine
            .get_node_state(&NodeId::new(node))
            .unwrap()
            .counter("received")
    }

    #[test]
    fn stepping_requires_a_started_session() {
        let mut engine = engine(pipeline(), seeded_store(&[("src", 0)]));
        assert!(matches!(engine.step_forward(), Err(ReplayError::NotStarted)));

        engine.start_replay().unwrap();
        assert!(engine.step_forward().unwrap().is_some());

        engine.stop();
        assert_eq!(engine.status(), ReplayStatus::Stopped);
        assert!(matches!(engine.step_forward(), Err(ReplayError::Stopped)));
        assert!(matches!(engine.replay_all(), Err(ReplayError::Stopped)));
    }

    #[test]
    fn tokens_fan_out_along_edges() {
        let store = seeded_store(&[("src", 0), ("src", 0), ("src", 1), ("src", 1)]);
        let mut engine = engine(pipeline(), store.clone());
        let result = engine.replay_all().unwrap();

        assert!(result.success, "{:?}", result.errors);
        // 4 starts, 4 mux arrivals, 4 sink arrivals.
        assert_eq!(result.events_processed, 12);
        assert_eq!(result.final_tick, 1);
        assert_eq!(received(&engine, "left"), 2);
        assert_eq!(received(&engine, "right"), 2);
        assert_eq!(
            engine.get_node_state(&NodeId::new("mux")).unwrap().routing_index,
            0
        );

        let arrivals = store
            .read(|s| s.get_events_by_type(EventType::TokenArrival).len())
            .unwrap();
        assert_eq!(arrivals, 8);
    }

    #[test]
    fn arrivals_are_caused_by_their_emission() {
        let store = seeded_store(&[("src", 0)]);
        let mut engine = engine(pipeline(), store.clone());
        engine.replay_all().unwrap();

        store
            .read(|s| {
                for arrival in s.get_events_by_type(EventType::TokenArrival) {
                    let parent = s.get_event_by_id(arrival.caused_by.unwrap()).unwrap();
                    assert_eq!(parent.event_type, EventType::TokenEmitted);
                    assert_eq!(parent.tick, arrival.tick);
                    assert_eq!(parent.token(), arrival.token());
                }
            })
            .unwrap();
    }

    #[test]
    fn step_backward_matches_forward_history() {
        let mut engine = engine(pipeline(), seeded_store(&[("src", 0), ("src", 0)]));
        engine.start_replay().unwrap();

        let mut history = vec![engine.get_current_state().clone()];
        while engine.step_forward().unwrap().is_some() {
            history.push(engine.get_current_state().clone());
        }
        let appended = engine.store().len().unwrap();

        for expected in history.iter().rev().skip(1) {
            assert!(engine.step_backward().unwrap());
            assert_eq!(engine.get_current_state(), expected);
        }
        assert!(!engine.step_backward().unwrap());
        assert_eq!(engine.get_progress().current_index, 0);
        assert_eq!(engine.store().len().unwrap(), appended);
    }

    #[test]
    fn rewinding_without_snapshots_replays_from_start() {
        let store = seeded_store(&[("src", 0), ("src", 0)]);
        let config = ReplayConfig {
            snapshot_strategy: SnapshotStrategy::Never,
            ..ReplayConfig::default()
        };
        let mut engine =
            ReplayEngine::new(pipeline(), ProcessorRegistry::standard(), store, config).unwrap();
        engine.replay_all().unwrap();
        let end = engine.get_current_state().clone();
        assert!(engine.snapshots().is_empty());

        engine.seek_to_index(3).unwrap();
        assert_eq!(engine.get_progress().current_index, 3);
        engine.replay_all().unwrap();
        assert_eq!(engine.get_current_state(), &end);
    }

    #[test]
    fn seek_to_timestamp_applies_everything_up_to_the_bound() {
        let mut engine = engine(ticking_source(), seeded_store(&[("src", 0)]));
        engine.start_replay().unwrap();

        engine.seek_to_timestamp(2).unwrap();
        assert_eq!(received(&engine, "sink"), 2);
        assert_eq!(engine.get_progress().current_tick, 2);

        engine.seek_to_timestamp(0).unwrap();
        assert_eq!(received(&engine, "sink"), 1);

        let result = engine.replay_all().unwrap();
        assert!(result.success);
        assert_eq!(received(&engine, "sink"), 3);
        assert_eq!(result.final_tick, 4);
    }

    #[test]
    fn seek_to_event_lands_after_it() {
        let mut engine = engine(ticking_source(), seeded_store(&[("src", 0)]));
        engine.replay_all().unwrap();
        let third = engine.applied_events().nth(2).unwrap().id;

        engine.seek_to_index(0).unwrap();
        engine.seek_to_event(third).unwrap();
        assert_eq!(engine.get_progress().current_index, 3);
        assert_eq!(engine.current_event(), Some(third));

        assert!(matches!(
            engine.seek_to_event(EventId::new()),
            Err(ReplayError::EventNotFound { .. })
        ));
    }

    #[test]
    fn unknown_event_leaves_the_session_in_place() {
        let scenario = Scenario::new(
            vec![
                NodeConfig::new("src", NodeType::DataSource)
                    .with_params(json!({ "intervalTicks": 1, "maxEmissions": 5 })),
                NodeConfig::new("sink", NodeType::Sink),
            ],
            vec![Edge::new("src", "out", "sink", "in")],
        );
        let mut engine = engine(scenario, seeded_store(&[("src", 0)]));
        engine.start_replay().unwrap();
        engine.step_forward().unwrap();
        let state = engine.get_current_state().clone();
        let logged = engine.store().len().unwrap();

        assert!(matches!(
            engine.seek_to_event(EventId::new()),
            Err(ReplayError::EventNotFound { .. })
        ));
        assert_eq!(engine.get_progress().current_index, 1);
        assert_eq!(engine.get_current_state(), &state);
        assert_eq!(engine.store().len().unwrap(), logged);
    }

    #[test]
    fn seek_reaches_stored_events_not_yet_applied() {
        let mut engine = engine(ticking_source(), seeded_store(&[("src", 0)]));
        engine.start_replay().unwrap();
        engine.step_forward().unwrap();

        let (timer, emission) = engine
            .store()
            .read(|s| {
                let timer = s.get_events_by_type(EventType::Timer).first().map(|e| e.id);
                let emitted = s.get_events_by_type(EventType::TokenEmitted);
                let emission = emitted.first().map(|e| (*e).clone());
                (timer.unwrap(), emission.unwrap())
            })
            .unwrap();

        engine.seek_to_event(timer).unwrap();
        assert_eq!(engine.current_event(), Some(timer));

        // An emission is never dispatched; seeking to it lands on its cause.
        engine.seek_to_event(emission.id).unwrap();
        assert_eq!(engine.current_event(), emission.caused_by);
        assert_eq!(engine.get_progress().current_index, 1);
    }

    #[test]
    fn a_dropped_update_stays_dropped_on_reapply() {
        let store = seeded_store(&[("src", 0)]);
        let mut engine = engine(ticking_source(), store.clone());
        engine.start_replay().unwrap();
        engine.step_forward().unwrap();

        let poisoned = store.clone();
        let _ = std::thread::spawn(move || {
            poisoned.write(|_| {
                let poison = true;
                assert!(!poison, "poison the store lock");
            })
        })
        .join();

        let report = engine.step_forward().unwrap().unwrap();
        assert!(report.failed);
        assert_eq!(received(&engine, "sink"), 0);
        let after_failure = engine.get_current_state().clone();

        assert!(engine.step_backward().unwrap());
        engine.step_forward().unwrap();
        assert_eq!(engine.get_current_state(), &after_failure);
        let kinds: Vec<_> = engine.errors().iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, ["store"]);
    }

    #[test]
    fn seek_past_the_end_is_out_of_range() {
        let mut engine = engine(pipeline(), seeded_store(&[("src", 0)]));
        engine.start_replay().unwrap();
        assert!(matches!(
            engine.seek_to_index(50),
            Err(ReplayError::IndexOutOfRange { index: 50, available: 3 })
        ));
    }

    #[test]
    fn recorded_list_reproduces_live_state() {
        let mut live = engine(pipeline(), seeded_store(&[("src", 0), ("src", 1), ("src", 1)]));
        live.replay_all().unwrap();
        let recorded: Vec<Event> = live.applied_events().cloned().collect();

        let empty = SharedEventStore::default();
        let mut replay =
            engine(pipeline(), empty.clone()).with_source(ReplaySource::Recorded(recorded));
        let result = replay.replay_all().unwrap();

        assert!(result.success);
        assert_eq!(replay.get_current_state(), live.get_current_state());
        assert_eq!(empty.len().unwrap(), 0);
    }

    #[test]
    fn missing_node_fails_only_its_step() {
        let store = seeded_store(&[("src", 0)]);
        let mut events = store.events().unwrap();
        let ghost = store
            .append_event(NewEvent::simulation_start(&NodeId::new("ghost"), 0))
            .unwrap();
        events.insert(0, ghost.clone());

        let mut engine = engine(pipeline(), store).with_source(ReplaySource::Recorded(events));
        let result = engine.replay_all().unwrap();

        assert!(!result.success);
        assert_eq!(result.events_processed, 2);
        assert_eq!(result.errors.len(), 1);
        let error = result.errors.first().unwrap();
        assert_eq!(error.kind, "missing_node");
        assert_eq!(error.event_id, Some(ghost.id));
        assert_eq!(
            engine.get_node_state(&NodeId::new("src")).unwrap().counter("emitted"),
            1
        );
    }

    #[test]
    fn bad_params_are_recorded_at_start() {
        let scenario = Scenario::new(
            vec![
                NodeConfig::new("src", NodeType::DataSource)
                    .with_params(json!({ "intervalTicks": 0 })),
            ],
            Vec::new(),
        );
        let mut engine = engine(scenario, seeded_store(&[]));
        engine.start_replay().unwrap();
        let kinds: Vec<_> = engine.errors().iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, ["initialization"]);
    }

    #[test]
    fn snapshots_follow_the_strategy() {
        let config = ReplayConfig {
            snapshot_strategy: SnapshotStrategy::EveryN,
            snapshot_interval: 2,
            ..ReplayConfig::default()
        };
        let mut engine = ReplayEngine::new(
            pipeline(),
            ProcessorRegistry::standard(),
            seeded_store(&[("src", 0), ("src", 0)]),
            config,
        )
        .unwrap();
        engine.replay_all().unwrap();

        let cursors: Vec<_> = engine.snapshots().iter().map(|s| s.cursor).collect();
        assert_eq!(cursors, [2, 4, 6]);
        let initial = engine.initial_snapshot().unwrap();
        assert_eq!(initial.cursor, 0);
        assert_eq!(initial.metadata.get("kind"), Some(&json!("initial")));
        assert_eq!(initial.pending.len(), 2);
    }

    #[test]
    fn progress_counts_the_frontier() {
        let mut engine = engine(pipeline(), seeded_store(&[("src", 0)]));
        engine.start_replay().unwrap();
        let progress = engine.get_progress();
        assert_eq!(progress.status, ReplayStatus::Replaying);
        assert_eq!((progress.current_index, progress.total_events), (0, 1));

        engine.replay_all().unwrap();
        let progress = engine.get_progress();
        assert_eq!((progress.current_index, progress.total_events), (3, 3));
        assert_eq!(progress.pending, 0);
        assert!((progress.fraction - 1.0).abs() < f64::EPSILON);
        assert!(progress.current_event_index.is_some());
    }
}
