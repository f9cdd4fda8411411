//! The event store: an append-only, indexed log of every event.
//!
//! The [`EventStore`] is the single source of truth for a simulation. Events
//! are assigned an id and timing on append and never change afterwards.
//!
//! # Design
//!
//! - **Append-only**: entries are never modified or deleted.
//! - **Arena plus side tables**: events live in one `Vec`; the by-id,
//!   by-source-node and by-cause indices hold positions into it and are
//!   updated in the same call as the push.
//! - **Validated references**: a `caused_by` pointing at an unknown event,
//!   at the event itself, or a duplicate id fails the append. Because a
//!   parent must already exist, the causal graph cannot contain cycles.
//! - **Absence is not an error**: lookups of unknown ids return `None` or
//!   an empty list.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokenflow_types::{Event, EventId, EventType, NewEvent, NodeId};
use tracing::{debug, warn};

use crate::clock::{ClockError, TickClock};

/// Errors that can occur when appending to or (de)serializing the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The parent event does not exist.
    #[error("event {event} references unknown parent {caused_by}")]
    DanglingCause {
        /// The event being appended.
        event: EventId,
        /// The missing parent.
        caused_by: EventId,
    },

    /// The event names itself as its parent.
    #[error("event {id} cannot be caused by itself")]
    SelfReference {
        /// The offending event.
        id: EventId,
    },

    /// An event with this id already exists.
    #[error("duplicate event id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: EventId,
    },

    /// The tick could not be mapped onto the simulation timeline.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// Export or import failed to (de)serialize.
    #[error("event log serialization failed: {source}")]
    Serialization {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// A writer panicked while holding the store lock.
    #[error("event store lock poisoned")]
    LockPoisoned,
}

/// Append-only log of events with by-id, by-node and by-cause indices.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    /// Maps ticks to simulation timestamps.
    clock: TickClock,
    /// All events, in append order.
    events: Vec<Event>,
    /// Event id -> position in `events`.
    by_id: HashMap<EventId, usize>,
    /// Source node -> positions of the events it produced.
    by_node: HashMap<NodeId, Vec<usize>>,
    /// Parent event -> positions of its direct children.
    by_cause: HashMap<EventId, Vec<usize>>,
}

impl EventStore {
    /// Create an empty store using `clock` for simulation timestamps.
    pub fn new(clock: TickClock) -> Self {
        Self {
            clock,
            ..Self::default()
        }
    }

    /// Return the clock used to fill simulation timestamps.
    pub const fn clock(&self) -> &TickClock {
        &self.clock
    }

    /// Return the number of events in the log.
    pub const fn len(&self) -> usize {
        self.events.len()
    }

    /// Return whether the log has no events.
    pub const fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// Append a single event, assigning its id and default timing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the draft references an unknown or
    /// self-referencing parent, reuses an id, or its tick overflows the clock.
    pub fn append_event(&mut self, draft: NewEvent) -> Result<Event, StoreError> {
        let event = self.materialize(draft, &HashSet::new())?;
        self.commit(event.clone());
        Ok(event)
    }

    /// Append several events atomically: either all are appended or none.
    ///
    /// A draft may name an earlier draft of the same batch as its parent,
    /// provided that earlier draft carries a preassigned id.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] encountered; the log is unchanged.
    pub fn append_events(
        &mut self,
        drafts: impl IntoIterator<Item = NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut staged_ids = HashSet::new();
        let mut staged = Vec::new();
        for draft in drafts {
            let event = self.materialize(draft, &staged_ids)?;
            staged_ids.insert(event.id);
            staged.push(event);
        }
        for event in &staged {
            self.commit(event.clone());
        }
        debug!(count = staged.len(), total = self.events.len(), "Events appended");
        Ok(staged)
    }

    /// Validate a draft and turn it into an immutable event.
    fn materialize(
        &self,
        draft: NewEvent,
        staged: &HashSet<EventId>,
    ) -> Result<Event, StoreError> {
        let id = draft.id.unwrap_or_else(EventId::new);
        if self.by_id.contains_key(&id) || staged.contains(&id) {
            warn!(%id, "Rejected event with duplicate id");
            return Err(StoreError::DuplicateId { id });
        }
        if let Some(parent) = draft.caused_by {
            if parent == id {
                warn!(%id, "Rejected self-referencing event");
                return Err(StoreError::SelfReference { id });
            }
            if !self.by_id.contains_key(&parent) && !staged.contains(&parent) {
                warn!(%id, %parent, "Rejected event with dangling cause");
                return Err(StoreError::DanglingCause {
                    event: id,
                    caused_by: parent,
                });
            }
        }

        let simulation_timestamp = match draft.simulation_timestamp {
            Some(at) => at,
            None => self.clock.timestamp_for(draft.tick)?,
        };

        Ok(Event {
            id,
            tick: draft.tick,
            real_timestamp: draft.real_timestamp.unwrap_or_else(Utc::now),
            simulation_timestamp,
            event_type: draft.event_type,
            source_node_id: draft.source_node_id,
            target_node_id: draft.target_node_id,
            caused_by: draft.caused_by,
            correlation_ids: draft.correlation_ids,
            data: draft.data,
            metadata: draft.metadata,
        })
    }

    /// Push a validated event and update every index.
    fn commit(&mut self, event: Event) {
        let position = self.events.len();
        self.by_id.insert(event.id, position);
        self.by_node
            .entry(event.source_node_id.clone())
            .or_default()
            .push(position);
        if let Some(parent) = event.caused_by {
            self.by_cause.entry(parent).or_default().push(position);
        }
        self.events.push(event);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Return every event in append order.
    pub fn get_all_events(&self) -> &[Event] {
        &self.events
    }

    /// Look up an event by id.
    pub fn get_event_by_id(&self, id: EventId) -> Option<&Event> {
        self.by_id.get(&id).and_then(|&pos| self.events.get(pos))
    }

    /// Return the append position of an event.
    pub fn position_of(&self, id: EventId) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Return the event at an append position.
    pub fn get_event_at(&self, position: usize) -> Option<&Event> {
        self.events.get(position)
    }

    /// Return events whose tick lies in `start..=end`, in append order.
    pub fn get_events_by_time_range(&self, start: u64, end: u64) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.tick >= start && e.tick <= end)
            .collect()
    }

    /// Return events produced by `node`, in append order.
    pub fn get_events_by_node_id(&self, node: &NodeId) -> Vec<&Event> {
        self.by_node
            .get(node)
            .map(|positions| self.resolve(positions))
            .unwrap_or_default()
    }

    /// Return events addressed to `node`, in append order.
    pub fn get_events_by_target(&self, node: &NodeId) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.target_node_id.as_ref() == Some(node))
            .collect()
    }

    /// Return events of the given type, in append order.
    pub fn get_events_by_type(&self, event_type: EventType) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Return the direct children of an event.
    pub fn get_children(&self, id: EventId) -> Vec<&Event> {
        self.by_cause
            .get(&id)
            .map(|positions| self.resolve(positions))
            .unwrap_or_default()
    }

    /// Return events that no other event caused (external inputs).
    pub fn root_events(&self) -> Vec<&Event> {
        self.events.iter().filter(|e| e.caused_by.is_none()).collect()
    }

    /// Return `id` followed by every event it transitively caused, depth first.
    ///
    /// Unknown ids yield an empty chain. A visited set bounds the walk even
    /// if the indices were somehow inconsistent.
    pub fn get_causality_chain(&self, id: EventId) -> Vec<&Event> {
        let Some(root) = self.get_event_by_id(id) else {
            return Vec::new();
        };
        let mut chain = vec![root];
        let mut visited = HashSet::from([id]);
        let mut stack: Vec<usize> = self
            .by_cause
            .get(&id)
            .map(|children| children.iter().rev().copied().collect())
            .unwrap_or_default();

        while let Some(pos) = stack.pop() {
            let Some(event) = self.events.get(pos) else {
                continue;
            };
            if !visited.insert(event.id) {
                continue;
            }
            chain.push(event);
            if let Some(children) = self.by_cause.get(&event.id) {
                stack.extend(children.iter().rev().copied());
            }
        }
        chain
    }

    /// Walk `caused_by` back to the earliest known ancestor of `id`.
    ///
    /// Stops at the first missing parent or repeated id, so it terminates on
    /// malformed chains. Returns `None` only if `id` itself is unknown.
    pub fn get_root_cause(&self, id: EventId) -> Option<&Event> {
        let mut current = self.get_event_by_id(id)?;
        let mut visited = HashSet::from([id]);
        while let Some(parent_id) = current.caused_by {
            if !visited.insert(parent_id) {
                break;
            }
            match self.get_event_by_id(parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Some(current)
    }

    fn resolve(&self, positions: &[usize]) -> Vec<&Event> {
        positions.iter().filter_map(|&p| self.events.get(p)).collect()
    }

    // -----------------------------------------------------------------------
    // Export / Import
    // -----------------------------------------------------------------------

    /// Serialize the full log as JSON (for hashing, anchoring or persistence).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if serialization fails.
    pub fn export_events(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.events)?)
    }

    /// Replace the log with events previously produced by [`export_events`].
    ///
    /// Every reference is validated against the imported set and all three
    /// indices are rebuilt. On error the current log is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the JSON is malformed or any event has a
    /// duplicate id, a self reference or a dangling parent.
    ///
    /// [`export_events`]: EventStore::export_events
    pub fn import_events(&mut self, json: &str) -> Result<usize, StoreError> {
        let events: Vec<Event> = serde_json::from_str(json)?;
        self.replace_events(events)
    }

    /// Replace the log with an already-decoded list of events.
    ///
    /// # Errors
    ///
    /// See [`import_events`](EventStore::import_events).
    pub fn replace_events(&mut self, events: Vec<Event>) -> Result<usize, StoreError> {
        let mut ids = HashSet::with_capacity(events.len());
        for event in &events {
            if !ids.insert(event.id) {
                return Err(StoreError::DuplicateId { id: event.id });
            }
        }
        for event in &events {
            if let Some(parent) = event.caused_by {
                if parent == event.id {
                    return Err(StoreError::SelfReference { id: event.id });
                }
                if !ids.contains(&parent) {
                    return Err(StoreError::DanglingCause {
                        event: event.id,
                        caused_by: parent,
                    });
                }
            }
        }

        let mut rebuilt = Self::new(self.clock);
        for event in events {
            rebuilt.commit(event);
        }
        let count = rebuilt.len();
        *self = rebuilt;
        debug!(count, "Event log imported");
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cloneable handle to an [`EventStore`] shared between the replay engine
/// and external producers.
///
/// Every write takes the single write lock, so an append and its index
/// updates never interleave with another writer.
#[derive(Debug, Clone, Default)]
pub struct SharedEventStore {
    inner: Arc<RwLock<EventStore>>,
}

impl SharedEventStore {
    /// Wrap a store for sharing.
    pub fn new(store: EventStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Append one event under the write lock.
    ///
    /// # Errors
    ///
    /// See [`EventStore::append_event`]; also [`StoreError::LockPoisoned`].
    pub fn append_event(&self, draft: NewEvent) -> Result<Event, StoreError> {
        self.write(|store| store.append_event(draft))?
    }

    /// Append several events atomically under the write lock.
    ///
    /// # Errors
    ///
    /// See [`EventStore::append_events`]; also [`StoreError::LockPoisoned`].
    pub fn append_events(
        &self,
        drafts: impl IntoIterator<Item = NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        self.write(|store| store.append_events(drafts))?
    }

    /// Run `f` with shared read access.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] if a writer panicked.
    pub fn read<R>(&self, f: impl FnOnce(&EventStore) -> R) -> Result<R, StoreError> {
        let guard = self.inner.read().map_err(|_err| StoreError::LockPoisoned)?;
        Ok(f(&guard))
    }

    /// Run `f` with exclusive write access.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] if a writer panicked.
    pub fn write<R>(&self, f: impl FnOnce(&mut EventStore) -> R) -> Result<R, StoreError> {
        let mut guard = self.inner.write().map_err(|_err| StoreError::LockPoisoned)?;
        Ok(f(&mut guard))
    }

    /// Clone the full log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] if a writer panicked.
    pub fn events(&self) -> Result<Vec<Event>, StoreError> {
        self.read(|store| store.get_all_events().to_vec())
    }

    /// Return the number of events in the log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`] if a writer panicked.
    pub fn len(&self) -> Result<usize, StoreError> {
        self.read(EventStore::len)
    }

    /// Serialize the full log as JSON.
    ///
    /// # Errors
    ///
    /// See [`EventStore::export_events`].
    pub fn export_events(&self) -> Result<String, StoreError> {
        self.read(EventStore::export_events)?
    }

    /// Replace the log from JSON.
    ///
    /// # Errors
    ///
    /// See [`EventStore::import_events`].
    pub fn import_events(&self, json: &str) -> Result<usize, StoreError> {
        self.write(|store| store.import_events(json))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;
    use tokenflow_types::{NodeId, Token, TokenId};

    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    fn start(store: &mut EventStore, tick: u64) -> Event {
        store
            .append_event(NewEvent::simulation_start(&node("src"), tick))
            .unwrap()
    }

    #[test]
    fn append_assigns_id_and_is_retrievable() {
        let mut store = EventStore::default();
        let event = start(&mut store, 3);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_event_by_id(event.id), Some(&event));
        assert_eq!(event.tick, 3);
        assert_eq!(store.position_of(event.id), Some(0));
    }

    #[test]
    fn each_append_grows_log_by_one_and_leaves_earlier_events_unchanged() {
        let mut store = EventStore::default();
        let first = start(&mut store, 0);
        let before = store.get_event_by_id(first.id).cloned();
        for tick in 1..5 {
            let len = store.len();
            start(&mut store, tick);
            assert_eq!(store.len(), len + 1);
        }
        assert_eq!(store.get_event_by_id(first.id).cloned(), before);
    }

    #[test]
    fn simulation_timestamp_follows_the_clock() {
        let clock = TickClock::new(chrono::DateTime::<Utc>::default(), 1000).unwrap();
        let mut store = EventStore::new(clock);
        let event = start(&mut store, 5);
        assert_eq!(event.simulation_timestamp, clock.timestamp_for(5).unwrap());
    }

    #[test]
    fn dangling_cause_is_rejected() {
        let mut store = EventStore::default();
        let draft = NewEvent::simulation_start(&node("src"), 0).with_caused_by(EventId::new());
        let result = store.append_event(draft);
        assert!(matches!(result, Err(StoreError::DanglingCause { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut store = EventStore::default();
        let id = EventId::new();
        let draft = NewEvent::simulation_start(&node("src"), 0)
            .with_id(id)
            .with_caused_by(id);
        assert!(matches!(
            store.append_event(draft),
            Err(StoreError::SelfReference { .. })
        ));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut store = EventStore::default();
        let id = EventId::new();
        store
            .append_event(NewEvent::simulation_start(&node("src"), 0).with_id(id))
            .unwrap();
        let again = store.append_event(NewEvent::simulation_start(&node("src"), 1).with_id(id));
        assert!(matches!(again, Err(StoreError::DuplicateId { .. })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn batch_append_is_all_or_nothing() {
        let mut store = EventStore::default();
        let drafts = vec![
            NewEvent::simulation_start(&node("a"), 0),
            NewEvent::simulation_start(&node("b"), 0).with_caused_by(EventId::new()),
        ];
        assert!(store.append_events(drafts).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn batch_may_reference_earlier_draft() {
        let mut store = EventStore::default();
        let parent = EventId::new();
        let drafts = vec![
            NewEvent::simulation_start(&node("a"), 0).with_id(parent),
            NewEvent::new(0, EventType::Timer, node("a")).with_caused_by(parent),
        ];
        let appended = store.append_events(drafts).unwrap();
        assert_eq!(appended.len(), 2);
        assert_eq!(store.get_children(parent).len(), 1);
    }

    #[test]
    fn queries_filter_by_node_type_and_time() {
        let mut store = EventStore::default();
        start(&mut store, 0);
        store
            .append_event(NewEvent::new(4, EventType::Timer, node("batcher")))
            .unwrap();
        store
            .append_event(NewEvent::new(9, EventType::Timer, node("batcher")))
            .unwrap();

        assert_eq!(store.get_events_by_node_id(&node("batcher")).len(), 2);
        assert_eq!(store.get_events_by_node_id(&node("missing")).len(), 0);
        assert_eq!(store.get_events_by_type(EventType::SimulationStart).len(), 1);
        assert_eq!(store.get_events_by_time_range(1, 9).len(), 2);
        assert_eq!(store.get_events_by_time_range(5, 8).len(), 0);
        assert_eq!(store.get_events_by_time_range(9, 1).len(), 0);
    }

    #[test]
    fn causality_chain_contains_descendants() {
        let mut store = EventStore::default();
        let root = start(&mut store, 0);
        let child = store
            .append_event(NewEvent::new(1, EventType::TokenEmitted, node("src")).with_caused_by(root.id))
            .unwrap();
        let grandchild = store
            .append_event(
                NewEvent::new(1, EventType::TokenArrival, node("src"))
                    .with_target(node("sink"))
                    .with_caused_by(child.id),
            )
            .unwrap();
        let unrelated = start(&mut store, 2);

        let chain: Vec<EventId> = store.get_causality_chain(root.id).iter().map(|e| e.id).collect();
        assert_eq!(chain, vec![root.id, child.id, grandchild.id]);
        assert!(!chain.contains(&unrelated.id));
        assert!(store.get_causality_chain(EventId::new()).is_empty());
    }

    #[test]
    fn root_cause_walks_multi_hop_chains() {
        let mut store = EventStore::default();
        let root = start(&mut store, 0);
        let mut parent = root.id;
        for tick in 1..5 {
            parent = store
                .append_event(NewEvent::new(tick, EventType::Timer, node("src")).with_caused_by(parent))
                .unwrap()
                .id;
        }
        assert_eq!(store.get_root_cause(parent).map(|e| e.id), Some(root.id));
        assert_eq!(store.get_root_cause(root.id).map(|e| e.id), Some(root.id));
        assert!(store.get_root_cause(EventId::new()).is_none());
    }

    #[test]
    fn export_import_rebuilds_indices() {
        let mut store = EventStore::default();
        let root = start(&mut store, 0);
        let token = Token::new(TokenId::new("t"), json!(5), node("src"), 0);
        let child = store
            .append_event(
                NewEvent::token_arrival(0, &node("src"), &node("sink"), "in", &token)
                    .with_caused_by(root.id),
            )
            .unwrap();

        let json = store.export_events().unwrap();
        let mut restored = EventStore::default();
        assert_eq!(restored.import_events(&json).unwrap(), 2);

        assert_eq!(restored.get_all_events(), store.get_all_events());
        assert_eq!(restored.get_event_by_id(child.id), Some(&child));
        assert_eq!(restored.get_events_by_node_id(&node("src")).len(), 2);
        assert_eq!(restored.get_children(root.id).len(), 1);
        assert_eq!(restored.get_events_by_target(&node("sink")).len(), 1);
    }

    #[test]
    fn import_rejects_dangling_references() {
        let mut source = EventStore::default();
        let root = start(&mut source, 0);
        let child = source
            .append_event(NewEvent::new(1, EventType::Timer, node("src")).with_caused_by(root.id))
            .unwrap();
        let json = serde_json::to_string(&vec![child]).unwrap();

        let mut target = EventStore::default();
        start(&mut target, 7);
        assert!(matches!(
            target.import_events(&json),
            Err(StoreError::DanglingCause { .. })
        ));
        assert_eq!(target.len(), 1);
    }

    #[test]
    fn shared_store_serializes_writers() {
        let shared = SharedEventStore::default();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = shared.clone();
                std::thread::spawn(move || {
                    for tick in 0..25 {
                        store
                            .append_event(NewEvent::simulation_start(&NodeId::new(format!("n{i}")), tick))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.len().unwrap(), 100);
        let per_node = shared
            .read(|s| s.get_events_by_node_id(&NodeId::new("n2")).len())
            .unwrap();
        assert_eq!(per_node, 25);
    }
}
