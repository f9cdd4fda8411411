//! Immutable snapshots of the replay state and the bounded snapshot cache.
//!
//! A snapshot captures every node's state and the pending queue after a
//! given number of replay steps. The node-state table is an
//! [`im::OrdMap`], so capturing a snapshot shares structure with the live
//! table instead of deep-copying it.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokenflow_events::EventQueue;
use tokenflow_types::{EventId, NodeId, NodeInternalState};

/// Node-state table keyed by node id.
pub type NodeStates = im::OrdMap<NodeId, NodeInternalState>;

/// When the replay engine captures snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStrategy {
    /// After every step.
    #[default]
    Always,
    /// After every Nth step.
    EveryN,
    /// Only the initial snapshot.
    Never,
}

impl SnapshotStrategy {
    /// Whether a snapshot is due after `cursor` steps.
    pub const fn is_due(self, cursor: usize, interval: usize) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::EveryN => match cursor.checked_rem(interval) {
                Some(rem) => rem == 0,
                None => false,
            },
        }
    }
}

/// A captured view of all node states and pending events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Wall-clock capture time.
    pub timestamp: DateTime<Utc>,
    /// Tick of the last applied event; 0 before any event.
    pub tick: u64,
    /// The last applied event, `None` for the initial snapshot.
    pub event_id: Option<EventId>,
    /// Store position of the last applied event.
    pub event_index: Option<usize>,
    /// Number of replay steps applied.
    pub cursor: usize,
    /// Every node's state.
    pub node_states: NodeStates,
    /// Events still waiting to be processed.
    pub pending: EventQueue,
    /// Free-form annotations (`"kind": "initial"`, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl StateSnapshot {
    /// Same node states and pending events, ignoring capture time.
    pub fn same_state(&self, other: &Self) -> bool {
        self.cursor == other.cursor
            && self.node_states == other.node_states
            && self.pending == other.pending
    }
}

/// Bounded, cursor-ordered snapshot store with oldest-first eviction.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCache {
    entries: VecDeque<StateSnapshot>,
    capacity: usize,
}

impl SnapshotCache {
    /// An empty cache holding at most `capacity` snapshots.
    pub const fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a snapshot, replacing any snapshot at the same cursor and
    /// evicting the oldest entries over capacity.
    pub fn insert(&mut self, snapshot: StateSnapshot) {
        if self.capacity == 0 {
            return;
        }
        self.entries.retain(|s| s.cursor != snapshot.cursor);
        self.entries.push_back(snapshot);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Whether a snapshot exists for `cursor`.
    pub fn contains(&self, cursor: usize) -> bool {
        self.entries.iter().any(|s| s.cursor == cursor)
    }

    /// The snapshot with the greatest cursor not after `cursor`.
    pub fn nearest_at_or_before(&self, cursor: usize) -> Option<&StateSnapshot> {
        self.entries
            .iter()
            .filter(|s| s.cursor <= cursor)
            .max_by_key(|s| s.cursor)
    }

    /// Iterate snapshots in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &StateSnapshot> {
        self.entries.iter()
    }

    /// Drop every snapshot.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
