//! The event queue: the frontier of not-yet-processed events.
//!
//! A binary min-heap over a `Vec`, keyed by `(tick, sequence)`. Nodes may
//! schedule events arbitrarily far ahead (timeouts, delayed emission), so
//! inserts must not re-sort the whole frontier.
//!
//! The `sequence` is a monotonic insertion counter. It breaks ties between
//! events scheduled for the same tick, so two queues fed the same inserts in
//! the same order always dequeue in the same order.

use serde::{Deserialize, Serialize};
use tokenflow_types::{Event, EventId};

/// An event waiting in the queue together with its ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Tick the event is due.
    pub tick: u64,
    /// Insertion sequence, the secondary ordering key.
    pub sequence: u64,
    /// The pending event.
    pub event: Event,
}

impl QueuedEvent {
    /// The `(tick, sequence)` ordering key.
    pub const fn key(&self) -> (u64, u64) {
        (self.tick, self.sequence)
    }
}

/// Min-heap priority queue of pending events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQueue {
    /// Heap-ordered entries: every parent's key is <= its children's.
    heap: Vec<QueuedEvent>,
    /// Sequence number assigned to the next insert.
    next_sequence: u64,
}

impl EventQueue {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            heap: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Return the number of pending events.
    pub const fn len(&self) -> usize {
        self.heap.len()
    }

    /// Return whether no events are pending.
    pub const fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert one event. O(log n).
    pub fn enqueue(&mut self, event: Event) {
        let entry = self.wrap(event);
        self.heap.push(entry);
        self.sift_up(self.heap.len().saturating_sub(1));
    }

    /// Insert many events at once by appending and re-heapifying. O(n + k).
    ///
    /// Sequences are assigned in iteration order, so ties keep that order.
    pub fn enqueue_all(&mut self, events: impl IntoIterator<Item = Event>) {
        let entries: Vec<QueuedEvent> = events.into_iter().map(|e| self.wrap(e)).collect();
        if entries.is_empty() {
            return;
        }
        self.heap.extend(entries);
        let last_internal = self.heap.len() / 2;
        for index in (0..last_internal).rev() {
            self.sift_down(index);
        }
    }

    /// Remove and return the earliest event, or `None` when empty.
    pub fn dequeue(&mut self) -> Option<Event> {
        if self.heap.is_empty() {
            return None;
        }
        // swap_remove moves the last leaf into the root slot.
        let entry = self.heap.swap_remove(0);
        self.sift_down(0);
        Some(entry.event)
    }

    /// Return the earliest event without removing it.
    pub fn peek(&self) -> Option<&Event> {
        self.heap.first().map(|entry| &entry.event)
    }

    /// Return the tick of the earliest event.
    pub fn peek_tick(&self) -> Option<u64> {
        self.heap.first().map(|entry| entry.tick)
    }

    /// Whether an event with this id is pending.
    pub fn contains(&self, id: EventId) -> bool {
        self.heap.iter().any(|entry| entry.event.id == id)
    }

    /// Drop every pending event. The sequence counter keeps counting.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Pending entries in heap order (not sorted).
    pub fn pending(&self) -> &[QueuedEvent] {
        &self.heap
    }

    /// Pending events in dequeue order, without consuming the queue.
    pub fn pending_events(&self) -> Vec<Event> {
        let mut entries: Vec<&QueuedEvent> = self.heap.iter().collect();
        entries.sort_by_key(|entry| entry.key());
        entries.into_iter().map(|entry| entry.event.clone()).collect()
    }

    /// Remove every pending event in dequeue order.
    pub fn drain_ordered(&mut self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.heap.len());
        while let Some(event) = self.dequeue() {
            events.push(event);
        }
        events
    }

    fn wrap(&mut self, event: Event) -> QueuedEvent {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        QueuedEvent {
            tick: event.tick,
            sequence,
            event,
        }
    }

    /// Whether the entry at `a` orders strictly before the entry at `b`.
    fn less(&self, a: usize, b: usize) -> bool {
        match (self.heap.get(a), self.heap.get(b)) {
            (Some(x), Some(y)) => x.key() < y.key(),
            _ => false,
        }
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = index.saturating_sub(1) / 2;
            if !self.less(index, parent) {
                break;
            }
            self.heap.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = index.saturating_mul(2).saturating_add(1);
            let right = left.saturating_add(1);
            let mut smallest = index;
            if self.less(left, smallest) {
                smallest = left;
            }
            if self.less(right, smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.heap.swap(index, smallest);
            index = smallest;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokenflow_types::{EventType, NewEvent, NodeId};

    use super::*;
    use crate::store::EventStore;

    /// Materialize events with the given ticks through a real store.
    fn events(ticks: &[u64]) -> Vec<Event> {
        let mut store = EventStore::default();
        ticks
            .iter()
            .map(|&tick| {
                store
                    .append_event(NewEvent::new(tick, EventType::Timer, NodeId::new("n")))
                    .unwrap()
            })
            .collect()
    }

    fn ticks_of(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.tick).collect()
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let mut queue = EventQueue::new();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn dequeue_order_is_non_decreasing_by_tick() {
        let mut queue = EventQueue::new();
        for event in events(&[50, 10, 30, 10, 99, 0, 42, 7, 7, 63]) {
            queue.enqueue(event);
        }
        let drained = queue.drain_ordered();
        let ticks = ticks_of(&drained);
        assert_eq!(ticks, vec![0, 7, 7, 10, 10, 30, 42, 50, 63, 99]);
    }

    #[test]
    fn bulk_enqueue_matches_individual_inserts() {
        let input = events(&[9, 3, 3, 8, 1, 5, 5, 2, 7]);

        let mut one_by_one = EventQueue::new();
        for event in input.clone() {
            one_by_one.enqueue(event);
        }
        let mut bulk = EventQueue::new();
        bulk.enqueue_all(input);

        let a: Vec<EventId> = one_by_one.drain_ordered().iter().map(|e| e.id).collect();
        let b: Vec<EventId> = bulk.drain_ordered().iter().map(|e| e.id).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn equal_ticks_dequeue_in_insertion_order() {
        let input = events(&[4, 4, 4, 4]);
        let ids: Vec<EventId> = input.iter().map(|e| e.id).collect();
        let mut queue = EventQueue::new();
        for event in input {
            queue.enqueue(event);
        }
        let out: Vec<EventId> = queue.drain_ordered().iter().map(|e| e.id).collect();
        assert_eq!(out, ids);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut queue = EventQueue::new();
        queue.enqueue_all(events(&[5, 2, 8]));
        assert_eq!(queue.peek_tick(), Some(2));
        assert_eq!(queue.peek().map(|e| e.tick), Some(2));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn pending_events_is_sorted_and_non_consuming() {
        let mut queue = EventQueue::new();
        queue.enqueue_all(events(&[5, 2, 8, 1]));
        assert_eq!(ticks_of(&queue.pending_events()), vec![1, 2, 5, 8]);
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn interleaved_enqueue_and_dequeue_stay_ordered() {
        let mut queue = EventQueue::new();
        let mut input = events(&[10, 4, 6, 1, 8, 3]).into_iter();
        let mut out = Vec::new();
        for _ in 0..3 {
            queue.enqueue(input.next().unwrap());
            queue.enqueue(input.next().unwrap());
            out.push(queue.dequeue().unwrap().tick);
        }
        out.extend(ticks_of(&queue.drain_ordered()));
        // 10,4 -> 4 ; +6,1 -> 1 ; +8,3 -> 3 ; then 6,8,10
        assert_eq!(out, vec![4, 1, 3, 6, 8, 10]);
    }

    #[test]
    fn contains_and_clear() {
        let mut queue = EventQueue::new();
        let input = events(&[1, 2]);
        let id = input.first().map(|e| e.id).unwrap();
        queue.enqueue_all(input);
        assert!(queue.contains(id));
        queue.clear();
        assert!(!queue.contains(id));
        assert!(queue.is_empty());
    }
}
