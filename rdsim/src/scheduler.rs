//! Global event queue: a min-heap of time-stamped events with a monotone
//! insertion counter, so equal-time events pop in insertion order and runs
//! stay reproducible for a fixed seed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::base::{MolId, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// One Brownian step for a molecule.
    Diffuse(MolId),
    /// A molecule's unimolecular timer expires.
    Unimolecular(MolId),
    /// Periodic observation for count buffer i.
    Count(usize),
    /// Periodic state serialization.
    Checkpoint,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub time: Time,
    pub seq: u64,
    pub kind: EventKind,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "QueueSnapshot", into = "QueueSnapshot")]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    next_seq: u64,
}

/// Serialized form: the heap flattened to a vector.  Pop order depends only
/// on the (time, seq) total order, so rebuilding the heap from any
/// permutation restores identical behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueSnapshot {
    events: Vec<QueuedEvent>,
    next_seq: u64,
}

impl From<EventQueue> for QueueSnapshot {
    fn from(q: EventQueue) -> Self {
        let mut events: Vec<QueuedEvent> = q.heap.into_iter().map(|Reverse(e)| e).collect();
        events.sort_unstable();
        QueueSnapshot {
            events,
            next_seq: q.next_seq,
        }
    }
}

impl From<QueueSnapshot> for EventQueue {
    fn from(s: QueueSnapshot) -> Self {
        EventQueue {
            heap: s.events.into_iter().map(Reverse).collect(),
            next_seq: s.next_seq,
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule(&mut self, time: Time, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(QueuedEvent { time, seq, kind }));
    }

    pub fn pop_next(&mut self) -> Option<QueuedEvent> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    pub fn peek_time(&self) -> Option<Time> {
        self.heap.peek().map(|Reverse(e)| e.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Does any queued event still reference this molecule?  Consulted by
    /// arena compaction before recycling a slot.
    pub fn references_mol(&self, id: MolId) -> bool {
        self.heap.iter().any(|Reverse(e)| {
            matches!(e.kind, EventKind::Diffuse(m) | EventKind::Unimolecular(m) if m == id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_time_order_with_insertion_tiebreak() {
        let mut q = EventQueue::new();
        q.schedule(3.0, EventKind::Diffuse(0));
        q.schedule(1.0, EventKind::Diffuse(1));
        q.schedule(2.0, EventKind::Diffuse(2));
        q.schedule(1.0, EventKind::Diffuse(3));

        let order: Vec<(Time, MolId)> = std::iter::from_fn(|| q.pop_next())
            .map(|e| match e.kind {
                EventKind::Diffuse(m) => (e.time, m),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![(1.0, 1), (1.0, 3), (2.0, 2), (3.0, 0)]);
    }

    #[test]
    fn snapshot_round_trip_preserves_pop_order() {
        let mut q = EventQueue::new();
        for (t, m) in [(5.0, 0), (0.5, 1), (2.5, 2), (0.5, 3)] {
            q.schedule(t, EventKind::Unimolecular(m));
        }
        let snapshot: QueueSnapshot = q.clone().into();
        let mut restored: EventQueue = snapshot.into();
        while let (Some(a), Some(b)) = (q.pop_next(), restored.pop_next()) {
            assert_eq!(a, b);
        }
        assert!(q.is_empty() && restored.is_empty());
    }
}
