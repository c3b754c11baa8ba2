//! Cancels out storage operations that have no net effect.
//!
//! Runs on the first pipeline stage over a sliding window of recent events:
//!
//! - `INSERT` then `DELETE` of the same message: both become no-ops
//! - `INSERT` then `DETACH`: the queue is dropped from the insert and the
//!   detach becomes a no-op; an insert left without queues is cancelled too
//! - `DETACH` then `DELETE`: the detach becomes a no-op
//!
//! An operation only cancels against a slot that still holds the sequence it
//! was recorded under and that the persister has not acquired yet.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use super::ring::RingBuffer;
use super::StoreOp;

pub struct EventMatcher {
    window: usize,
    inserts: HashMap<u64, i64>,
    detaches: HashMap<u64, Vec<i64>>,
    /// Message id of every event in the window, oldest first
    events: VecDeque<Option<u64>>,
}

enum Event {
    Insert(u64),
    Detach(u64, String),
    Delete(u64),
    NoOp,
}

impl EventMatcher {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inserts: HashMap::new(),
            detaches: HashMap::new(),
            events: VecDeque::with_capacity(window),
        }
    }

    /// Process the event at `sequence` and mark its slot processed.
    /// Returns the number of operations turned into no-ops.
    pub fn on_event(&mut self, ring: &RingBuffer, sequence: i64) -> u64 {
        let slot = ring.get(sequence);
        let event = slot.with_op(|op| match op {
            Some(StoreOp::Insert(message)) => Event::Insert(message.id),
            Some(StoreOp::Detach { id, queue }) => Event::Detach(*id, queue.clone()),
            Some(StoreOp::Delete { id }) => Event::Delete(*id),
            None => Event::NoOp,
        });

        let mut cancelled = 0;
        let event_id = match event {
            Event::Insert(id) => {
                self.inserts.insert(id, sequence);
                Some(id)
            }
            Event::Delete(id) => {
                if self.cancel_insert(ring, id) {
                    slot.cancel();
                    cancelled += 2;
                    debug!(message_id = id, sequence, "Insert and delete cancelled out");
                }
                cancelled += self.cancel_detaches(ring, id);
                Some(id)
            }
            Event::Detach(id, queue) => {
                match self.shrink_insert(ring, id, &queue) {
                    Some(insert_cancelled) => {
                        slot.cancel();
                        cancelled += 1 + u64::from(insert_cancelled);
                    }
                    None => self.detaches.entry(id).or_default().push(sequence),
                }
                Some(id)
            }
            Event::NoOp => None,
        };

        self.events.push_back(event_id);
        self.evict_oldest();
        slot.complete_processing();
        cancelled
    }

    fn cancel_insert(&mut self, ring: &RingBuffer, id: u64) -> bool {
        let Some(sequence) = self.inserts.remove(&id) else {
            return false;
        };
        let Some(insert) = ring.get_live(sequence) else {
            return false;
        };
        if !insert.acquire_to_process() {
            return false;
        }
        insert.cancel();
        insert.complete_processing();
        true
    }

    fn cancel_detaches(&mut self, ring: &RingBuffer, id: u64) -> u64 {
        let Some(sequences) = self.detaches.remove(&id) else {
            return 0;
        };
        let mut cancelled = 0;
        for sequence in sequences {
            if let Some(detach) = ring.get_live(sequence) {
                if detach.acquire_to_process() {
                    detach.cancel();
                    detach.complete_processing();
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    /// Remove `queue` from a live insert of `id`. Returns whether the insert
    /// itself was cancelled, or `None` when no live insert could be changed.
    fn shrink_insert(&mut self, ring: &RingBuffer, id: u64, queue: &str) -> Option<bool> {
        let sequence = *self.inserts.get(&id)?;
        let insert = ring.get_live(sequence)?;
        if !insert.acquire_to_process() {
            return None;
        }

        let emptied = insert.with_op(|op| match op {
            Some(StoreOp::Insert(message)) => {
                message.queues.retain(|q| q != queue);
                message.queues.is_empty()
            }
            _ => false,
        });
        if emptied {
            insert.cancel();
            self.inserts.remove(&id);
        }
        insert.complete_processing();
        Some(emptied)
    }

    fn evict_oldest(&mut self) {
        if self.events.len() < self.window {
            return;
        }
        let Some(Some(id)) = self.events.pop_front() else {
            return;
        };
        if self.inserts.remove(&id).is_some() {
            return;
        }
        if let Some(list) = self.detaches.get_mut(&id) {
            if !list.is_empty() {
                list.remove(0);
            }
            if list.is_empty() {
                self.detaches.remove(&id);
            }
        }
    }
}
