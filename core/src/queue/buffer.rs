//! Bounded in-memory view of a queue.
//!
//! Every message admitted to a queue is tracked here in admission order. At
//! most `in_memory_limit` of them keep their data resident; older ones are
//! reduced to bare placeholders and read back from the message store when
//! they reach the front of the delivery order. Indelible messages live in a
//! separately bounded region and are never evicted.
//!
//! A delivered message stays tracked (and counted by [`QueueBuffer::size`])
//! until it is removed, normally on acknowledgement.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{trace, warn};

use super::message::{Message, MessageData};
use crate::store::StorageError;

/// Loads message data for bare placeholders.
pub trait MessageReader: Send + Sync {
    /// Read the data of the given messages. Ids missing from the result are
    /// no longer stored.
    fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Bare,
    Full,
    Indelible,
}

#[derive(Debug)]
struct Entry {
    message: Message,
    state: EntryState,
}

pub struct QueueBuffer {
    in_memory_limit: usize,
    indelible_limit: usize,
    reader: Arc<dyn MessageReader>,
    /// admission sequence -> entry
    entries: BTreeMap<u64, Entry>,
    /// message id -> admission sequence
    index: HashMap<u64, u64>,
    next_seq: u64,
    /// Sequence of the first entry not yet handed out for delivery
    cursor: u64,
    resident: usize,
    indelible: usize,
    in_flight: usize,
}

impl QueueBuffer {
    pub fn new(in_memory_limit: usize, indelible_limit: usize, reader: Arc<dyn MessageReader>) -> Self {
        Self {
            in_memory_limit,
            indelible_limit,
            reader,
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            cursor: 0,
            resident: 0,
            indelible: 0,
            in_flight: 0,
        }
    }

    /// Admit a message carrying its data, evicting the oldest resident
    /// message first when the in-memory limit is reached.
    pub fn add(&mut self, mut message: Message) {
        if self.resident >= self.in_memory_limit {
            self.evict_oldest(None);
        }
        let state = if message.has_content() && self.resident < self.in_memory_limit {
            self.resident += 1;
            EntryState::Full
        } else {
            message.clear_data();
            EntryState::Bare
        };
        self.link_last(message, state);
    }

    /// Admit a placeholder; its data is loaded on demand.
    pub fn add_bare(&mut self, mut message: Message) {
        message.clear_data();
        self.link_last(message, EntryState::Bare);
    }

    pub fn add_all_bare(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.add_bare(message);
        }
    }

    /// Admit into the indelible region. Returns false once the region is
    /// full; the caller has to apply backpressure.
    pub fn add_indelible(&mut self, message: Message) -> bool {
        if self.indelible >= self.indelible_limit || !message.has_content() {
            return false;
        }
        self.indelible += 1;
        self.link_last(message, EntryState::Indelible);
        true
    }

    fn link_last(&mut self, message: Message, state: EntryState) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(previous) = self.index.insert(message.id(), seq) {
            // same id admitted twice; keep the newest position only
            if let Some(old) = self.entries.remove(&previous) {
                self.forget(previous, old.state);
            }
        }
        self.entries.insert(seq, Entry { message, state });
    }

    /// Drop the data of the oldest resident entry other than `keep`.
    fn evict_oldest(&mut self, keep: Option<u64>) -> bool {
        let victim = self
            .entries
            .iter_mut()
            .find(|(seq, entry)| entry.state == EntryState::Full && Some(**seq) != keep);
        match victim {
            Some((seq, entry)) => {
                trace!(message_id = entry.message.id(), seq = *seq, "Evicting message data");
                entry.message.clear_data();
                entry.state = EntryState::Bare;
                self.resident -= 1;
                true
            }
            None => false,
        }
    }

    /// Next message in admission order that has not been handed out yet,
    /// with its data populated. Bare entries are filled through the
    /// [`MessageReader`]; entries the store no longer knows are dropped.
    pub fn get_first_deliverable(&mut self) -> Result<Option<Message>, StorageError> {
        loop {
            let Some((&seq, entry)) = self.entries.range(self.cursor..).next() else {
                return Ok(None);
            };

            if entry.state == EntryState::Bare {
                self.fill_from(seq)?;
                let filled = self
                    .entries
                    .get(&seq)
                    .map(|e| e.state != EntryState::Bare)
                    .unwrap_or(false);
                if !filled {
                    if let Some(entry) = self.entries.remove(&seq) {
                        warn!(
                            message_id = entry.message.id(),
                            "Dropping message missing from the store"
                        );
                        self.index.remove(&entry.message.id());
                    }
                    continue;
                }
            }

            self.cursor = seq + 1;
            self.in_flight += 1;
            return Ok(self.entries.get(&seq).map(|e| e.message.clone()));
        }
    }

    /// Batch-read bare entries starting at `head`.
    fn fill_from(&mut self, head: u64) -> Result<(), StorageError> {
        let budget = self.in_memory_limit.saturating_sub(self.resident).max(1);
        let ids: Vec<u64> = self
            .entries
            .range(head..)
            .filter(|(_, e)| e.state == EntryState::Bare)
            .take(budget)
            .map(|(_, e)| e.message.id())
            .collect();

        let mut loaded = self.reader.read(&ids)?;
        for id in ids {
            let Some(data) = loaded.remove(&id) else {
                continue;
            };
            if let Some(entry) = self.index.get(&id).and_then(|seq| self.entries.get_mut(seq)) {
                entry.message.set_data(data);
                entry.state = EntryState::Full;
                self.resident += 1;
            }
        }

        while self.resident > self.in_memory_limit {
            if !self.evict_oldest(Some(head)) {
                break;
            }
        }
        Ok(())
    }

    /// Remove and forget a message entirely.
    pub fn remove(&mut self, message_id: u64) -> Option<Message> {
        let seq = self.index.remove(&message_id)?;
        let entry = self.entries.remove(&seq)?;
        self.forget(seq, entry.state);
        Some(entry.message)
    }

    fn forget(&mut self, seq: u64, state: EntryState) {
        match state {
            EntryState::Full => self.resident -= 1,
            EntryState::Indelible => self.indelible -= 1,
            EntryState::Bare => {}
        }
        if seq < self.cursor {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
    }

    /// Remove undelivered messages whose expiration passed. Bare entries are
    /// left alone since their properties are not loaded.
    pub fn take_expired(&mut self) -> Vec<Message> {
        let expired: Vec<(u64, u64)> = self
            .entries
            .range(self.cursor..)
            .filter(|(_, e)| e.state != EntryState::Bare && e.message.is_expired())
            .map(|(&seq, e)| (seq, e.message.id()))
            .collect();
        expired
            .into_iter()
            .filter_map(|(seq, id)| {
                self.index.remove(&id);
                let entry = self.entries.remove(&seq)?;
                self.forget(seq, entry.state);
                Some(entry.message)
            })
            .collect()
    }

    /// Remove every message, returning them in admission order.
    pub fn clear(&mut self) -> Vec<Message> {
        let drained: Vec<Message> = std::mem::take(&mut self.entries)
            .into_values()
            .map(|e| e.message)
            .collect();
        self.index.clear();
        self.cursor = self.next_seq;
        self.resident = 0;
        self.indelible = 0;
        self.in_flight = 0;
        drained
    }

    pub fn contains(&self, message_id: u64) -> bool {
        self.index.contains_key(&message_id)
    }

    /// Tracked messages: resident, bare placeholders and indelible
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.resident
    }

    pub fn indelible_count(&self) -> usize {
        self.indelible
    }

    /// Handed out for delivery but not removed yet
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    pub fn undelivered_count(&self) -> usize {
        self.entries.range(self.cursor..).count()
    }

    pub fn in_memory_limit(&self) -> usize {
        self.in_memory_limit
    }

    pub fn indelible_limit(&self) -> usize {
        self.indelible_limit
    }
}

impl std::fmt::Debug for QueueBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBuffer")
            .field("size", &self.entries.len())
            .field("resident", &self.resident)
            .field("indelible", &self.indelible)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}
