//! Queue handlers: a [`QueueBuffer`] plus the consumers reading from it.
//!
//! Messages are handed to ready consumers in round-robin order. Rejected or
//! recovered messages go to a redelivery list that is drained before the
//! buffer, so they are delivered again ahead of newer messages.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::queue::{Message, MessageReader, QueueBuffer};
use crate::store::StorageError;
use crate::{Backpressure, ValidationError};

/// Upper bound of messages handed out by a single delivery pass
pub const DELIVERY_BATCH: usize = 1000;

/// Receiving side of a subscription
pub trait Consumer: Send + Sync {
    fn consumer_tag(&self) -> &str;

    /// Identifies the channel the consumer was created on
    fn channel_key(&self) -> u64;

    /// Whether the consumer can take another message right now
    fn is_ready(&self) -> bool;

    /// Messages are considered acknowledged as soon as they are sent
    fn no_ack(&self) -> bool;

    fn is_exclusive(&self) -> bool {
        false
    }

    fn send(&self, queue: &str, message: Message);
}

/// Outcome of one delivery pass
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Sent to `no_ack` consumers; the caller releases them from storage
    pub auto_acked: Vec<Message>,
    /// Dropped on the way out because their expiration passed
    pub expired: Vec<Message>,
}

struct QueueState {
    buffer: QueueBuffer,
    redelivery: VecDeque<Message>,
    /// Redelivered messages handed out but not acknowledged yet
    redelivered_in_flight: HashMap<u64, Message>,
    consumers: Vec<Arc<dyn Consumer>>,
    next_consumer: usize,
}

pub struct QueueHandler {
    name: String,
    durable: bool,
    auto_delete: bool,
    reader: Arc<dyn MessageReader>,
    state: Mutex<QueueState>,
}

impl QueueHandler {
    pub fn new(
        name: impl Into<String>,
        durable: bool,
        auto_delete: bool,
        in_memory_limit: usize,
        indelible_limit: usize,
        reader: Arc<dyn MessageReader>,
    ) -> Self {
        Self {
            name: name.into(),
            durable,
            auto_delete,
            reader: Arc::clone(&reader),
            state: Mutex::new(QueueState {
                buffer: QueueBuffer::new(in_memory_limit, indelible_limit, reader),
                redelivery: VecDeque::new(),
                redelivered_in_flight: HashMap::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Admit a routed message. A transient message on a durable queue is
    /// never written to storage, so it must stay resident in the indelible
    /// region.
    pub fn enqueue(&self, message: Message) -> Result<(), Backpressure> {
        let mut state = self.state.lock();
        if self.durable && !message.is_persistent() {
            if !state.buffer.add_indelible(message) {
                return Err(Backpressure::IndelibleRegionFull);
            }
        } else {
            state.buffer.add(message);
        }
        Ok(())
    }

    /// Admit messages recovered from storage as placeholders
    pub fn enqueue_all_bare(&self, ids: impl IntoIterator<Item = u64>) {
        self.state
            .lock()
            .buffer
            .add_all_bare(ids.into_iter().map(Message::bare));
    }

    /// Put a delivered message back in front of the delivery order.
    pub fn requeue(&self, message: Message) {
        let mut state = self.state.lock();
        let id = message.id();
        let tracked = state.buffer.remove(id).is_some()
            || state.redelivered_in_flight.remove(&id).is_some()
            || state.redelivery.iter().any(|m| m.id() == id);
        if !tracked {
            debug!(queue = %self.name, message_id = id, "Requeue of unknown message ignored");
            return;
        }
        if !state.redelivery.iter().any(|m| m.id() == id) {
            state.redelivery.push_back(message);
        }
    }

    /// Forget a message, normally once it was acknowledged.
    pub fn remove(&self, message_id: u64) -> Option<Message> {
        let mut state = self.state.lock();
        if let Some(message) = state.buffer.remove(message_id) {
            return Some(message);
        }
        if let Some(message) = state.redelivered_in_flight.remove(&message_id) {
            return Some(message);
        }
        let position = state.redelivery.iter().position(|m| m.id() == message_id)?;
        state.redelivery.remove(position)
    }

    pub fn contains(&self, message_id: u64) -> bool {
        let state = self.state.lock();
        state.buffer.contains(message_id)
            || state.redelivered_in_flight.contains_key(&message_id)
            || state.redelivery.iter().any(|m| m.id() == message_id)
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>, exclusive: bool) -> Result<(), ValidationError> {
        let mut state = self.state.lock();
        if exclusive && !state.consumers.is_empty() {
            return Err(ValidationError::access_refused(format!(
                "Exclusive consumer cannot be added to queue {} which already has consumers",
                self.name
            )));
        }
        if state.consumers.iter().any(|c| c.is_exclusive()) {
            return Err(ValidationError::access_refused(format!(
                "Queue {} already has an exclusive consumer",
                self.name
            )));
        }
        if state
            .consumers
            .iter()
            .any(|c| c.channel_key() == consumer.channel_key() && c.consumer_tag() == consumer.consumer_tag())
        {
            return Err(ValidationError::not_allowed(format!(
                "Consumer tag {} is already in use on queue {}",
                consumer.consumer_tag(),
                self.name
            )));
        }
        debug!(queue = %self.name, consumer_tag = consumer.consumer_tag(), "Consumer added");
        state.consumers.push(consumer);
        Ok(())
    }

    /// Returns true when a consumer was removed.
    pub fn remove_consumer(&self, channel_key: u64, consumer_tag: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.consumers.len();
        state
            .consumers
            .retain(|c| !(c.channel_key() == channel_key && c.consumer_tag() == consumer_tag));
        let removed = state.consumers.len() != before;
        if removed && state.next_consumer >= state.consumers.len() {
            state.next_consumer = 0;
        }
        removed
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Every message held, delivered or not
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.buffer.size() + state.redelivery.len() + state.redelivered_in_flight.len()
    }

    /// Messages waiting for delivery
    pub fn message_count(&self) -> usize {
        let state = self.state.lock();
        state.buffer.undelivered_count() + state.redelivery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop every undelivered message. Refused while consumers are attached.
    pub fn purge(&self) -> Result<Vec<Message>, ValidationError> {
        let mut state = self.state.lock();
        if !state.consumers.is_empty() {
            return Err(ValidationError::precondition_failed(format!(
                "Queue {} has consumers. Cannot purge.",
                self.name
            )));
        }
        Ok(Self::drain(&mut state))
    }

    /// Drop every message regardless of consumers, used on queue delete.
    pub fn clear(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        state.consumers.clear();
        Self::drain(&mut state)
    }

    fn drain(state: &mut QueueState) -> Vec<Message> {
        let mut drained: Vec<Message> = state.redelivery.drain(..).collect();
        drained.extend(state.redelivered_in_flight.drain().map(|(_, m)| m));
        drained.extend(state.buffer.clear());
        drained
    }

    /// Take waiting messages whose expiration passed out of the queue.
    /// Messages already handed to a consumer are not touched.
    pub fn take_expired(&self) -> Vec<Message> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        state.redelivery.retain(|message| {
            if message.is_expired() {
                expired.push(message.clone());
                false
            } else {
                true
            }
        });
        expired.extend(state.buffer.take_expired());
        expired
    }

    /// Hand messages to ready consumers until every consumer is busy, the
    /// queue runs dry or a batch worth of messages went out.
    pub fn deliver(&self) -> Result<DeliveryReport, StorageError> {
        let mut report = DeliveryReport::default();
        let mut state = self.state.lock();
        if state.consumers.is_empty() {
            return Ok(report);
        }

        let mut idle = 0;
        while report.delivered < DELIVERY_BATCH && idle < state.consumers.len() {
            let index = state.next_consumer % state.consumers.len();
            state.next_consumer = (index + 1) % state.consumers.len();
            let consumer = Arc::clone(&state.consumers[index]);
            if !consumer.is_ready() {
                idle += 1;
                continue;
            }

            let Some(message) = self.next_message(&mut state, &mut report)? else {
                break;
            };
            idle = 0;

            if consumer.no_ack() {
                Self::forget(&mut state, message.id());
                report.auto_acked.push(message.clone());
            }
            trace!(queue = %self.name, message_id = message.id(), consumer_tag = consumer.consumer_tag(), "Delivering");
            consumer.send(&self.name, message);
            report.delivered += 1;
        }
        Ok(report)
    }

    fn next_message(
        &self,
        state: &mut QueueState,
        report: &mut DeliveryReport,
    ) -> Result<Option<Message>, StorageError> {
        while let Some(mut message) = state.redelivery.pop_front() {
            if !message.has_content() {
                match self.reader.read(&[message.id()])?.remove(&message.id()) {
                    Some(data) => message.set_data(data),
                    None => {
                        warn!(queue = %self.name, message_id = message.id(), "Dropping redelivered message missing from the store");
                        continue;
                    }
                }
            }
            if message.is_expired() {
                report.expired.push(message);
                continue;
            }
            state.redelivered_in_flight.insert(message.id(), message.clone());
            return Ok(Some(message));
        }

        while let Some(message) = state.buffer.get_first_deliverable()? {
            if message.is_expired() {
                state.buffer.remove(message.id());
                report.expired.push(message);
                continue;
            }
            return Ok(Some(message));
        }
        Ok(None)
    }

    fn forget(state: &mut QueueState, message_id: u64) {
        if state.redelivered_in_flight.remove(&message_id).is_none() {
            state.buffer.remove(message_id);
        }
    }
}

impl std::fmt::Debug for QueueHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandler")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("auto_delete", &self.auto_delete)
            .finish()
    }
}
