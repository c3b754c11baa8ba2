//! # AMQP Channel
//!
//! Per-channel protocol state: publish aggregation (method, header, body
//! frames), consumers, unacknowledged deliveries and the transaction mode.
//!
//! A channel is driven by its connection task. Deliveries arrive from queue
//! handlers on other tasks through [`ChannelConsumer`], which only touches
//! the [`ChannelShared`] half; the shared half never calls back into the
//! broker.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::core::BrokerCore;
use super::queue::Consumer;
use crate::flow::{ChannelFlowManager, FrameSink};
use crate::protocol::codec::body_frames;
use crate::protocol::method::{CLASS_BASIC, XA_OK, XA_RBTIMEOUT};
use crate::protocol::{ContentHeader, Frame, Method};
use crate::queue::{Message, MessageData, Metadata};
use crate::transaction::{
    dtx_on_local_channel, DistributedTransaction, LocalTransaction, TransactionError,
    TransactionResult,
};
use crate::{BrokerError, ValidationError};

/// Frame overhead around a body payload: header plus frame-end
const FRAME_OVERHEAD: usize = 8;

#[derive(Debug, Clone)]
struct Unacked {
    queue: String,
    message: Message,
}

/// Channel state shared with the consumers of the channel.
pub struct ChannelShared {
    channel_id: u16,
    key: u64,
    sink: Arc<dyn FrameSink>,
    flow: ChannelFlowManager,
    /// `channel.flow` as requested by the client
    client_flow: AtomicBool,
    closed: AtomicBool,
    /// Zero means unlimited
    prefetch_count: AtomicU16,
    delivery_tags: AtomicU64,
    unacked: Mutex<BTreeMap<u64, Unacked>>,
    max_body_frame: usize,
}

impl ChannelShared {
    fn has_room(&self) -> bool {
        let prefetch = self.prefetch_count.load(Ordering::Acquire) as usize;
        prefetch == 0 || self.unacked.lock().len() < prefetch
    }

    fn can_deliver(&self, no_ack: bool) -> bool {
        !self.closed.load(Ordering::Acquire)
            && self.client_flow.load(Ordering::Acquire)
            && (no_ack || self.has_room())
    }

    fn deliver(&self, consumer_tag: &str, queue: &str, message: Message, no_ack: bool) {
        let Some(data) = message.data().cloned() else {
            warn!(channel = self.channel_id, message_id = message.id(), "Cannot deliver message without data");
            return;
        };
        let delivery_tag = self.delivery_tags.fetch_add(1, Ordering::AcqRel) + 1;
        let redelivered = message.is_redelivered();
        if !no_ack {
            self.unacked.lock().insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }

        let mut frames = Vec::with_capacity(3);
        frames.push(Frame::method(
            self.channel_id,
            Method::BasicDeliver {
                consumer_tag: consumer_tag.to_string(),
                delivery_tag,
                redelivered,
                exchange: data.metadata.exchange.clone(),
                routing_key: data.metadata.routing_key.clone(),
            },
        ));
        frames.push(Frame::Header {
            channel: self.channel_id,
            header: ContentHeader {
                class_id: CLASS_BASIC,
                body_size: data.content.len() as u64,
                properties: data.metadata.properties.clone(),
            },
        });
        frames.extend(body_frames(self.channel_id, &data.content, self.max_body_frame));
        trace!(channel = self.channel_id, delivery_tag, consumer_tag, "basic.deliver");
        self.flow.write_or_hold(self.sink.as_ref(), frames);
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    pub fn messages_in_flight(&self) -> usize {
        self.flow.messages_in_flight()
    }
}

/// Subscription of a channel to a queue
pub struct ChannelConsumer {
    tag: String,
    no_ack: bool,
    exclusive: bool,
    channel: Arc<ChannelShared>,
}

impl Consumer for ChannelConsumer {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    fn channel_key(&self) -> u64 {
        self.channel.key
    }

    fn is_ready(&self) -> bool {
        self.channel.can_deliver(self.no_ack)
    }

    fn no_ack(&self) -> bool {
        self.no_ack
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    fn send(&self, queue: &str, message: Message) {
        self.channel.deliver(&self.tag, queue, message, self.no_ack);
    }
}

#[derive(Debug)]
enum ChannelTransaction {
    AutoCommit,
    Local(LocalTransaction),
    Distributed(DistributedTransaction),
}

/// A `basic.publish` waiting for its header and body frames
#[derive(Debug)]
struct PendingPublish {
    exchange: String,
    routing_key: String,
    header: Option<ContentHeader>,
    body: BytesMut,
}

pub struct AmqpChannel {
    id: u16,
    broker: Arc<BrokerCore>,
    shared: Arc<ChannelShared>,
    /// consumer tag -> queue
    consumers: HashMap<String, String>,
    transaction: ChannelTransaction,
    pending: Option<PendingPublish>,
    /// Publishes staged in a local transaction, still counted in flight
    staged_publishes: usize,
    consumer_seq: u64,
    queue_seq: u64,
}

impl AmqpChannel {
    pub fn new(id: u16, broker: Arc<BrokerCore>, sink: Arc<dyn FrameSink>, frame_max: u32) -> Self {
        let flow_config = &broker.config().flow;
        let frame_max = if frame_max == 0 {
            broker.config().network.frame_max
        } else {
            frame_max
        };
        let shared = Arc::new(ChannelShared {
            channel_id: id,
            key: broker.next_channel_key(),
            sink,
            flow: ChannelFlowManager::new(id, flow_config.flow_low_limit, flow_config.flow_high_limit),
            client_flow: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            prefetch_count: AtomicU16::new(0),
            delivery_tags: AtomicU64::new(0),
            unacked: Mutex::new(BTreeMap::new()),
            max_body_frame: (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1),
        });
        broker.metrics().broker.channel_opened();
        debug!(channel = id, key = shared.key, "Channel opened");
        Self {
            id,
            broker,
            shared,
            consumers: HashMap::new(),
            transaction: ChannelTransaction::AutoCommit,
            pending: None,
            staged_publishes: 0,
            consumer_seq: 0,
            queue_seq: 0,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn reply(&self, method: Method) {
        self.shared
            .sink
            .write_and_flush(Frame::method(self.id, method));
    }

    fn reply_unless(&self, no_wait: bool, method: Method) {
        if !no_wait {
            self.reply(method);
        }
    }

    pub fn handle_method(&mut self, method: Method) -> Result<(), ValidationError> {
        if self.pending.is_some() {
            let (class_id, method_id) = method.id();
            return Err(ValidationError::command_invalid(format!(
                "Method class={}, method={} received while content was expected",
                class_id, method_id
            )));
        }

        match method {
            Method::ChannelFlow { active } => {
                self.shared.client_flow.store(active, Ordering::Release);
                debug!(channel = self.id, active, "Client flow changed");
                self.reply(Method::ChannelFlowOk { active });
                if active {
                    self.kick_consumers()?;
                }
            }
            Method::ChannelFlowOk { active } => {
                trace!(channel = self.id, active, "channel.flow-ok");
            }

            Method::ExchangeDeclare {
                exchange,
                exchange_type,
                passive,
                durable,
                no_wait,
                ..
            } => {
                self.broker
                    .declare_exchange(&exchange, &exchange_type, passive, durable)?;
                self.reply_unless(no_wait, Method::ExchangeDeclareOk);
            }
            Method::ExchangeDelete {
                exchange,
                if_unused,
                no_wait,
            } => {
                self.broker.delete_exchange(&exchange, if_unused)?;
                self.reply_unless(no_wait, Method::ExchangeDeleteOk);
            }

            Method::QueueDeclare {
                queue,
                passive,
                durable,
                auto_delete,
                no_wait,
                ..
            } => {
                let name = if queue.is_empty() {
                    self.queue_seq += 1;
                    format!("amq.gen-{}-{}", self.shared.key, self.queue_seq)
                } else {
                    queue
                };
                let handler = self
                    .broker
                    .create_queue(&name, passive, durable, auto_delete)
                    .map_err(into_validation)?;
                self.reply_unless(
                    no_wait,
                    Method::QueueDeclareOk {
                        queue: name,
                        message_count: handler.message_count() as u32,
                        consumer_count: handler.consumer_count() as u32,
                    },
                );
            }
            Method::QueueBind {
                queue,
                exchange,
                routing_key,
                no_wait,
                ..
            } => {
                self.broker.bind(&queue, &exchange, &routing_key)?;
                self.reply_unless(no_wait, Method::QueueBindOk);
            }
            Method::QueueUnbind {
                queue,
                exchange,
                routing_key,
                ..
            } => {
                self.broker.unbind(&queue, &exchange, &routing_key)?;
                self.reply(Method::QueueUnbindOk);
            }
            Method::QueuePurge { queue, no_wait } => {
                let message_count = self.broker.purge_queue(&queue).map_err(into_validation)?;
                self.reply_unless(no_wait, Method::QueuePurgeOk { message_count });
            }
            Method::QueueDelete {
                queue,
                if_unused,
                if_empty,
                no_wait,
            } => {
                let message_count = self
                    .broker
                    .delete_queue(&queue, if_unused, if_empty)
                    .map_err(into_validation)?;
                self.consumers.retain(|_, q| *q != queue);
                self.reply_unless(no_wait, Method::QueueDeleteOk { message_count });
            }

            Method::BasicQos { prefetch_count, .. } => {
                self.shared
                    .prefetch_count
                    .store(prefetch_count, Ordering::Release);
                self.reply(Method::BasicQosOk);
                self.kick_consumers()?;
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_ack,
                exclusive,
                no_wait,
                ..
            } => self.consume(queue, consumer_tag, no_ack, exclusive, no_wait)?,
            Method::BasicCancel {
                consumer_tag,
                no_wait,
            } => {
                if let Some(queue) = self.consumers.remove(&consumer_tag) {
                    self.broker
                        .remove_consumer(&queue, self.shared.key, &consumer_tag)
                        .map_err(into_validation)?;
                    debug!(channel = self.id, consumer_tag = %consumer_tag, "Consumer cancelled");
                }
                self.reply_unless(no_wait, Method::BasicCancelOk { consumer_tag });
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                ..
            } => {
                self.shared
                    .flow
                    .notify_message_addition(self.shared.sink.as_ref());
                self.pending = Some(PendingPublish {
                    exchange,
                    routing_key,
                    header: None,
                    body: BytesMut::new(),
                });
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => self.ack(delivery_tag, multiple)?,
            Method::BasicReject {
                delivery_tag,
                requeue,
            } => self.reject(delivery_tag, requeue)?,
            Method::BasicRecover { requeue } => {
                self.recover(requeue)?;
                self.reply(Method::BasicRecoverOk);
            }

            Method::TxSelect => {
                match &self.transaction {
                    ChannelTransaction::Distributed(_) => {
                        return Err(ValidationError::command_invalid(
                            "tx.select called on distributed-transactional channel",
                        ));
                    }
                    ChannelTransaction::Local(_) => {}
                    ChannelTransaction::AutoCommit => {
                        self.transaction = ChannelTransaction::Local(LocalTransaction::new(
                            Arc::clone(self.broker.registry()),
                            self.shared.key,
                        ));
                    }
                }
                self.reply(Method::TxSelectOk);
            }
            Method::TxCommit => {
                let broker = Arc::clone(&self.broker);
                let result = match &mut self.transaction {
                    ChannelTransaction::Local(tx) => tx.commit(broker.as_ref()),
                    ChannelTransaction::Distributed(dtx) => dtx.tx_commit(),
                    ChannelTransaction::AutoCommit => return Err(not_transactional("tx.commit")),
                };
                self.release_staged();
                result.map_err(transaction_validation)?;
                self.reply(Method::TxCommitOk);
            }
            Method::TxRollback => {
                let broker = Arc::clone(&self.broker);
                let result = match &mut self.transaction {
                    ChannelTransaction::Local(tx) => tx.rollback(broker.as_ref()),
                    ChannelTransaction::Distributed(dtx) => dtx.tx_rollback(),
                    ChannelTransaction::AutoCommit => return Err(not_transactional("tx.rollback")),
                };
                self.release_staged();
                result.map_err(transaction_validation)?;
                self.reply(Method::TxRollbackOk);
            }

            Method::DtxSelect => {
                match &self.transaction {
                    ChannelTransaction::Local(_) => {
                        return Err(transaction_validation(dtx_on_local_channel("dtx.select")));
                    }
                    ChannelTransaction::Distributed(_) => {}
                    ChannelTransaction::AutoCommit => {
                        self.transaction =
                            ChannelTransaction::Distributed(DistributedTransaction::new(
                                Arc::clone(self.broker.registry()),
                                self.shared.key,
                            ));
                    }
                }
                self.reply(Method::DtxSelectOk);
            }
            Method::DtxStart { xid, join, resume } => {
                let result = self.dtx("dtx.start")?.start(&xid, join, resume);
                let xa_result = xa_result(result)?;
                self.reply(Method::DtxStartOk { xa_result });
            }
            Method::DtxEnd { xid, fail, suspend } => {
                let result = self.dtx("dtx.end")?.end(&xid, fail, suspend);
                let xa_result = xa_result(result)?;
                self.reply(Method::DtxEndOk { xa_result });
            }
            Method::DtxPrepare { xid } => {
                let broker = Arc::clone(&self.broker);
                let result = self.dtx("dtx.prepare")?.prepare(&xid, broker.as_ref());
                let xa_result = xa_result(result)?;
                self.reply(Method::DtxPrepareOk { xa_result });
            }
            Method::DtxCommit { xid, one_phase } => {
                let broker = Arc::clone(&self.broker);
                let result = self
                    .dtx("dtx.commit")?
                    .commit(&xid, one_phase, broker.as_ref());
                let xa_result = xa_result(result)?;
                self.reply(Method::DtxCommitOk { xa_result });
            }
            Method::DtxRollback { xid } => {
                let broker = Arc::clone(&self.broker);
                let result = self.dtx("dtx.rollback")?.rollback(&xid, broker.as_ref());
                let xa_result = xa_result(result)?;
                self.reply(Method::DtxRollbackOk { xa_result });
            }
            Method::DtxForget { xid } => {
                self.dtx("dtx.forget")?
                    .forget(&xid)
                    .map_err(transaction_validation)?;
                self.reply(Method::DtxForgetOk);
            }
            Method::DtxSetTimeout { xid, timeout } => {
                self.dtx("dtx.set-timeout")?
                    .set_timeout(&xid, Duration::from_secs(timeout))
                    .map_err(transaction_validation)?;
                self.reply(Method::DtxSetTimeoutOk);
            }
            Method::DtxRecover => {
                let xids = self.dtx("dtx.recover")?.recover();
                self.reply(Method::DtxRecoverOk { xids });
            }

            other => {
                let (class_id, method_id) = other.id();
                return Err(ValidationError::command_invalid(format!(
                    "Unexpected method on channel: class={}, method={}",
                    class_id, method_id
                )));
            }
        }
        Ok(())
    }

    pub fn handle_header(&mut self, header: ContentHeader) -> Result<(), ValidationError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ValidationError::command_invalid(
                "Content header received without basic.publish",
            ));
        };
        if pending.header.is_some() {
            return Err(ValidationError::command_invalid(
                "Duplicate content header received",
            ));
        }
        let empty = header.body_size == 0;
        pending.header = Some(header);
        if empty {
            self.complete_publish()?;
        }
        Ok(())
    }

    pub fn handle_body(&mut self, payload: Bytes) -> Result<(), ValidationError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ValidationError::command_invalid(
                "Content body received without basic.publish",
            ));
        };
        let Some(expected) = pending.header.as_ref().map(|h| h.body_size) else {
            return Err(ValidationError::command_invalid(
                "Content body received before the content header",
            ));
        };
        pending.body.extend_from_slice(&payload);
        let received = pending.body.len() as u64;
        if received > expected {
            return Err(ValidationError::command_invalid(format!(
                "Content body of {} bytes exceeds declared size {}",
                received, expected
            )));
        }
        if received == expected {
            self.complete_publish()?;
        }
        Ok(())
    }

    fn complete_publish(&mut self) -> Result<(), ValidationError> {
        let Some(PendingPublish {
            exchange,
            routing_key,
            header: Some(header),
            body,
        }) = self.pending.take()
        else {
            return Ok(());
        };

        let metadata =
            Metadata::new(exchange, routing_key, header.body_size).with_properties(header.properties);
        let data = Arc::new(MessageData::new(metadata, body.freeze()));
        let message_id = self.broker.next_message_id();

        let result = self.route(message_id, data);
        if !matches!(self.transaction, ChannelTransaction::Local(_)) || result.is_err() {
            self.shared
                .flow
                .notify_message_removal(self.shared.sink.as_ref());
        }
        result
    }

    fn route(&mut self, message_id: u64, data: Arc<MessageData>) -> Result<(), ValidationError> {
        match &mut self.transaction {
            ChannelTransaction::AutoCommit => {
                self.broker
                    .publish(message_id, data)
                    .map_err(into_validation)?;
            }
            ChannelTransaction::Local(tx) => {
                let enqueue = self.broker.plan_enqueue(message_id, data)?;
                tx.enqueue(enqueue);
                self.staged_publishes += 1;
            }
            ChannelTransaction::Distributed(dtx) => {
                let enqueue = self.broker.plan_enqueue(message_id, data)?;
                if let Some(enqueue) = dtx.enqueue(enqueue) {
                    self.broker
                        .publish_planned(enqueue)
                        .map_err(into_validation)?;
                }
            }
        }
        Ok(())
    }

    /// Staged publishes stop counting as in flight once the local
    /// transaction completes.
    fn release_staged(&mut self) {
        for _ in 0..std::mem::take(&mut self.staged_publishes) {
            self.shared
                .flow
                .notify_message_removal(self.shared.sink.as_ref());
        }
    }

    fn consume(
        &mut self,
        queue: String,
        consumer_tag: String,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
    ) -> Result<(), ValidationError> {
        let tag = if consumer_tag.is_empty() {
            self.consumer_seq += 1;
            format!("sgen-{}", self.consumer_seq)
        } else {
            consumer_tag
        };
        if self.consumers.contains_key(&tag) {
            return Err(ValidationError::not_allowed(format!(
                "Consumer tag {} is already in use on this channel",
                tag
            )));
        }

        let consumer = Arc::new(ChannelConsumer {
            tag: tag.clone(),
            no_ack,
            exclusive,
            channel: Arc::clone(&self.shared),
        });
        self.broker
            .add_consumer(&queue, consumer, exclusive)
            .map_err(into_validation)?;
        self.consumers.insert(tag.clone(), queue.clone());
        debug!(channel = self.id, consumer_tag = %tag, queue = %queue, no_ack, "Consumer added");

        self.reply_unless(no_wait, Method::BasicConsumeOk { consumer_tag: tag });
        self.broker.deliver(&queue).map_err(storage_validation)
    }

    fn take_unacked(&self, delivery_tag: u64, multiple: bool) -> Vec<Unacked> {
        let mut unacked = self.shared.unacked.lock();
        if multiple {
            let upper = if delivery_tag == 0 { u64::MAX } else { delivery_tag };
            let tags: Vec<u64> = unacked.range(..=upper).map(|(tag, _)| *tag).collect();
            tags.into_iter().filter_map(|tag| unacked.remove(&tag)).collect()
        } else {
            match unacked.remove(&delivery_tag) {
                Some(entry) => vec![entry],
                None => {
                    warn!(channel = self.id, delivery_tag, "Unknown delivery tag");
                    Vec::new()
                }
            }
        }
    }

    fn ack(&mut self, delivery_tag: u64, multiple: bool) -> Result<(), ValidationError> {
        let acked = self.take_unacked(delivery_tag, multiple);
        for Unacked { queue, message } in acked {
            match &mut self.transaction {
                ChannelTransaction::AutoCommit => self
                    .broker
                    .acknowledge(&queue, message.id())
                    .map_err(storage_validation)?,
                ChannelTransaction::Local(tx) => {
                    tx.dequeue(self.broker.plan_dequeue(&queue, message));
                }
                ChannelTransaction::Distributed(dtx) => {
                    if let Some(dequeue) = dtx.dequeue(self.broker.plan_dequeue(&queue, message)) {
                        self.broker
                            .acknowledge(&dequeue.queue, dequeue.message.id())
                            .map_err(storage_validation)?;
                    }
                }
            }
        }
        self.kick_consumers()
    }

    fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), ValidationError> {
        for Unacked { queue, message } in self.take_unacked(delivery_tag, false) {
            self.broker
                .reject(&queue, message, requeue)
                .map_err(into_validation)?;
        }
        self.kick_consumers()
    }

    /// Requeue every unacknowledged delivery of the channel.
    fn recover(&mut self, requeue: bool) -> Result<(), ValidationError> {
        let entries = std::mem::take(&mut *self.shared.unacked.lock());
        debug!(channel = self.id, count = entries.len(), requeue, "basic.recover");
        for (_, Unacked { queue, mut message }) in entries {
            message.set_redeliver();
            self.broker
                .requeue(&queue, message)
                .map_err(storage_validation)?;
        }
        self.kick_consumers()
    }

    fn dtx(&mut self, method: &str) -> Result<&mut DistributedTransaction, ValidationError> {
        match &mut self.transaction {
            ChannelTransaction::Distributed(dtx) => Ok(dtx),
            ChannelTransaction::Local(_) => Err(transaction_validation(dtx_on_local_channel(method))),
            ChannelTransaction::AutoCommit => Err(ValidationError::precondition_failed(format!(
                "{} called on non-transactional channel. Call dtx.select first",
                method
            ))),
        }
    }

    /// Deliver to this channel's consumers after it gained room.
    fn kick_consumers(&self) -> Result<(), ValidationError> {
        let queues: BTreeSet<&str> = self.consumers.values().map(String::as_str).collect();
        for queue in queues {
            self.broker.deliver(queue).map_err(storage_validation)?;
        }
        Ok(())
    }

    /// Tear the channel down: cancel consumers, roll back the local
    /// transaction and requeue unacknowledged deliveries.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (tag, queue) in std::mem::take(&mut self.consumers) {
            if let Err(e) = self.broker.remove_consumer(&queue, self.shared.key, &tag) {
                warn!(channel = self.id, consumer_tag = %tag, error = %e, "Failed to remove consumer");
            }
        }

        let broker = Arc::clone(&self.broker);
        match &mut self.transaction {
            ChannelTransaction::Local(tx) => {
                if let Err(e) = tx.on_close(broker.as_ref()) {
                    warn!(channel = self.id, error = %e, "Failed to roll back local transaction");
                }
            }
            ChannelTransaction::Distributed(dtx) => dtx.on_close(),
            ChannelTransaction::AutoCommit => {}
        }
        self.release_staged();
        if self.pending.take().is_some() {
            self.shared
                .flow
                .notify_message_removal(self.shared.sink.as_ref());
        }

        let unacked = std::mem::take(&mut *self.shared.unacked.lock());
        for (_, Unacked { queue, mut message }) in unacked {
            message.set_redeliver();
            if let Err(e) = self.broker.requeue(&queue, message) {
                error!(channel = self.id, queue = %queue, error = %e, "Failed to requeue message");
            }
        }
        self.broker.metrics().broker.channel_closed();
        debug!(channel = self.id, "Channel closed");
    }
}

impl Drop for AmqpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn xa_result(result: TransactionResult<()>) -> Result<u16, ValidationError> {
    match result {
        Ok(()) => Ok(XA_OK),
        Err(TransactionError::TimedOut(xid)) => {
            debug!(xid = %xid, "Branch timed out");
            Ok(XA_RBTIMEOUT)
        }
        Err(e) => Err(transaction_validation(e)),
    }
}

fn not_transactional(method: &str) -> ValidationError {
    ValidationError::precondition_failed(format!(
        "{} called on non-transactional channel. Call tx.select first",
        method
    ))
}

fn transaction_validation(err: TransactionError) -> ValidationError {
    if !err.is_validation() {
        error!(error = %err, "Transaction failed in storage");
    }
    err.to_validation()
}

fn storage_validation(err: crate::store::StorageError) -> ValidationError {
    into_validation(BrokerError::Storage(err))
}

fn into_validation(err: BrokerError) -> ValidationError {
    err.as_validation().unwrap_or_else(|| {
        error!(error = %err, "Broker error while handling channel method");
        ValidationError::internal_error(err.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::metrics::MetricsRegistry;
    use crate::protocol::BasicProperties;
    use crate::store::InMemoryAdapter;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Frame>>,
    }

    impl RecordingSink {
        fn methods(&self) -> Vec<Method> {
            self.frames
                .lock()
                .iter()
                .filter_map(|f| match f {
                    Frame::Method { method, .. } => Some(method.clone()),
                    _ => None,
                })
                .collect()
        }

        fn clear(&self) {
            self.frames.lock().clear();
        }
    }

    impl FrameSink for RecordingSink {
        fn write(&self, frame: Frame) {
            self.frames.lock().push(frame);
        }

        fn write_and_flush(&self, frame: Frame) {
            self.write(frame);
        }

        fn flush(&self) {}
    }

    fn setup() -> (Arc<BrokerCore>, Arc<RecordingSink>, AmqpChannel) {
        let broker = BrokerCore::with_adapter(
            BrokerConfig::default().with_ring_buffer_size(64),
            Arc::new(InMemoryAdapter::new()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let channel = AmqpChannel::new(1, Arc::clone(&broker), sink.clone(), 4096);
        (broker, sink, channel)
    }

    fn publish(channel: &mut AmqpChannel, routing_key: &str, body: &'static [u8]) {
        channel
            .handle_method(Method::BasicPublish {
                exchange: String::new(),
                routing_key: routing_key.to_string(),
                mandatory: false,
                immediate: false,
            })
            .unwrap();
        channel
            .handle_header(ContentHeader {
                class_id: CLASS_BASIC,
                body_size: body.len() as u64,
                properties: BasicProperties::default(),
            })
            .unwrap();
        if !body.is_empty() {
            channel.handle_body(Bytes::from_static(body)).unwrap();
        }
    }

    fn declare(channel: &mut AmqpChannel, queue: &str) {
        channel
            .handle_method(Method::QueueDeclare {
                queue: queue.to_string(),
                passive: false,
                durable: false,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: Default::default(),
            })
            .unwrap();
    }

    fn consume(channel: &mut AmqpChannel, queue: &str, no_ack: bool) {
        channel
            .handle_method(Method::BasicConsume {
                queue: queue.to_string(),
                consumer_tag: String::new(),
                no_local: false,
                no_ack,
                exclusive: false,
                no_wait: false,
                arguments: Default::default(),
            })
            .unwrap();
    }

    #[test]
    fn test_publish_consume_ack() {
        let (broker, sink, mut channel) = setup();
        declare(&mut channel, "q1");
        consume(&mut channel, "q1", false);
        publish(&mut channel, "q1", b"hello");

        let methods = sink.methods();
        assert!(matches!(&methods[1], Method::BasicConsumeOk { consumer_tag } if consumer_tag == "sgen-1"));
        assert!(matches!(
            &methods[2],
            Method::BasicDeliver { delivery_tag: 1, redelivered: false, .. }
        ));
        assert_eq!(channel.shared().unacked_count(), 1);

        channel
            .handle_method(Method::BasicAck {
                delivery_tag: 1,
                multiple: false,
            })
            .unwrap();
        assert_eq!(channel.shared().unacked_count(), 0);
        assert!(broker.get_queue("q1").unwrap().is_empty());
        assert_eq!(channel.shared().messages_in_flight(), 0);
    }

    #[test]
    fn test_prefetch_limits_deliveries() {
        let (_broker, sink, mut channel) = setup();
        declare(&mut channel, "q1");
        channel
            .handle_method(Method::BasicQos {
                prefetch_size: 0,
                prefetch_count: 1,
                global: false,
            })
            .unwrap();
        consume(&mut channel, "q1", false);
        publish(&mut channel, "q1", b"a");
        publish(&mut channel, "q1", b"b");

        let delivered = |sink: &RecordingSink| {
            sink.methods()
                .iter()
                .filter(|m| matches!(m, Method::BasicDeliver { .. }))
                .count()
        };
        assert_eq!(delivered(&sink), 1);

        channel
            .handle_method(Method::BasicAck {
                delivery_tag: 1,
                multiple: false,
            })
            .unwrap();
        assert_eq!(delivered(&sink), 2);
    }

    #[test]
    fn test_reject_with_requeue_redelivers() {
        let (_broker, sink, mut channel) = setup();
        declare(&mut channel, "q1");
        consume(&mut channel, "q1", false);
        publish(&mut channel, "q1", b"a");
        sink.clear();

        channel
            .handle_method(Method::BasicReject {
                delivery_tag: 1,
                requeue: true,
            })
            .unwrap();
        assert!(matches!(
            &sink.methods()[0],
            Method::BasicDeliver { delivery_tag: 2, redelivered: true, .. }
        ));
    }

    #[test]
    fn test_body_larger_than_header_is_rejected() {
        let (_broker, _sink, mut channel) = setup();
        channel
            .handle_method(Method::BasicPublish {
                exchange: String::new(),
                routing_key: "q".to_string(),
                mandatory: false,
                immediate: false,
            })
            .unwrap();
        channel
            .handle_header(ContentHeader {
                class_id: CLASS_BASIC,
                body_size: 2,
                properties: BasicProperties::default(),
            })
            .unwrap();
        let err = channel
            .handle_body(Bytes::from_static(b"abc"))
            .unwrap_err();
        assert_eq!(err.reply_code, ValidationError::COMMAND_INVALID);
    }

    #[test]
    fn test_tx_commit_and_rollback() {
        let (broker, _sink, mut channel) = setup();
        declare(&mut channel, "q1");
        channel.handle_method(Method::TxSelect).unwrap();

        publish(&mut channel, "q1", b"a");
        assert!(broker.get_queue("q1").unwrap().is_empty());
        assert_eq!(channel.shared().messages_in_flight(), 1);

        channel.handle_method(Method::TxCommit).unwrap();
        assert_eq!(broker.get_queue("q1").unwrap().size(), 1);
        assert_eq!(channel.shared().messages_in_flight(), 0);

        publish(&mut channel, "q1", b"b");
        channel.handle_method(Method::TxRollback).unwrap();
        assert_eq!(broker.get_queue("q1").unwrap().size(), 1);
    }

    #[test]
    fn test_transaction_mode_conflicts() {
        let (_broker, _sink, mut channel) = setup();
        let err = channel.handle_method(Method::TxCommit).unwrap_err();
        assert_eq!(err.reply_code, ValidationError::PRECONDITION_FAILED);

        channel.handle_method(Method::TxSelect).unwrap();
        let err = channel.handle_method(Method::DtxSelect).unwrap_err();
        assert_eq!(err.reply_code, ValidationError::COMMAND_INVALID);
    }

    #[test]
    fn test_close_requeues_unacked() {
        let (broker, _sink, mut channel) = setup();
        declare(&mut channel, "q1");
        consume(&mut channel, "q1", false);
        publish(&mut channel, "q1", b"a");
        assert_eq!(broker.get_queue("q1").unwrap().message_count(), 0);

        channel.close();
        let queue = broker.get_queue("q1").unwrap();
        assert_eq!(queue.consumer_count(), 0);
        assert_eq!(queue.message_count(), 1);
    }
}
