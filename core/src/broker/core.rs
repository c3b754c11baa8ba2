//! # Broker Core
//!
//! Owns the topology (exchanges, queues and bindings), the message store and
//! the transaction registry. Channels call into it for every operation that
//! reaches past their own state.
//!
//! ## Publish path
//!
//! 1. the exchange routes the message to a set of queues
//! 2. the store keeps the data in its pending map and records which queues
//!    hold the message, durable or not
//! 3. `flush` publishes the insert into the persistence pipeline when a
//!    durable queue holds a persistent message
//! 4. every queue admits the message and delivers to its consumers
//!
//! Acknowledgements detach the message from the queue's storage record; the
//! pipeline turns the last detach into a delete and cancels inserts that were
//! never written.
//!
//! ## Locking
//!
//! The topology lock is never held while a queue delivers. Queues call
//! [`Consumer::send`] under their own lock, so consumers must not call back
//! into the broker from `send`.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::exchange::{ExchangeRegistry, DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE};
use super::queue::{Consumer, QueueHandler, DELIVERY_BATCH};
use crate::auth::Authenticator;
use crate::config::BrokerConfig;
use crate::metrics::MetricsRegistry;
use crate::protocol::{FieldTable, FieldValue};
use crate::queue::{Message, MessageData, MessageReader};
use crate::store::{
    InMemoryAdapter, JournalAdapter, MessageStore, QueueTarget, StorageAdapter, StorageError,
    StoreOp, TxDequeue, TxEnqueue,
};
use crate::transaction::{BranchWork, Registry, TransactionalResource, Xid};
use crate::{BrokerError, Result, ValidationError};

/// Queue receiving messages rejected too often
pub const DEAD_LETTER_QUEUE: &str = "amq.dlq";

#[derive(Debug, Default)]
struct Topology {
    exchanges: ExchangeRegistry,
    queues: HashMap<String, Arc<QueueHandler>>,
}

pub struct BrokerCore {
    config: BrokerConfig,
    topology: RwLock<Topology>,
    store: Arc<MessageStore>,
    registry: Arc<Registry>,
    metrics: Arc<MetricsRegistry>,
    authenticator: Authenticator,
    message_ids: AtomicU64,
    channel_keys: AtomicU64,
}

impl BrokerCore {
    /// Open the broker with the storage backend selected by configuration.
    pub fn open(config: BrokerConfig, metrics: Arc<MetricsRegistry>) -> Result<Arc<Self>> {
        let adapter: Arc<dyn StorageAdapter> = match &config.persistence.data_dir {
            Some(dir) => {
                info!(path = %dir.display(), "Using journal storage");
                JournalAdapter::open_shared(dir)?
            }
            None => {
                info!("Using in-memory storage");
                Arc::new(InMemoryAdapter::new())
            }
        };
        Self::with_adapter(config, adapter, metrics)
    }

    pub fn with_adapter(
        config: BrokerConfig,
        adapter: Arc<dyn StorageAdapter>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Arc<Self>> {
        let authenticator =
            Authenticator::from_config(config.auth.auth_mechanism, &config.auth.users, None);
        Self::assemble(config, adapter, metrics, authenticator)
    }

    pub fn assemble(
        config: BrokerConfig,
        adapter: Arc<dyn StorageAdapter>,
        metrics: Arc<MetricsRegistry>,
        authenticator: Authenticator,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(BrokerError::Config)?;

        let store = Arc::new(MessageStore::new(
            adapter,
            config.to_pipeline_config(),
            Arc::clone(&metrics),
        )?);
        let first_id = store.max_message_id()? + 1;

        let registry = Arc::new(Registry::new());
        let prepared = store.recovered_prepared()?;
        if !prepared.is_empty() {
            info!(count = prepared.len(), "Recovered prepared transactions");
        }
        registry.restore_prepared(prepared.into_iter().map(|(xid, _)| xid));

        let core = Arc::new(Self {
            config,
            topology: RwLock::new(Topology::default()),
            store,
            registry,
            metrics,
            authenticator,
            message_ids: AtomicU64::new(first_id),
            channel_keys: AtomicU64::new(1),
        });

        core.create_queue(DEAD_LETTER_QUEUE, false, true, false)?;
        core.bind(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE)?;
        info!(next_message_id = first_id, "Broker core started");
        Ok(core)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn next_message_id(&self) -> u64 {
        self.message_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Unique key for a new channel, used for consumers and local branches
    pub fn next_channel_key(&self) -> u64 {
        self.channel_keys.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<QueueHandler>> {
        self.topology.read().queues.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topology.read().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.topology.read().exchanges.get(name).is_some()
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        exchange_type: &str,
        passive: bool,
        durable: bool,
    ) -> std::result::Result<(), ValidationError> {
        self.topology
            .write()
            .exchanges
            .declare(name, exchange_type, passive, durable)
    }

    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> std::result::Result<(), ValidationError> {
        self.topology.write().exchanges.delete(name, if_unused)
    }

    /// Create a queue, or return the existing one. A durable queue reloads
    /// its stored backlog as bare messages.
    pub fn create_queue(
        &self,
        name: &str,
        passive: bool,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Arc<QueueHandler>> {
        let mut topology = self.topology.write();
        if let Some(queue) = topology.queues.get(name) {
            return Ok(Arc::clone(queue));
        }
        if passive {
            return Err(ValidationError::not_found(format!(
                "Queue [ {} ] doesn't exists. Passive parameter is set, hence not creating the queue.",
                name
            ))
            .into());
        }

        let reader: Arc<dyn MessageReader> = self.store.clone();
        let queue = Arc::new(QueueHandler::new(
            name,
            durable,
            auto_delete,
            self.config.queue.in_memory_limit,
            self.config.queue.indelible_limit,
            reader,
        ));
        if durable {
            let ids = self.store.read_all(name)?;
            for id in &ids {
                self.store.attach(name, *id, true);
            }
            if !ids.is_empty() {
                info!(queue = name, messages = ids.len(), "Restored durable queue backlog");
            }
            queue.enqueue_all_bare(ids);
        }

        topology.queues.insert(name.to_string(), Arc::clone(&queue));
        if let Some(default) = topology.exchanges.get_mut(DEFAULT_EXCHANGE) {
            default.bind(name, name);
        }
        info!(queue = name, durable, auto_delete, "Queue created");
        Ok(queue)
    }

    /// Delete a queue and release every message it holds. Returns the
    /// number of messages dropped.
    pub fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let queue = {
            let mut topology = self.topology.write();
            let queue = topology.queues.get(name).cloned().ok_or_else(|| {
                ValidationError::not_found(format!("Queue [ {} ] Not found", name))
            })?;
            if if_unused && queue.consumer_count() > 0 {
                return Err(ValidationError::precondition_failed(format!(
                    "Cannot delete queue {}. It has {} consumer(s).",
                    name,
                    queue.consumer_count()
                ))
                .into());
            }
            if if_empty && !queue.is_empty() {
                return Err(ValidationError::precondition_failed(format!(
                    "Cannot delete queue {}. It has {} message(s).",
                    name,
                    queue.size()
                ))
                .into());
            }
            topology.queues.remove(name);
            topology.exchanges.remove_queue(name);
            queue
        };

        let drained = queue.clear();
        for message in &drained {
            self.store.detach(name, message.id())?;
        }
        info!(queue = name, messages = drained.len(), "Queue deleted");
        Ok(drained.len() as u32)
    }

    pub fn purge_queue(&self, name: &str) -> Result<u32> {
        let queue = self.require_queue(name)?;
        let purged = queue.purge()?;
        for message in &purged {
            self.store.detach(name, message.id())?;
        }
        debug!(queue = name, messages = purged.len(), "Queue purged");
        Ok(purged.len() as u32)
    }

    fn require_queue(&self, name: &str) -> std::result::Result<Arc<QueueHandler>, ValidationError> {
        self.get_queue(name)
            .ok_or_else(|| ValidationError::not_found(format!("Queue [ {} ] Not found", name)))
    }

    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> std::result::Result<(), ValidationError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(ValidationError::access_refused(
                "Operation not permitted on the default exchange",
            ));
        }
        let mut topology = self.topology.write();
        if !topology.queues.contains_key(queue) {
            return Err(ValidationError::not_found(format!(
                "Queue [ {} ] not found. Cannot bind",
                queue
            )));
        }
        let target = topology.exchanges.get_mut(exchange).ok_or_else(|| {
            ValidationError::not_found(format!("Exchange [ {} ] not found. Cannot bind", exchange))
        })?;
        target.bind(queue, routing_key);
        Ok(())
    }

    pub fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> std::result::Result<(), ValidationError> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(ValidationError::access_refused(
                "Operation not permitted on the default exchange",
            ));
        }
        let mut topology = self.topology.write();
        let target = topology.exchanges.get_mut(exchange).ok_or_else(|| {
            ValidationError::not_found(format!("Exchange [ {} ] not found. Cannot unbind", exchange))
        })?;
        if !target.unbind(queue, routing_key) {
            debug!(queue, exchange, routing_key, "Unbind of unknown binding ignored");
        }
        Ok(())
    }

    /// Route a message without applying it. The result can be staged in a
    /// transaction or published with [`BrokerCore::publish_planned`].
    pub fn plan_enqueue(
        &self,
        message_id: u64,
        data: Arc<MessageData>,
    ) -> std::result::Result<TxEnqueue, ValidationError> {
        let topology = self.topology.read();
        let exchange = topology.exchanges.get(&data.metadata.exchange).ok_or_else(|| {
            ValidationError::not_found(format!(
                "Message publish failed. Unknown exchange: {}",
                data.metadata.exchange
            ))
        })?;
        let persistent = data.metadata.properties.is_persistent();
        let queues = exchange
            .route(&data.metadata.routing_key)
            .into_iter()
            .filter_map(|name| {
                let durable = topology.queues.get(&name)?.is_durable() && persistent;
                Some(QueueTarget { name, durable })
            })
            .collect();
        Ok(TxEnqueue {
            message_id,
            data,
            queues,
        })
    }

    /// Publish a message, returning the number of queues it reached.
    pub fn publish(&self, message_id: u64, data: Arc<MessageData>) -> Result<usize> {
        let enqueue = self.plan_enqueue(message_id, data)?;
        self.publish_planned(enqueue)
    }

    pub fn publish_planned(&self, enqueue: TxEnqueue) -> Result<usize> {
        let TxEnqueue {
            message_id,
            data,
            queues,
        } = enqueue;
        self.metrics
            .throughput
            .record_published(1, data.content.len() as u64);
        if queues.is_empty() {
            debug!(
                message_id,
                exchange = %data.metadata.exchange,
                routing_key = %data.metadata.routing_key,
                "Message routed to no queue"
            );
            return Ok(0);
        }

        self.store.add(message_id, Arc::clone(&data));
        for target in &queues {
            self.store.attach(&target.name, message_id, target.durable);
        }
        if let Err(reason) = self.store.try_flush(message_id)? {
            debug!(message_id, ?reason, "Persistence ring full, publisher waits for a slot");
            self.store.flush(message_id)?;
        }

        let routed = self.admit(message_id, &data, queues.iter().map(|q| q.name.as_str()))?;
        for target in &queues {
            self.deliver(&target.name)?;
        }
        Ok(routed)
    }

    /// Hand an already attached message to its queues. Refused or vanished
    /// queues release their attachment.
    fn admit<'a>(
        &self,
        message_id: u64,
        data: &Arc<MessageData>,
        queues: impl Iterator<Item = &'a str>,
    ) -> std::result::Result<usize, StorageError> {
        let mut routed = 0;
        for name in queues {
            let Some(queue) = self.get_queue(name) else {
                self.store.detach(name, message_id)?;
                continue;
            };
            match queue.enqueue(Message::new(message_id, Arc::clone(data))) {
                Ok(()) => routed += 1,
                Err(reason) => {
                    warn!(queue = name, message_id, ?reason, "Queue refused message");
                    self.store.detach(name, message_id)?;
                }
            }
        }
        Ok(routed)
    }

    /// Run delivery passes on a queue until its consumers are busy or it
    /// is drained.
    pub fn deliver(&self, queue_name: &str) -> std::result::Result<(), StorageError> {
        let Some(queue) = self.get_queue(queue_name) else {
            return Ok(());
        };
        loop {
            let report = queue.deliver()?;
            for _ in 0..report.delivered {
                self.metrics.throughput.record_delivered();
            }
            if !report.auto_acked.is_empty() {
                self.metrics
                    .throughput
                    .record_acknowledged(report.auto_acked.len() as u64);
            }
            for message in report.auto_acked.iter().chain(report.expired.iter()) {
                self.store.detach(queue_name, message.id())?;
            }
            if !report.expired.is_empty() {
                debug!(queue = queue_name, count = report.expired.len(), "Dropped expired messages");
            }
            if report.delivered < DELIVERY_BATCH {
                return Ok(());
            }
        }
    }

    pub fn acknowledge(&self, queue_name: &str, message_id: u64) -> std::result::Result<(), StorageError> {
        if let Some(queue) = self.get_queue(queue_name) {
            queue.remove(message_id);
        }
        self.store.detach(queue_name, message_id)?;
        self.metrics.throughput.record_acknowledged(1);
        Ok(())
    }

    /// Put a delivered message back on its queue for redelivery.
    pub fn requeue(&self, queue_name: &str, message: Message) -> std::result::Result<(), StorageError> {
        match self.get_queue(queue_name) {
            Some(queue) => {
                queue.requeue(message);
                self.deliver(queue_name)
            }
            None => self.store.detach(queue_name, message.id()),
        }
    }

    /// Reject a delivered message. Requeued messages that were redelivered
    /// more than `max_redelivery_count` times go to the dead letter queue.
    pub fn reject(&self, queue_name: &str, mut message: Message, requeue: bool) -> Result<()> {
        self.metrics.throughput.record_rejected();
        if !requeue {
            if let Some(queue) = self.get_queue(queue_name) {
                queue.remove(message.id());
            }
            self.store.detach(queue_name, message.id())?;
            return Ok(());
        }

        let count = message.set_redeliver();
        if count > self.config.queue.max_redelivery_count {
            self.move_to_dlq(queue_name, message)
        } else {
            self.requeue(queue_name, message)?;
            Ok(())
        }
    }

    /// Republish a message through the dead letter exchange and release the
    /// original.
    pub fn move_to_dlq(&self, queue_name: &str, message: Message) -> Result<()> {
        let data = match message.data() {
            Some(data) => Arc::clone(data),
            None => self
                .store
                .read(&[message.id()])?
                .remove(&message.id())
                .ok_or(StorageError::MessageNotFound(message.id()))?,
        };

        let mut metadata = data.metadata.clone();
        let origin = [
            ("x-origin-queue", queue_name.to_string()),
            ("x-origin-exchange", metadata.exchange.clone()),
            ("x-origin-routing-key", metadata.routing_key.clone()),
        ];
        let headers = metadata.properties.headers.get_or_insert_with(FieldTable::new);
        for (key, value) in origin {
            headers.insert(key, FieldValue::LongString(Bytes::from(value)));
        }
        metadata.exchange = DEAD_LETTER_EXCHANGE.to_string();
        metadata.routing_key = DEAD_LETTER_QUEUE.to_string();
        metadata.properties.expiration = None;

        let dead_id = self.next_message_id();
        let dead = Arc::new(MessageData::new(metadata, data.content.clone()));
        self.publish(dead_id, dead)?;

        if let Some(queue) = self.get_queue(queue_name) {
            queue.remove(message.id());
        }
        self.store.detach(queue_name, message.id())?;
        warn!(
            queue = queue_name,
            message_id = message.id(),
            dead_letter_id = dead_id,
            redelivery_count = message.redelivery_count(),
            "Message moved to dead letter queue"
        );
        Ok(())
    }

    /// Register a consumer. Nothing is delivered until the next
    /// [`BrokerCore::deliver`] on the queue, so the caller can confirm the
    /// subscription first.
    pub fn add_consumer(&self, queue_name: &str, consumer: Arc<dyn Consumer>, exclusive: bool) -> Result<()> {
        let queue = self.get_queue(queue_name).ok_or_else(|| {
            ValidationError::not_found(format!(
                "Queue [{}] not found. Create the queue before attempting to consume.",
                queue_name
            ))
        })?;
        queue.add_consumer(consumer, exclusive)?;
        self.metrics.broker.consumer_added();
        Ok(())
    }

    /// Detach a consumer. An auto-delete queue goes away with its last
    /// consumer.
    pub fn remove_consumer(&self, queue_name: &str, channel_key: u64, consumer_tag: &str) -> Result<()> {
        let Some(queue) = self.get_queue(queue_name) else {
            return Ok(());
        };
        if !queue.remove_consumer(channel_key, consumer_tag) {
            return Ok(());
        }
        self.metrics.broker.consumer_removed();
        if queue.is_auto_delete() && queue.consumer_count() == 0 {
            info!(queue = queue_name, "Deleting auto-delete queue without consumers");
            match self.delete_queue(queue_name, false, false) {
                Ok(_) | Err(BrokerError::Validation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Staged acknowledgement of a delivered message
    pub fn plan_dequeue(&self, queue_name: &str, message: Message) -> TxDequeue {
        let durable = self
            .get_queue(queue_name)
            .is_some_and(|q| q.is_durable())
            && message.is_persistent();
        TxDequeue {
            queue: queue_name.to_string(),
            durable,
            message,
        }
    }

    /// Roll back active branches past their timeout every
    /// `dtx_sweep_interval`. The task stops once the broker is dropped.
    pub fn start_transaction_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let core: Weak<Self> = Arc::downgrade(self);
        let period = self.config.dtx_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                let expired = core.registry.expire_timed_out(core.as_ref());
                if !expired.is_empty() {
                    debug!(count = expired.len(), "Timed out distributed transactions");
                }
            }
        })
    }

    /// Move expired messages waiting in any queue but the dead letter queue
    /// itself to the dead letter queue. Returns how many were moved.
    pub fn expire_messages(&self) -> Result<usize> {
        let queues: Vec<Arc<QueueHandler>> = self
            .topology
            .read()
            .queues
            .iter()
            .filter(|(name, _)| name.as_str() != DEAD_LETTER_QUEUE)
            .map(|(_, queue)| Arc::clone(queue))
            .collect();

        let mut moved = 0;
        for queue in queues {
            for message in queue.take_expired() {
                self.move_to_dlq(queue.name(), message)?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Run [`BrokerCore::expire_messages`] every `expiry_sweep_interval`.
    /// The task stops once the broker is dropped.
    pub fn start_expiry_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let core: Weak<Self> = Arc::downgrade(self);
        let period = self.config.expiry_sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                match core.expire_messages() {
                    Ok(0) => {}
                    Ok(moved) => debug!(count = moved, "Moved expired messages to the dead letter queue"),
                    Err(e) => warn!(error = %e, "Expiry sweep failed"),
                }
            }
        })
    }

    pub fn shutdown(&self) {
        info!("Shutting down broker core");
        self.store.shutdown();
    }

    fn deliver_all<'a>(&self, queues: impl IntoIterator<Item = &'a str>) -> std::result::Result<(), StorageError> {
        let unique: BTreeSet<&str> = queues.into_iter().collect();
        for queue in unique {
            self.deliver(queue)?;
        }
        Ok(())
    }
}

impl TransactionalResource for BrokerCore {
    fn prepare(&self, xid: &Xid, work: &BranchWork) -> std::result::Result<(), StorageError> {
        self.store
            .prepare_transaction(xid, &work.enqueues, &work.dequeues)
    }

    fn commit(&self, xid: &Xid, work: &BranchWork, prepared: bool) -> std::result::Result<(), StorageError> {
        self.store
            .commit_transaction(xid, &work.enqueues, &work.dequeues, prepared)?;

        for dequeue in &work.dequeues {
            if let Some(queue) = self.get_queue(&dequeue.queue) {
                queue.remove(dequeue.message.id());
            }
        }
        if !work.dequeues.is_empty() {
            self.metrics
                .throughput
                .record_acknowledged(work.dequeues.len() as u64);
        }

        for enqueue in &work.enqueues {
            self.metrics
                .throughput
                .record_published(1, enqueue.data.content.len() as u64);
            self.admit(
                enqueue.message_id,
                &enqueue.data,
                enqueue.queues.iter().map(|q| q.name.as_str()),
            )?;
        }
        debug!(
            xid = %xid,
            enqueues = work.enqueues.len(),
            dequeues = work.dequeues.len(),
            "Transaction applied"
        );
        self.deliver_all(
            work.enqueues
                .iter()
                .flat_map(|e| e.queues.iter().map(|q| q.name.as_str())),
        )
    }

    fn rollback(&self, xid: &Xid, work: &BranchWork, prepared: bool) -> std::result::Result<(), StorageError> {
        self.store.rollback_transaction(xid, prepared)?;
        for dequeue in &work.dequeues {
            let mut message = dequeue.message.clone();
            message.set_redeliver();
            match self.get_queue(&dequeue.queue) {
                Some(queue) => queue.requeue(message),
                None => self.store.detach(&dequeue.queue, message.id())?,
            }
        }
        debug!(xid = %xid, requeued = work.dequeues.len(), "Transaction rolled back");
        self.deliver_all(work.dequeues.iter().map(|d| d.queue.as_str()))
    }

    fn commit_recovered(&self, xid: &Xid) -> std::result::Result<(), StorageError> {
        let ops = self
            .store
            .recovered_prepared()?
            .into_iter()
            .find(|(recovered, _)| recovered == xid)
            .map(|(_, ops)| ops)
            .unwrap_or_default();
        self.store.commit_recovered(xid, &ops)?;

        let mut touched = Vec::new();
        for op in &ops {
            match op {
                StoreOp::Insert(message) => {
                    for name in &message.queues {
                        if let Some(queue) = self.get_queue(name) {
                            queue.enqueue_all_bare([message.id]);
                            touched.push(name.clone());
                        }
                    }
                }
                StoreOp::Detach { id, queue } => {
                    if let Some(queue) = self.get_queue(queue) {
                        queue.remove(*id);
                    }
                }
                StoreOp::Delete { id } => {
                    for name in self.queue_names() {
                        if let Some(queue) = self.get_queue(&name) {
                            queue.remove(*id);
                        }
                    }
                }
            }
        }
        info!(xid = %xid, operations = ops.len(), "Recovered transaction committed");
        self.deliver_all(touched.iter().map(String::as_str))
    }

    fn rollback_recovered(&self, xid: &Xid) -> std::result::Result<(), StorageError> {
        self.store.rollback_transaction(xid, true).inspect_err(|e| {
            error!(xid = %xid, error = %e, "Failed to roll back recovered transaction");
        })
    }
}

impl std::fmt::Debug for BrokerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = self.topology.read();
        f.debug_struct("BrokerCore")
            .field("queues", &topology.queues.len())
            .field("exchanges", &topology.exchanges.len())
            .field("branches", &self.registry.len())
            .finish()
    }
}
