//! # Message Store
//!
//! Durable side of the broker. Producer paths (publish, ack) never touch the
//! storage backend directly: they describe the change as a [`StoreOp`] and
//! publish it into the [`PersistencePipeline`], which cancels out operations
//! with no net effect and writes the rest in batches through a
//! [`StorageAdapter`].
//!
//! Until an insert has been persisted the message data stays in an in-memory
//! pending map, so reads never have to wait for the pipeline.
//!
//! Transactional work is not routed through the ring. It is written
//! synchronously once the pipeline has drained, which keeps the prepare and
//! commit records ordered after every plain operation they depend on.

pub mod adapter;
pub mod journal;
pub mod matcher;
pub mod pipeline;
pub mod ring;
pub mod wait;

pub use adapter::{InMemoryAdapter, StorageAdapter};
pub use journal::JournalAdapter;
pub use pipeline::{CompletionHook, PersistencePipeline, PipelineConfig};
pub use ring::OpType;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, error};

use crate::metrics::MetricsRegistry;
use crate::Backpressure;
use crate::queue::{Message, MessageData, MessageReader};
use crate::transaction::Xid;

/// How long transactional writes wait for plain operations to drain
const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a call that may park on the pipeline. Inside a multi-threaded tokio
/// runtime the worker hands its other tasks off first; elsewhere the call
/// runs as is.
pub fn offload_blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupted record at offset {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },
    #[error("Persisting batch failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
    #[error("Persistence pipeline halted")]
    Halted,
    #[error("Message {0} not found in store")]
    MessageNotFound(u64),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A message as written to storage, with the durable queues holding it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: u64,
    pub data: Arc<MessageData>,
    pub queues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreOp {
    Insert(StoredMessage),
    Detach { id: u64, queue: String },
    Delete { id: u64 },
}

impl StoreOp {
    pub fn message_id(&self) -> u64 {
        match self {
            StoreOp::Insert(message) => message.id,
            StoreOp::Detach { id, .. } | StoreOp::Delete { id } => *id,
        }
    }

    pub fn op_type(&self) -> OpType {
        match self {
            StoreOp::Insert(_) => OpType::Insert,
            StoreOp::Detach { .. } => OpType::Detach,
            StoreOp::Delete { .. } => OpType::Delete,
        }
    }
}

/// Queue a transactional publish is routed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTarget {
    pub name: String,
    pub durable: bool,
}

/// Publish recorded inside a transaction
#[derive(Debug, Clone)]
pub struct TxEnqueue {
    pub message_id: u64,
    pub data: Arc<MessageData>,
    pub queues: Vec<QueueTarget>,
}

/// Acknowledgement recorded inside a transaction
#[derive(Debug, Clone)]
pub struct TxDequeue {
    pub queue: String,
    pub durable: bool,
    pub message: Message,
}

#[derive(Debug, Default)]
struct Attachment {
    durable: BTreeSet<String>,
    transient: BTreeSet<String>,
}

impl Attachment {
    fn is_empty(&self) -> bool {
        self.durable.is_empty() && self.transient.is_empty()
    }
}

/// Result of removing a queue from a message's attachment
struct Release {
    was_durable: bool,
    durable_left: bool,
}

pub struct MessageStore {
    adapter: Arc<dyn StorageAdapter>,
    pipeline: PersistencePipeline,
    pending: Arc<DashMap<u64, Arc<MessageData>>>,
    attachments: Arc<DashMap<u64, Attachment>>,
}

impl MessageStore {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        config: PipelineConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, StorageError> {
        let pending: Arc<DashMap<u64, Arc<MessageData>>> = Arc::new(DashMap::new());
        let attachments: Arc<DashMap<u64, Attachment>> = Arc::new(DashMap::new());

        let hook_pending = Arc::clone(&pending);
        let hook_attachments = Arc::clone(&attachments);
        let hook: CompletionHook = Box::new(move |op, failure| {
            if let Some(reason) = failure {
                error!(message_id = op.message_id(), reason, "Storage operation failed");
                return;
            }
            if let StoreOp::Insert(message) = op {
                let transient = hook_attachments
                    .get(&message.id)
                    .is_some_and(|a| !a.transient.is_empty());
                if !transient {
                    hook_pending.remove(&message.id);
                }
            }
        });

        let pipeline = PersistencePipeline::start(Arc::clone(&adapter), config, metrics, hook)?;
        Ok(Self {
            adapter,
            pipeline,
            pending,
            attachments,
        })
    }

    /// Keep the data of a newly published message until it is persisted or
    /// released by every queue.
    pub fn add(&self, id: u64, data: Arc<MessageData>) {
        self.pending.insert(id, data);
    }

    pub fn attach(&self, queue: &str, id: u64, durable: bool) {
        let mut attachment = self.attachments.entry(id).or_default();
        if durable {
            attachment.durable.insert(queue.to_string());
        } else {
            attachment.transient.insert(queue.to_string());
        }
    }

    /// Publish the insert of a routed message. Returns the pipeline sequence
    /// when a durable queue holds the message.
    pub fn flush(&self, id: u64) -> Result<Option<i64>, StorageError> {
        let Some(op) = self.insert_op(id)? else {
            return Ok(None);
        };
        self.pipeline.publish(op).map(Some)
    }

    /// Non-blocking [`MessageStore::flush`]. A full ring is reported as
    /// [`Backpressure::RingBufferFull`] and nothing is published.
    pub fn try_flush(&self, id: u64) -> Result<Result<Option<i64>, Backpressure>, StorageError> {
        let Some(op) = self.insert_op(id)? else {
            return Ok(Ok(None));
        };
        Ok(self.pipeline.try_publish(op)?.map(Some))
    }

    /// INSERT for a message attached to durable queues, `None` when there is
    /// nothing to persist.
    fn insert_op(&self, id: u64) -> Result<Option<StoreOp>, StorageError> {
        let queues = match self.attachments.get(&id) {
            Some(attachment) => attachment.durable.iter().cloned().collect::<Vec<_>>(),
            None => {
                // routed nowhere
                self.pending.remove(&id);
                return Ok(None);
            }
        };
        if queues.is_empty() {
            return Ok(None);
        }

        let data = self
            .pending
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StorageError::MessageNotFound(id))?;
        Ok(Some(StoreOp::Insert(StoredMessage { id, data, queues })))
    }

    /// Release a message from a queue, typically on acknowledgement.
    pub fn detach(&self, queue: &str, id: u64) -> Result<(), StorageError> {
        let Some(release) = self.release(queue, id) else {
            return Ok(());
        };
        if release.was_durable {
            let op = if release.durable_left {
                StoreOp::Detach {
                    id,
                    queue: queue.to_string(),
                }
            } else {
                StoreOp::Delete { id }
            };
            self.pipeline.publish(op)?;
        }
        Ok(())
    }

    fn release(&self, queue: &str, id: u64) -> Option<Release> {
        let (release, empty) = {
            let mut attachment = self.attachments.get_mut(&id)?;
            let was_durable = attachment.durable.remove(queue);
            attachment.transient.remove(queue);
            (
                Release {
                    was_durable,
                    durable_left: !attachment.durable.is_empty(),
                },
                attachment.is_empty(),
            )
        };
        if empty {
            self.attachments.remove(&id);
            self.pending.remove(&id);
        }
        Some(release)
    }

    pub fn read_all(&self, queue: &str) -> Result<Vec<u64>, StorageError> {
        self.adapter.read_all(queue)
    }

    pub fn max_message_id(&self) -> Result<u64, StorageError> {
        self.adapter.max_message_id()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_halted(&self) -> bool {
        self.pipeline.is_halted()
    }

    /// Wait until every operation published so far went through the
    /// pipeline.
    pub fn sync(&self, timeout: Duration) -> bool {
        self.pipeline
            .wait_for_persisted(self.pipeline.cursor(), timeout)
    }

    fn sync_for_transaction(&self) -> Result<(), StorageError> {
        if offload_blocking(|| self.sync(SYNC_TIMEOUT)) {
            Ok(())
        } else {
            Err(StorageError::Backend(
                "Timed out waiting for pending storage operations".to_string(),
            ))
        }
    }

    /// Storage operations a transaction's work translates to
    pub fn plan_transaction(&self, enqueues: &[TxEnqueue], dequeues: &[TxDequeue]) -> Vec<StoreOp> {
        let mut ops = Vec::new();
        for enqueue in enqueues {
            let queues = enqueue
                .queues
                .iter()
                .filter(|q| q.durable)
                .map(|q| q.name.clone())
                .collect::<Vec<_>>();
            if !queues.is_empty() {
                ops.push(StoreOp::Insert(StoredMessage {
                    id: enqueue.message_id,
                    data: Arc::clone(&enqueue.data),
                    queues,
                }));
            }
        }

        let mut released: BTreeMap<u64, Vec<&str>> = BTreeMap::new();
        for dequeue in dequeues.iter().filter(|d| d.durable) {
            released
                .entry(dequeue.message.id())
                .or_default()
                .push(dequeue.queue.as_str());
        }
        for (id, queues) in released {
            let remaining = self.attachments.get(&id).map_or(0, |a| {
                a.durable
                    .iter()
                    .filter(|q| !queues.contains(&q.as_str()))
                    .count()
            });
            if remaining == 0 {
                ops.push(StoreOp::Delete { id });
            } else {
                ops.extend(queues.into_iter().map(|queue| StoreOp::Detach {
                    id,
                    queue: queue.to_string(),
                }));
            }
        }
        ops
    }

    pub fn prepare_transaction(
        &self,
        xid: &Xid,
        enqueues: &[TxEnqueue],
        dequeues: &[TxDequeue],
    ) -> Result<(), StorageError> {
        self.sync_for_transaction()?;
        let ops = self.plan_transaction(enqueues, dequeues);
        self.adapter.store_prepared(xid, &ops)?;
        debug!(xid = %xid, operations = ops.len(), "Stored prepared transaction");
        Ok(())
    }

    /// Write a transaction's work and apply it to the attachment index.
    pub fn commit_transaction(
        &self,
        xid: &Xid,
        enqueues: &[TxEnqueue],
        dequeues: &[TxDequeue],
        prepared: bool,
    ) -> Result<(), StorageError> {
        self.sync_for_transaction()?;
        let ops = self.plan_transaction(enqueues, dequeues);
        if prepared {
            self.adapter.commit_prepared(xid, &ops)?;
        } else if !ops.is_empty() {
            self.adapter.persist_batch(&ops)?;
        }

        for enqueue in enqueues {
            if enqueue.queues.iter().any(|q| !q.durable) {
                self.pending
                    .insert(enqueue.message_id, Arc::clone(&enqueue.data));
            }
            for queue in &enqueue.queues {
                self.attach(&queue.name, enqueue.message_id, queue.durable);
            }
        }
        for dequeue in dequeues {
            self.release(&dequeue.queue, dequeue.message.id());
        }
        Ok(())
    }

    pub fn rollback_transaction(&self, xid: &Xid, prepared: bool) -> Result<(), StorageError> {
        if prepared {
            self.adapter.remove_prepared(xid)?;
        }
        Ok(())
    }

    /// Prepared transactions found in storage
    pub fn recovered_prepared(&self) -> Result<Vec<(Xid, Vec<StoreOp>)>, StorageError> {
        self.adapter.prepared()
    }

    /// Commit a transaction recovered after restart. The attachment index is
    /// updated from the recorded operations.
    pub fn commit_recovered(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.sync_for_transaction()?;
        self.adapter.commit_prepared(xid, ops)?;
        for op in ops {
            match op {
                StoreOp::Insert(message) => {
                    for queue in &message.queues {
                        self.attach(queue, message.id, true);
                    }
                }
                StoreOp::Detach { id, queue } => {
                    self.release(queue, *id);
                }
                StoreOp::Delete { id } => {
                    self.attachments.remove(id);
                    self.pending.remove(id);
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.pipeline.shutdown();
    }
}

impl MessageReader for MessageStore {
    fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError> {
        let mut found = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.pending.get(id) {
                Some(data) => {
                    found.insert(*id, Arc::clone(data.value()));
                }
                None => missing.push(*id),
            }
        }
        if !missing.is_empty() {
            found.extend(self.adapter.read(&missing)?);
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Metadata;
    use bytes::Bytes;

    fn data(body: &'static str) -> Arc<MessageData> {
        Arc::new(MessageData::new(
            Metadata::new("", "orders", body.len() as u64),
            Bytes::from_static(body.as_bytes()),
        ))
    }

    fn store() -> (MessageStore, Arc<InMemoryAdapter>) {
        let adapter = Arc::new(InMemoryAdapter::new());
        let store = MessageStore::new(
            adapter.clone(),
            PipelineConfig::default().with_ring_size(64),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        (store, adapter)
    }

    #[test]
    fn test_durable_message_is_persisted_and_released() {
        let (store, adapter) = store();
        store.add(1, data("first"));
        store.attach("orders", 1, true);
        let sequence = store.flush(1).unwrap().unwrap();
        assert!(store.sync(Duration::from_secs(5)));
        assert!(sequence >= 0);

        assert_eq!(adapter.read_all("orders").unwrap(), vec![1]);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.read(&[1]).unwrap()[&1].content, Bytes::from("first"));

        store.detach("orders", 1).unwrap();
        assert!(store.sync(Duration::from_secs(5)));
        assert!(adapter.read_all("orders").unwrap().is_empty());
        store.shutdown();
    }

    #[test]
    fn test_transient_message_never_reaches_adapter() {
        let (store, adapter) = store();
        store.add(2, data("transient"));
        store.attach("scratch", 2, false);
        assert_eq!(store.flush(2).unwrap(), None);

        assert_eq!(store.read(&[2]).unwrap().len(), 1);
        assert!(adapter.read(&[2]).unwrap().is_empty());

        store.detach("scratch", 2).unwrap();
        assert_eq!(store.pending_count(), 0);
        assert!(store.read(&[2]).unwrap().is_empty());
        store.shutdown();
    }

    #[test]
    fn test_unrouted_message_is_dropped_on_flush() {
        let (store, _) = store();
        store.add(3, data("nowhere"));
        assert_eq!(store.flush(3).unwrap(), None);
        assert_eq!(store.pending_count(), 0);
        store.shutdown();
    }

    #[test]
    fn test_detach_from_one_of_two_durable_queues() {
        let (store, adapter) = store();
        store.add(4, data("fanout"));
        store.attach("a", 4, true);
        store.attach("b", 4, true);
        store.flush(4).unwrap();
        store.detach("a", 4).unwrap();
        assert!(store.sync(Duration::from_secs(5)));

        assert!(adapter.read_all("a").unwrap().is_empty());
        assert_eq!(adapter.read_all("b").unwrap(), vec![4]);
        store.shutdown();
    }

    #[test]
    fn test_transaction_commit_writes_synchronously() {
        let (store, adapter) = store();
        let xid = Xid::new(1, "gtrid", "bqual");
        let enqueue = TxEnqueue {
            message_id: 10,
            data: data("tx"),
            queues: vec![QueueTarget {
                name: "orders".to_string(),
                durable: true,
            }],
        };

        store
            .prepare_transaction(&xid, std::slice::from_ref(&enqueue), &[])
            .unwrap();
        assert_eq!(adapter.prepared().unwrap().len(), 1);
        assert!(adapter.read_all("orders").unwrap().is_empty());

        store
            .commit_transaction(&xid, &[enqueue], &[], true)
            .unwrap();
        assert!(adapter.prepared().unwrap().is_empty());
        assert_eq!(adapter.read_all("orders").unwrap(), vec![10]);

        let dequeue = TxDequeue {
            queue: "orders".to_string(),
            durable: true,
            message: Message::bare(10),
        };
        let ops = store.plan_transaction(&[], &[dequeue]);
        assert_eq!(ops, vec![StoreOp::Delete { id: 10 }]);
        store.shutdown();
    }
}
