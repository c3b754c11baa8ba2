use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{StorageError, StoreOp};
use crate::queue::MessageData;
use crate::transaction::Xid;

/// Storage backend behind the persistence pipeline.
///
/// `persist_batch` must be all-or-nothing: after an error none of the
/// operations may be visible, so the pipeline can retry the batch as a whole.
pub trait StorageAdapter: Send + Sync {
    fn persist_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError>;

    /// Message data for the given ids; unknown ids are left out
    fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError>;

    /// Ids of the messages stored for `queue`, oldest first
    fn read_all(&self, queue: &str) -> Result<Vec<u64>, StorageError>;

    fn store_prepared(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError>;

    fn remove_prepared(&self, xid: &Xid) -> Result<(), StorageError>;

    fn commit_prepared(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.persist_batch(ops)?;
        self.remove_prepared(xid)
    }

    fn prepared(&self) -> Result<Vec<(Xid, Vec<StoreOp>)>, StorageError>;

    /// Highest message id ever stored, deleted ones included; 0 when nothing
    /// was stored
    fn max_message_id(&self) -> Result<u64, StorageError>;
}

#[derive(Debug)]
struct Record {
    data: Arc<MessageData>,
    queues: BTreeSet<String>,
}

/// Materialised view of the stored messages, shared by the adapters.
#[derive(Debug, Default)]
pub(crate) struct MessageIndex {
    records: DashMap<u64, Record>,
    prepared: DashMap<Xid, Vec<StoreOp>>,
    /// Highest message id ever inserted or prepared, kept after deletes
    high_water: AtomicU64,
}

impl MessageIndex {
    pub(crate) fn apply(&self, op: &StoreOp) {
        match op {
            StoreOp::Insert(message) => {
                self.high_water.fetch_max(message.id, Ordering::Relaxed);
                let mut record = self.records.entry(message.id).or_insert_with(|| Record {
                    data: Arc::clone(&message.data),
                    queues: BTreeSet::new(),
                });
                record.queues.extend(message.queues.iter().cloned());
            }
            StoreOp::Detach { id, queue } => {
                let empty = match self.records.get_mut(id) {
                    Some(mut record) => {
                        record.queues.remove(queue);
                        record.queues.is_empty()
                    }
                    None => false,
                };
                if empty {
                    self.records.remove(id);
                }
            }
            StoreOp::Delete { id } => {
                self.records.remove(id);
            }
        }
    }

    pub(crate) fn apply_all(&self, ops: &[StoreOp]) {
        for op in ops {
            self.apply(op);
        }
    }

    pub(crate) fn set_prepared(&self, xid: &Xid, ops: &[StoreOp]) {
        if let Some(max) = ops.iter().map(StoreOp::message_id).max() {
            self.high_water.fetch_max(max, Ordering::Relaxed);
        }
        self.prepared.insert(xid.clone(), ops.to_vec());
    }

    pub(crate) fn remove_prepared(&self, xid: &Xid) {
        self.prepared.remove(xid);
    }

    pub(crate) fn read(&self, ids: &[u64]) -> HashMap<u64, Arc<MessageData>> {
        ids.iter()
            .filter_map(|id| {
                self.records
                    .get(id)
                    .map(|record| (*id, Arc::clone(&record.data)))
            })
            .collect()
    }

    pub(crate) fn read_all(&self, queue: &str) -> Vec<u64> {
        let mut ids = self
            .records
            .iter()
            .filter(|entry| entry.queues.contains(queue))
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn prepared(&self) -> Vec<(Xid, Vec<StoreOp>)> {
        self.prepared
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn max_message_id(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Adapter keeping everything in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    index: MessageIndex,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageAdapter for InMemoryAdapter {
    fn persist_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.index.apply_all(ops);
        Ok(())
    }

    fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError> {
        Ok(self.index.read(ids))
    }

    fn read_all(&self, queue: &str) -> Result<Vec<u64>, StorageError> {
        Ok(self.index.read_all(queue))
    }

    fn store_prepared(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.index.set_prepared(xid, ops);
        Ok(())
    }

    fn remove_prepared(&self, xid: &Xid) -> Result<(), StorageError> {
        self.index.remove_prepared(xid);
        Ok(())
    }

    fn prepared(&self) -> Result<Vec<(Xid, Vec<StoreOp>)>, StorageError> {
        Ok(self.index.prepared())
    }

    fn max_message_id(&self) -> Result<u64, StorageError> {
        Ok(self.index.max_message_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Metadata;
    use crate::store::StoredMessage;
    use bytes::Bytes;

    fn insert(id: u64, queues: &[&str]) -> StoreOp {
        StoreOp::Insert(StoredMessage {
            id,
            data: Arc::new(MessageData::new(Metadata::new("", "q", 2), Bytes::from("hi"))),
            queues: queues.iter().map(|q| q.to_string()).collect(),
        })
    }

    #[test]
    fn test_detach_and_delete() {
        let adapter = InMemoryAdapter::new();
        adapter
            .persist_batch(&[insert(3, &["a", "b"]), insert(1, &["a"]), insert(2, &["b"])])
            .unwrap();
        assert_eq!(adapter.read_all("a").unwrap(), vec![1, 3]);
        assert_eq!(adapter.read_all("b").unwrap(), vec![2, 3]);

        adapter
            .persist_batch(&[
                StoreOp::Detach {
                    id: 3,
                    queue: "a".to_string(),
                },
                StoreOp::Delete { id: 2 },
            ])
            .unwrap();
        assert_eq!(adapter.read_all("a").unwrap(), vec![1]);
        assert_eq!(adapter.read_all("b").unwrap(), vec![3]);

        // detaching the last queue drops the message
        adapter
            .persist_batch(&[StoreOp::Detach {
                id: 3,
                queue: "b".to_string(),
            }])
            .unwrap();
        assert!(adapter.read(&[3]).unwrap().is_empty());
        assert_eq!(adapter.len(), 1);
        // released ids are never handed out again
        assert_eq!(adapter.max_message_id().unwrap(), 3);
    }

    #[test]
    fn test_prepared_records() {
        let adapter = InMemoryAdapter::new();
        let xid = Xid::new(7, "g", "b");
        adapter.store_prepared(&xid, &[insert(9, &["a"])]).unwrap();

        assert!(adapter.read_all("a").unwrap().is_empty());
        assert_eq!(adapter.max_message_id().unwrap(), 9);
        assert_eq!(adapter.prepared().unwrap()[0].0, xid);

        adapter.commit_prepared(&xid, &[insert(9, &["a"])]).unwrap();
        assert!(adapter.prepared().unwrap().is_empty());
        assert_eq!(adapter.read_all("a").unwrap(), vec![9]);
    }
}
