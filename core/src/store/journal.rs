//! Append-only journal adapter.
//!
//! Record format (big-endian):
//! `[length: 4 bytes][crc: 4 bytes][payload: length - 4 bytes]`
//!
//! `length` covers the CRC and the payload, the CRC is computed over the
//! payload, and the payload is a JSON encoded [`JournalRecord`]. One record
//! holds a whole batch, so a batch is either fully in the journal or cut off
//! as a torn tail and discarded on the next open.

use memmap2::MmapOptions;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::adapter::{MessageIndex, StorageAdapter};
use super::{StorageError, StoreOp};
use crate::queue::MessageData;
use crate::transaction::Xid;

pub const JOURNAL_FILE: &str = "messages.journal";

const RECORD_HEADER_SIZE: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    Batch(Vec<StoreOp>),
    Prepare { xid: Xid, ops: Vec<StoreOp> },
    RemovePrepared { xid: Xid },
    Commit { xid: Xid, ops: Vec<StoreOp> },
}

impl JournalRecord {
    fn serialize(&self) -> Result<Vec<u8>, StorageError> {
        let payload = serde_json::to_vec(self)?;
        let length = u32::try_from(payload.len() + 4).map_err(|_| {
            StorageError::Backend("Journal record exceeds u32::MAX bytes".to_string())
        })?;

        let mut buf = Vec::with_capacity(payload.len() + RECORD_HEADER_SIZE);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode the record starting at `data[0]`, returning it with its total
    /// size on disk.
    fn deserialize(data: &[u8], offset: u64) -> Result<(Self, usize), StorageError> {
        let corrupted = |reason: &str| StorageError::Corrupted {
            offset,
            reason: reason.to_string(),
        };

        if data.len() < RECORD_HEADER_SIZE {
            return Err(corrupted("Incomplete record header"));
        }
        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length < 4 || data.len() < 4 + length {
            return Err(corrupted("Incomplete record"));
        }

        let crc = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[RECORD_HEADER_SIZE..4 + length];
        if crc32fast::hash(payload) != crc {
            return Err(corrupted("CRC mismatch"));
        }

        let record = serde_json::from_slice(payload)
            .map_err(|e| corrupted(&format!("Undecodable payload: {}", e)))?;
        Ok((record, 4 + length))
    }
}

pub struct JournalAdapter {
    path: PathBuf,
    file: Mutex<File>,
    index: MessageIndex,
}

impl JournalAdapter {
    /// Open the journal in `data_dir`, creating it if needed, and replay it.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir.as_ref())?;
        let path = data_dir.as_ref().join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let index = MessageIndex::default();
        let records = Self::replay(&file, &index)?;
        info!(
            path = %path.display(),
            records,
            messages = index.len(),
            "Opened message journal"
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn open_shared<P: AsRef<Path>>(data_dir: P) -> Result<Arc<Self>, StorageError> {
        Self::open(data_dir).map(Arc::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuild the index from the journal, truncating a torn or corrupted tail.
    fn replay(file: &File, index: &MessageIndex) -> Result<usize, StorageError> {
        let file_size = file.metadata()?.len() as usize;
        if file_size == 0 {
            return Ok(0);
        }

        let mmap = unsafe { MmapOptions::new().map(file)? };
        let mut pos = 0;
        let mut records = 0;
        let mut truncate_at = None;

        while pos < mmap.len() {
            match JournalRecord::deserialize(&mmap[pos..], pos as u64) {
                Ok((record, size)) => {
                    Self::apply(index, &record);
                    pos += size;
                    records += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Discarding journal tail");
                    truncate_at = Some(pos as u64);
                    break;
                }
            }
        }

        // the mapping must be gone before the file shrinks
        drop(mmap);

        if let Some(len) = truncate_at {
            file.set_len(len)?;
            file.sync_all()?;
        }
        Ok(records)
    }

    fn apply(index: &MessageIndex, record: &JournalRecord) {
        match record {
            JournalRecord::Batch(ops) => index.apply_all(ops),
            JournalRecord::Prepare { xid, ops } => index.set_prepared(xid, ops),
            JournalRecord::RemovePrepared { xid } => index.remove_prepared(xid),
            JournalRecord::Commit { xid, ops } => {
                index.apply_all(ops);
                index.remove_prepared(xid);
            }
        }
    }

    fn append(&self, record: JournalRecord) -> Result<(), StorageError> {
        let serialized = record.serialize()?;
        let mut file = self.file.lock();
        let start = file.seek(SeekFrom::End(0))?;

        let written = file
            .write_all(&serialized)
            .and_then(|_| file.sync_data());
        if let Err(e) = written {
            // leave no partial record behind
            if let Err(truncate_error) = file.set_len(start) {
                warn!(error = %truncate_error, "Failed to roll back partial journal record");
            }
            return Err(e.into());
        }

        Self::apply(&self.index, &record);
        debug!(offset = start, bytes = serialized.len(), "Appended journal record");
        Ok(())
    }

    /// Current journal size in bytes
    pub fn size(&self) -> Result<u64, StorageError> {
        Ok(self.file.lock().metadata()?.len())
    }
}

impl StorageAdapter for JournalAdapter {
    fn persist_batch(&self, ops: &[StoreOp]) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.append(JournalRecord::Batch(ops.to_vec()))
    }

    fn read(&self, ids: &[u64]) -> Result<HashMap<u64, Arc<MessageData>>, StorageError> {
        Ok(self.index.read(ids))
    }

    fn read_all(&self, queue: &str) -> Result<Vec<u64>, StorageError> {
        Ok(self.index.read_all(queue))
    }

    fn store_prepared(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.append(JournalRecord::Prepare {
            xid: xid.clone(),
            ops: ops.to_vec(),
        })
    }

    fn remove_prepared(&self, xid: &Xid) -> Result<(), StorageError> {
        self.append(JournalRecord::RemovePrepared { xid: xid.clone() })
    }

    fn commit_prepared(&self, xid: &Xid, ops: &[StoreOp]) -> Result<(), StorageError> {
        self.append(JournalRecord::Commit {
            xid: xid.clone(),
            ops: ops.to_vec(),
        })
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
    use tempfile::tempdir;

    fn insert(id: u64, queue: &str, body: &'static str) -> StoreOp {
        StoreOp::Insert(StoredMessage {
            id,
            data: Arc::new(MessageData::new(
                Metadata::new("amq.direct", queue, body.len() as u64),
                Bytes::from_static(body.as_bytes()),
            )),
            queues: vec![queue.to_string()],
        })
    }

    #[test]
    fn test_replay_restores_index() {
        let dir = tempdir().unwrap();
        {
            let journal = JournalAdapter::open(dir.path()).unwrap();
            journal
                .persist_batch(&[insert(1, "orders", "a"), insert(2, "orders", "b")])
                .unwrap();
            journal.persist_batch(&[StoreOp::Delete { id: 1 }]).unwrap();
            journal.persist_batch(&[insert(3, "audit", "c")]).unwrap();
        }

        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert_eq!(journal.read_all("orders").unwrap(), vec![2]);
        assert_eq!(journal.read_all("audit").unwrap(), vec![3]);
        assert_eq!(journal.max_message_id().unwrap(), 3);
        let data = journal.read(&[2]).unwrap();
        assert_eq!(data[&2].content, Bytes::from("b"));
        assert_eq!(data[&2].metadata.routing_key, "orders");
    }

    #[test]
    fn test_deleted_newest_id_stays_reserved_after_restart() {
        let dir = tempdir().unwrap();
        {
            let journal = JournalAdapter::open(dir.path()).unwrap();
            journal
                .persist_batch(&[insert(1, "orders", "a"), insert(2, "orders", "b")])
                .unwrap();
            journal.persist_batch(&[StoreOp::Delete { id: 2 }]).unwrap();
        }

        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert_eq!(journal.read_all("orders").unwrap(), vec![1]);
        assert_eq!(journal.max_message_id().unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let intact_size = {
            let journal = JournalAdapter::open(dir.path()).unwrap();
            journal.persist_batch(&[insert(1, "orders", "a")]).unwrap();
            journal.size().unwrap()
        };

        // simulate a crash in the middle of the next append
        let path = dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let torn = JournalRecord::Batch(vec![insert(2, "orders", "b")])
            .serialize()
            .unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(file);

        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert_eq!(journal.read_all("orders").unwrap(), vec![1]);
        assert_eq!(journal.size().unwrap(), intact_size);

        // appends continue after the truncated tail
        journal.persist_batch(&[insert(2, "orders", "b")]).unwrap();
        drop(journal);
        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert_eq!(journal.read_all("orders").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_corrupted_record_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let journal = JournalAdapter::open(dir.path()).unwrap();
            journal.persist_batch(&[insert(1, "orders", "a")]).unwrap();
            journal.persist_batch(&[insert(2, "orders", "b")]).unwrap();
        }

        let path = dir.path().join(JOURNAL_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert_eq!(journal.read_all("orders").unwrap(), vec![1]);
    }

    #[test]
    fn test_prepared_transactions_survive_restart() {
        let dir = tempdir().unwrap();
        let committed = Xid::new(1, "g1", "b1");
        let pending = Xid::new(1, "g2", "b2");
        {
            let journal = JournalAdapter::open(dir.path()).unwrap();
            journal
                .store_prepared(&committed, &[insert(5, "orders", "x")])
                .unwrap();
            journal
                .store_prepared(&pending, &[insert(6, "orders", "y")])
                .unwrap();
            journal
                .commit_prepared(&committed, &[insert(5, "orders", "x")])
                .unwrap();
        }

        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert_eq!(journal.read_all("orders").unwrap(), vec![5]);
        let prepared = journal.prepared().unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].0, pending);
        assert_eq!(journal.max_message_id().unwrap(), 6);

        journal.remove_prepared(&pending).unwrap();
        drop(journal);
        let journal = JournalAdapter::open(dir.path()).unwrap();
        assert!(journal.prepared().unwrap().is_empty());
    }
}
