use std::sync::Arc;
use tracing::debug;

use super::branch::Branch;
use super::registry::Registry;
use super::{TransactionResult, TransactionalResource, Xid};
use crate::store::{TxDequeue, TxEnqueue};
use crate::ValidationError;

/// Transaction state of a channel in `tx.select` mode.
///
/// A branch is created on the first staged publish or ack and always
/// committed in one phase.
#[derive(Debug)]
pub struct LocalTransaction {
    registry: Arc<Registry>,
    channel_key: u64,
    sequence: u64,
    branch: Option<Arc<Branch>>,
    failures: Vec<String>,
}

impl LocalTransaction {
    pub fn new(registry: Arc<Registry>, channel_key: u64) -> Self {
        Self {
            registry,
            channel_key,
            sequence: 0,
            branch: None,
            failures: Vec::new(),
        }
    }

    fn branch(&mut self) -> Result<Arc<Branch>, String> {
        if let Some(branch) = &self.branch {
            return Ok(Arc::clone(branch));
        }
        self.sequence += 1;
        let branch = Arc::new(Branch::new(Xid::local(self.channel_key, self.sequence)));
        self.registry
            .register(Arc::clone(&branch))
            .map_err(|e| format!("Error occurred while registering branch: {}", e))?;
        self.branch = Some(Arc::clone(&branch));
        Ok(branch)
    }

    pub fn enqueue(&mut self, enqueue: TxEnqueue) {
        let result = self
            .branch()
            .and_then(|branch| branch.enqueue(enqueue).map_err(|e| e.reason));
        if let Err(reason) = result {
            self.failures.push(reason);
        }
    }

    pub fn dequeue(&mut self, dequeue: TxDequeue) {
        let result = self
            .branch()
            .and_then(|branch| branch.dequeue(dequeue).map_err(|e| e.reason));
        if let Err(reason) = result {
            self.failures.push(reason);
        }
    }

    /// Number of staged publishes and acks
    pub fn pending_work(&self) -> usize {
        self.branch.as_ref().map_or(0, |b| b.work_size())
    }

    pub fn commit(&mut self, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        if !self.failures.is_empty() {
            return Err(ValidationError::precondition_failed(format!(
                "Pre conditions failed for commit. Errors {}",
                self.failures.join("\n")
            ))
            .into());
        }
        let Some(branch) = self.branch.clone() else {
            debug!(channel = self.channel_key, "Nothing to commit");
            return Ok(());
        };

        let work = branch.take_work();
        if let Err(e) = resource.commit(branch.xid(), &work, false) {
            // keep the work so a rollback can still undo it
            branch.lock().work = work;
            return Err(e.into());
        }
        self.clear();
        Ok(())
    }

    pub fn rollback(&mut self, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        let Some(branch) = self.branch.clone() else {
            debug!(channel = self.channel_key, "Nothing to roll back");
            return Ok(());
        };
        let work = branch.take_work();
        let result = resource.rollback(branch.xid(), &work, false);
        self.clear();
        result.map_err(Into::into)
    }

    fn clear(&mut self) {
        self.failures.clear();
        if let Some(branch) = self.branch.take() {
            self.registry.unregister(branch.xid());
        }
    }

    pub fn on_close(&mut self, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        self.rollback(resource)
    }
}

/// Error for a `dtx.*` method received on a `tx.select` channel
pub fn dtx_on_local_channel(method: &str) -> super::TransactionError {
    ValidationError::command_invalid(format!("{} called on local-transactional channel", method))
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Message, MessageData, Metadata};
    use crate::store::{QueueTarget, StorageError};
    use crate::transaction::BranchWork;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CountingResource {
        committed: Mutex<Vec<(usize, usize)>>,
        rolled_back: Mutex<usize>,
    }

    impl TransactionalResource for CountingResource {
        fn prepare(&self, _: &Xid, _: &BranchWork) -> Result<(), StorageError> {
            Ok(())
        }
        fn commit(&self, _: &Xid, work: &BranchWork, prepared: bool) -> Result<(), StorageError> {
            assert!(!prepared);
            self.committed
                .lock()
                .push((work.enqueues.len(), work.dequeues.len()));
            Ok(())
        }
        fn rollback(&self, _: &Xid, _: &BranchWork, _: bool) -> Result<(), StorageError> {
            *self.rolled_back.lock() += 1;
            Ok(())
        }
        fn commit_recovered(&self, _: &Xid) -> Result<(), StorageError> {
            Ok(())
        }
        fn rollback_recovered(&self, _: &Xid) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn enqueue(id: u64) -> TxEnqueue {
        TxEnqueue {
            message_id: id,
            data: Arc::new(MessageData::new(Metadata::new("", "q", 0), Bytes::new())),
            queues: vec![QueueTarget {
                name: "q".to_string(),
                durable: false,
            }],
        }
    }

    #[test]
    fn test_branch_created_lazily() {
        let registry = Arc::new(Registry::new());
        let resource = CountingResource::default();
        let mut tx = LocalTransaction::new(registry.clone(), 42);

        tx.commit(&resource).unwrap();
        assert!(registry.is_empty());
        assert!(resource.committed.lock().is_empty());

        tx.enqueue(enqueue(1));
        tx.enqueue(enqueue(2));
        tx.dequeue(TxDequeue {
            queue: "q".to_string(),
            durable: false,
            message: Message::bare(7),
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(tx.pending_work(), 3);

        tx.commit(&resource).unwrap();
        assert!(registry.is_empty());
        assert_eq!(resource.committed.lock().as_slice(), &[(2, 1)]);
    }

    #[test]
    fn test_each_commit_uses_a_fresh_branch() {
        let registry = Arc::new(Registry::new());
        let resource = CountingResource::default();
        let mut tx = LocalTransaction::new(registry.clone(), 1);

        tx.enqueue(enqueue(1));
        tx.commit(&resource).unwrap();
        tx.enqueue(enqueue(2));
        tx.rollback(&resource).unwrap();
        tx.enqueue(enqueue(3));
        tx.on_close(&resource).unwrap();

        assert_eq!(resource.committed.lock().len(), 1);
        assert_eq!(*resource.rolled_back.lock(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dtx_method_rejected() {
        let err = dtx_on_local_channel("dtx.start");
        assert_eq!(err.to_string(), "dtx.start called on local-transactional channel");
    }
}
