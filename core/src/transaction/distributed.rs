use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::branch::Branch;
use super::registry::Registry;
use super::{TransactionError, TransactionResult, TransactionalResource, Xid};
use crate::store::{TxDequeue, TxEnqueue};
use crate::ValidationError;

/// Transaction state of a channel in `dtx.select` mode.
///
/// Work is staged on the branch started on this channel. Outside a
/// `dtx.start`/`dtx.end` block publishes and acks apply directly.
#[derive(Debug)]
pub struct DistributedTransaction {
    registry: Arc<Registry>,
    session_id: u64,
    current: Option<Arc<Branch>>,
    failures: Vec<String>,
}

impl DistributedTransaction {
    pub fn new(registry: Arc<Registry>, session_id: u64) -> Self {
        Self {
            registry,
            session_id,
            current: None,
            failures: Vec::new(),
        }
    }

    pub fn in_transaction_block(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_xid(&self) -> Option<&Xid> {
        self.current.as_ref().map(|b| b.xid())
    }

    /// Stage a publish. Returns it back when no branch is started.
    pub fn enqueue(&mut self, enqueue: TxEnqueue) -> Option<TxEnqueue> {
        match &self.current {
            Some(branch) => {
                if let Err(e) = branch.enqueue(enqueue) {
                    self.failures.push(e.reason);
                }
                None
            }
            None => Some(enqueue),
        }
    }

    /// Stage an acknowledgement. Returns it back when no branch is started.
    pub fn dequeue(&mut self, dequeue: TxDequeue) -> Option<TxDequeue> {
        match &self.current {
            Some(branch) => {
                if let Err(e) = branch.dequeue(dequeue) {
                    self.failures.push(e.reason);
                }
                None
            }
            None => Some(dequeue),
        }
    }

    pub fn start(&mut self, xid: &Xid, join: bool, resume: bool) -> TransactionResult<()> {
        if join && resume {
            return Err(ValidationError::precondition_failed(format!(
                "Cannot start a branch with both join and resume set {}",
                xid
            ))
            .into());
        }

        let existing = self.registry.get(xid)?;
        let branch = if join {
            let branch = existing.ok_or_else(|| TransactionError::UnknownBranch(xid.clone()))?;
            branch.associate_session(self.session_id);
            branch
        } else if resume {
            let branch = existing.ok_or_else(|| TransactionError::UnknownBranch(xid.clone()))?;
            branch.resume_session(self.session_id)?;
            branch
        } else {
            if existing.is_some() {
                return Err(ValidationError::precondition_failed(format!(
                    "Xid {} cannot be started as it is already known",
                    xid
                ))
                .into());
            }
            let branch = Arc::new(Branch::new(xid.clone()));
            self.registry.register(Arc::clone(&branch))?;
            branch.associate_session(self.session_id);
            branch
        };

        debug!(xid = %xid, session = self.session_id, join, resume, "dtx.start");
        self.current = Some(branch);
        Ok(())
    }

    pub fn end(&mut self, xid: &Xid, fail: bool, suspend: bool) -> TransactionResult<()> {
        let branch = self
            .registry
            .get(xid)?
            .ok_or_else(|| TransactionError::UnknownBranch(xid.clone()))?;

        if suspend && fail {
            branch.disassociate_session(self.session_id);
            self.current = None;
            return Err(ValidationError::precondition_failed(format!(
                "Cannot end a branch with both suspend and fail set {}",
                xid
            ))
            .into());
        }
        if !branch.is_associated(self.session_id) {
            return Err(ValidationError::precondition_failed(format!(
                "Xid {} not associated with the current session",
                xid
            ))
            .into());
        }

        if suspend {
            branch.suspend_session(self.session_id);
        } else {
            if fail && !branch.mark_rollback_only() {
                debug!(xid = %xid, state = %branch.state(), "dtx.end(fail) left branch state unchanged");
            }
            branch.disassociate_session(self.session_id);
        }
        debug!(xid = %xid, session = self.session_id, fail, suspend, "dtx.end");
        self.current = None;
        Ok(())
    }

    pub fn prepare(&mut self, xid: &Xid, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        if !self.failures.is_empty() {
            return Err(ValidationError::precondition_failed(format!(
                "Pre conditions failed for commit. Errors {}",
                self.failures.join("\n")
            ))
            .into());
        }
        self.registry.prepare(xid, resource)
    }

    pub fn commit(
        &mut self,
        xid: &Xid,
        one_phase: bool,
        resource: &dyn TransactionalResource,
    ) -> TransactionResult<()> {
        self.registry.commit(xid, one_phase, resource)?;
        self.failures.clear();
        Ok(())
    }

    pub fn rollback(&mut self, xid: &Xid, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        self.registry.rollback(xid, resource)?;
        self.failures.clear();
        Ok(())
    }

    pub fn forget(&self, xid: &Xid) -> TransactionResult<()> {
        self.registry.forget(xid)
    }

    pub fn set_timeout(&self, xid: &Xid, timeout: Duration) -> TransactionResult<()> {
        self.registry.set_timeout(xid, timeout)
    }

    pub fn recover(&self) -> Vec<Xid> {
        self.registry.recover()
    }

    pub fn tx_commit(&self) -> TransactionResult<()> {
        Err(ValidationError::command_invalid(
            "tx.commit called on distributed-transactional channel",
        )
        .into())
    }

    pub fn tx_rollback(&self) -> TransactionResult<()> {
        Err(ValidationError::command_invalid(
            "tx.rollback called on distributed-transactional channel",
        )
        .into())
    }

    /// Branches outlive the channel; only the association is dropped.
    pub fn on_close(&mut self) {
        if let Some(branch) = self.current.take() {
            branch.disassociate_session(self.session_id);
        }
    }
}
