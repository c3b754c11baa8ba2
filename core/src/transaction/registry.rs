use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::branch::{Branch, BranchInner, BranchState, BranchWork};
use super::{TransactionError, TransactionResult, TransactionalResource, Xid};
use crate::ValidationError;

const ASSOCIATED_SESSIONS: &str = "Branch still has associated active sessions for xid ";

/// Index of the live transaction branches by xid.
///
/// Prepared transactions found in storage at startup are only known by xid
/// until they are committed or rolled back.
#[derive(Debug, Default)]
pub struct Registry {
    branches: DashMap<Xid, Arc<Branch>>,
    stored: DashSet<Xid>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, branch: Arc<Branch>) -> TransactionResult<()> {
        match self.branches.entry(branch.xid().clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ValidationError::precondition_failed(format!(
                    "Branch with the same xid {} is already registered.",
                    branch.xid()
                ))
                .into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                debug!(xid = %branch.xid(), "Registered branch");
                entry.insert(branch);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, xid: &Xid) {
        if self.branches.remove(xid).is_none() {
            self.stored.remove(xid);
        }
    }

    /// Look up a live branch. Stored prepared branches can only be completed.
    pub fn get(&self, xid: &Xid) -> TransactionResult<Option<Arc<Branch>>> {
        if self.stored.contains(xid) {
            return Err(ValidationError::precondition_failed(
                "Branch is in prepared stage. Branch can be only be committed or rollbacked.",
            )
            .into());
        }
        Ok(self.branches.get(xid).map(|b| Arc::clone(b.value())))
    }

    pub fn contains(&self, xid: &Xid) -> bool {
        self.branches.contains_key(xid) || self.stored.contains(xid)
    }

    pub fn state(&self, xid: &Xid) -> Option<BranchState> {
        self.branches.get(xid).map(|b| b.state())
    }

    pub fn len(&self) -> usize {
        self.branches.len() + self.stored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record prepared transactions found in storage
    pub fn restore_prepared(&self, xids: impl IntoIterator<Item = Xid>) {
        self.stored.clear();
        for xid in xids {
            info!(xid = %xid, "Recovered prepared transaction");
            self.stored.insert(xid);
        }
    }

    fn live(&self, xid: &Xid) -> TransactionResult<Arc<Branch>> {
        self.branches
            .get(xid)
            .map(|b| Arc::clone(b.value()))
            .ok_or_else(|| TransactionError::UnknownBranch(xid.clone()))
    }

    /// Fail with `TimedOut` and unregister when the branch expired. An
    /// expiry detected here rolls the work back first.
    fn check_expiration(
        &self,
        xid: &Xid,
        inner: &mut BranchInner,
        resource: &dyn TransactionalResource,
    ) -> TransactionResult<()> {
        if inner.expire_if_due(Instant::now()) {
            let work = std::mem::take(&mut inner.work);
            resource.rollback(xid, &work, false)?;
        }
        if inner.state == BranchState::TimedOut {
            self.unregister(xid);
            return Err(TransactionError::TimedOut(xid.clone()));
        }
        Ok(())
    }

    pub fn prepare(&self, xid: &Xid, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        if self.stored.contains(xid) {
            return Err(ValidationError::precondition_failed(format!(
                "Cannot prepare a branch in state {}",
                BranchState::Prepared
            ))
            .into());
        }

        let branch = self.live(xid)?;
        let mut inner = branch.lock();
        if inner.has_active_sessions() {
            return Err(associated_sessions(xid));
        }
        self.check_expiration(xid, &mut inner, resource)?;
        inner.clear_sessions();

        match inner.state {
            BranchState::RollbackOnly => Err(ValidationError::precondition_failed(
                "Transaction can only be rollbacked",
            )
            .into()),
            BranchState::Active => {
                resource.prepare(xid, &inner.work)?;
                inner.state = BranchState::Prepared;
                debug!(xid = %xid, "Branch prepared");
                Ok(())
            }
            other => Err(ValidationError::precondition_failed(format!(
                "Cannot prepare a branch in state {}",
                other
            ))
            .into()),
        }
    }

    pub fn commit(
        &self,
        xid: &Xid,
        one_phase: bool,
        resource: &dyn TransactionalResource,
    ) -> TransactionResult<()> {
        let branch = match self.branches.get(xid).map(|b| Arc::clone(b.value())) {
            Some(branch) => branch,
            None if self.stored.contains(xid) => {
                if one_phase {
                    return Err(one_phase_on_prepared(xid));
                }
                resource.commit_recovered(xid)?;
                self.stored.remove(xid);
                info!(xid = %xid, "Committed recovered branch");
                return Ok(());
            }
            None => return Err(TransactionError::UnknownBranch(xid.clone())),
        };

        let mut inner = branch.lock();
        if inner.has_active_sessions() {
            return Err(associated_sessions(xid));
        }
        self.check_expiration(xid, &mut inner, resource)?;
        if inner.state == BranchState::RollbackOnly {
            return Err(ValidationError::precondition_failed(format!(
                "Branch is set to rollback only. Can't commit with xid {}",
                xid
            ))
            .into());
        }
        let prepared = inner.is_prepared();
        if !one_phase && !prepared {
            return Err(ValidationError::precondition_failed(format!(
                "Cannot call two-phase commit on a non-prepared branch for xid {}",
                xid
            ))
            .into());
        }
        if one_phase && prepared {
            return Err(one_phase_on_prepared(xid));
        }

        inner.clear_sessions();
        resource.commit(xid, &inner.work, prepared)?;
        inner.work = BranchWork::default();
        inner.state = BranchState::Committed;
        drop(inner);
        self.unregister(xid);
        debug!(xid = %xid, one_phase, "Branch committed");
        Ok(())
    }

    pub fn rollback(&self, xid: &Xid, resource: &dyn TransactionalResource) -> TransactionResult<()> {
        let branch = match self.branches.get(xid).map(|b| Arc::clone(b.value())) {
            Some(branch) => branch,
            None if self.stored.contains(xid) => {
                resource.rollback_recovered(xid)?;
                self.stored.remove(xid);
                info!(xid = %xid, "Rolled back recovered branch");
                return Ok(());
            }
            None => return Err(TransactionError::UnknownBranch(xid.clone())),
        };

        let mut inner = branch.lock();
        self.check_expiration(xid, &mut inner, resource)?;
        if inner.has_active_sessions() {
            return Err(associated_sessions(xid));
        }
        inner.clear_sessions();

        let prepared = inner.is_prepared();
        resource.rollback(xid, &inner.work, prepared)?;
        inner.work = BranchWork::default();
        inner.state = BranchState::RolledBack;
        drop(inner);
        self.unregister(xid);
        debug!(xid = %xid, "Branch rolled back");
        Ok(())
    }

    pub fn forget(&self, xid: &Xid) -> TransactionResult<()> {
        let branch = self.live(xid)?;
        let mut inner = branch.lock();
        if inner.has_active_sessions() {
            return Err(associated_sessions(xid));
        }
        if !matches!(
            inner.state,
            BranchState::HeuristicCommit | BranchState::HeuristicRollback
        ) {
            return Err(ValidationError::precondition_failed(format!(
                "Branch is not heuristically complete, hence unable to forget. Xid {}",
                xid
            ))
            .into());
        }
        inner.state = BranchState::Forgotten;
        drop(inner);
        self.unregister(xid);
        Ok(())
    }

    /// Complete a prepared branch without the transaction manager. The
    /// branch stays registered until it is forgotten.
    pub fn heuristic_complete(
        &self,
        xid: &Xid,
        commit: bool,
        resource: &dyn TransactionalResource,
    ) -> TransactionResult<()> {
        let branch = self.live(xid)?;
        let mut inner = branch.lock();
        if !inner.is_prepared() {
            return Err(ValidationError::precondition_failed(format!(
                "Cannot heuristically complete a branch in state {}",
                inner.state
            ))
            .into());
        }
        if commit {
            resource.commit(xid, &inner.work, true)?;
            inner.state = BranchState::HeuristicCommit;
        } else {
            resource.rollback(xid, &inner.work, true)?;
            inner.state = BranchState::HeuristicRollback;
        }
        inner.work = BranchWork::default();
        warn!(xid = %xid, state = %inner.state, "Branch completed heuristically");
        Ok(())
    }

    pub fn set_timeout(&self, xid: &Xid, timeout: Duration) -> TransactionResult<()> {
        self.live(xid)?.set_timeout(timeout);
        Ok(())
    }

    /// Xids of prepared branches, including those restored from storage
    pub fn recover(&self) -> Vec<Xid> {
        let mut xids = self
            .branches
            .iter()
            .filter(|entry| entry.value().is_prepared())
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        xids.extend(self.stored.iter().map(|xid| xid.clone()));
        xids
    }

    /// Time out every active branch past its deadline and roll back its
    /// work. Expired branches stay registered so the next operation on them
    /// reports the timeout.
    pub fn expire_timed_out(&self, resource: &dyn TransactionalResource) -> Vec<Xid> {
        let now = Instant::now();
        let candidates = self
            .branches
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>();

        let mut expired = Vec::new();
        for branch in candidates {
            let mut inner = branch.lock();
            if !inner.expire_if_due(now) {
                continue;
            }
            let work = std::mem::take(&mut inner.work);
            drop(inner);
            if let Err(e) = resource.rollback(branch.xid(), &work, false) {
                warn!(xid = %branch.xid(), error = %e, "Failed to roll back timed out branch");
            }
            info!(xid = %branch.xid(), "Branch timed out");
            expired.push(branch.xid().clone());
        }
        expired
    }
}

fn associated_sessions(xid: &Xid) -> TransactionError {
    ValidationError::precondition_failed(format!("{}{}", ASSOCIATED_SESSIONS, xid)).into()
}

fn one_phase_on_prepared(xid: &Xid) -> TransactionError {
    ValidationError::precondition_failed(format!(
        "Cannot call one-phase commit on a prepared branch for xid {}",
        xid
    ))
    .into()
}
