use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

use super::Xid;
use crate::store::{TxDequeue, TxEnqueue};
use crate::ValidationError;

/// Lifecycle of a transaction branch.
///
/// ```text
/// Active ──prepare──> Prepared ──commit──> Committed
///   │ │                    └──rollback──> RolledBack
///   │ └─end(fail)──> RollbackOnly ──rollback──> RolledBack
///   └─deadline passed──> TimedOut
/// Prepared ──heuristic outcome──> HeuristicCommit | HeuristicRollback ──forget──> Forgotten
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Active,
    RollbackOnly,
    Prepared,
    Committed,
    RolledBack,
    TimedOut,
    Forgotten,
    HeuristicCommit,
    HeuristicRollback,
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BranchState::Active => "ACTIVE",
            BranchState::RollbackOnly => "ROLLBACK_ONLY",
            BranchState::Prepared => "PREPARED",
            BranchState::Committed => "COMMITTED",
            BranchState::RolledBack => "ROLLED_BACK",
            BranchState::TimedOut => "TIMED_OUT",
            BranchState::Forgotten => "FORGOTTEN",
            BranchState::HeuristicCommit => "HEUR_COM",
            BranchState::HeuristicRollback => "HEUR_RB",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Suspended,
}

/// Publishes and acknowledgements staged by a branch
#[derive(Debug, Clone, Default)]
pub struct BranchWork {
    pub enqueues: Vec<TxEnqueue>,
    pub dequeues: Vec<TxDequeue>,
}

impl BranchWork {
    pub fn is_empty(&self) -> bool {
        self.enqueues.is_empty() && self.dequeues.is_empty()
    }
}

#[derive(Debug)]
pub(crate) struct BranchInner {
    pub(crate) state: BranchState,
    sessions: HashMap<u64, SessionState>,
    pub(crate) work: BranchWork,
    deadline: Option<Instant>,
    /// Known only from a prepared record found in storage
    pub(crate) recovered: bool,
}

impl BranchInner {
    pub(crate) fn has_active_sessions(&self) -> bool {
        self.sessions.values().any(|s| *s == SessionState::Active)
    }

    pub(crate) fn clear_sessions(&mut self) {
        self.sessions.clear();
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.state == BranchState::Prepared
    }

    /// Move an active branch past its deadline to `TimedOut`. Prepared
    /// branches never expire.
    pub(crate) fn expire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if self.state == BranchState::Active && now >= deadline => {
                self.state = BranchState::TimedOut;
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// One participant of a transaction, identified by its [`Xid`].
///
/// All state lives behind one mutex so a timeout firing concurrently with a
/// prepare or commit is resolved by whoever takes the lock first.
#[derive(Debug)]
pub struct Branch {
    xid: Xid,
    inner: Mutex<BranchInner>,
}

impl Branch {
    pub fn new(xid: Xid) -> Self {
        Self::with_state(xid, BranchState::Active, false)
    }

    /// Branch restored from a prepared record in storage
    pub fn recovered(xid: Xid) -> Self {
        Self::with_state(xid, BranchState::Prepared, true)
    }

    fn with_state(xid: Xid, state: BranchState, recovered: bool) -> Self {
        Self {
            xid,
            inner: Mutex::new(BranchInner {
                state,
                sessions: HashMap::new(),
                work: BranchWork::default(),
                deadline: None,
                recovered,
            }),
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn state(&self) -> BranchState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: BranchState) {
        self.inner.lock().state = state;
    }

    /// Mark an active branch rollback-only. Returns false in any other state.
    pub fn mark_rollback_only(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != BranchState::Active {
            return false;
        }
        inner.state = BranchState::RollbackOnly;
        true
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, BranchInner> {
        self.inner.lock()
    }

    pub fn enqueue(&self, enqueue: TxEnqueue) -> Result<(), ValidationError> {
        let mut inner = self.inner.lock();
        Self::check_open(&self.xid, inner.state)?;
        inner.work.enqueues.push(enqueue);
        Ok(())
    }

    pub fn dequeue(&self, dequeue: TxDequeue) -> Result<(), ValidationError> {
        let mut inner = self.inner.lock();
        Self::check_open(&self.xid, inner.state)?;
        inner.work.dequeues.push(dequeue);
        Ok(())
    }

    fn check_open(xid: &Xid, state: BranchState) -> Result<(), ValidationError> {
        match state {
            BranchState::Active | BranchState::RollbackOnly => Ok(()),
            other => Err(ValidationError::precondition_failed(format!(
                "Cannot add work to branch in state {} for xid {}",
                other, xid
            ))),
        }
    }

    pub fn work_size(&self) -> usize {
        let inner = self.inner.lock();
        inner.work.enqueues.len() + inner.work.dequeues.len()
    }

    pub fn associate_session(&self, session_id: u64) {
        self.inner
            .lock()
            .sessions
            .insert(session_id, SessionState::Active);
    }

    pub fn resume_session(&self, session_id: u64) -> Result<(), ValidationError> {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(&session_id) {
            Some(state) if *state == SessionState::Suspended => {
                *state = SessionState::Active;
                Ok(())
            }
            _ => Err(ValidationError::precondition_failed(format!(
                "Couldn't resume session for branch with xid {} and session id {}",
                self.xid, session_id
            ))),
        }
    }

    pub fn suspend_session(&self, session_id: u64) {
        if let Some(state) = self.inner.lock().sessions.get_mut(&session_id) {
            *state = SessionState::Suspended;
        }
    }

    pub fn disassociate_session(&self, session_id: u64) {
        self.inner.lock().sessions.remove(&session_id);
    }

    pub fn is_associated(&self, session_id: u64) -> bool {
        self.inner.lock().sessions.contains_key(&session_id)
    }

    pub fn has_active_sessions(&self) -> bool {
        self.inner.lock().has_active_sessions()
    }

    /// Arm the timeout. Zero leaves the branch without a deadline change.
    pub fn set_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.deadline = Some(Instant::now() + timeout);
        debug!(xid = %self.xid, ?timeout, "Branch timeout set");
    }

    pub fn expire_if_due(&self, now: Instant) -> bool {
        self.inner.lock().expire_if_due(now)
    }

    pub fn is_expired(&self) -> bool {
        self.state() == BranchState::TimedOut
    }

    pub fn is_prepared(&self) -> bool {
        self.inner.lock().is_prepared()
    }

    pub fn is_recovered(&self) -> bool {
        self.inner.lock().recovered
    }

    pub(crate) fn take_work(&self) -> BranchWork {
        std::mem::take(&mut self.inner.lock().work)
    }
}
