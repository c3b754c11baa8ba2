//! Broker Transaction Support
//!
//! Local (`tx.select`) and distributed XA (`dtx.select`) transactions share
//! one engine: every transaction is a [`Branch`] indexed by its [`Xid`] in a
//! [`Registry`]. Publishes and acks made inside a transaction are staged on
//! the branch and only reach the queues and the message store when the
//! branch commits.
//!
//! ## Branch lifecycle
//!
//! - `start` registers an `Active` branch and associates the channel session
//! - `end` suspends or disassociates the session, `fail` marks the branch
//!   rollback-only
//! - `prepare` writes a prepared record; prepared branches never time out
//! - `commit` runs one-phase on active branches or two-phase on prepared ones
//! - a periodic sweep moves expired active branches to `TimedOut` and rolls
//!   their work back
//!
//! The side effects of an outcome are delegated to a
//! [`TransactionalResource`], implemented by the broker.

pub mod branch;
pub mod distributed;
pub mod local;
pub mod registry;
pub mod xid;

pub use branch::{Branch, BranchState, BranchWork};
pub use distributed::DistributedTransaction;
pub use local::{dtx_on_local_channel, LocalTransaction};
pub use registry::Registry;
pub use xid::Xid;

use thiserror::Error;

use crate::store::StorageError;
use crate::ValidationError;

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Branch not found with xid {0}")]
    UnknownBranch(Xid),

    #[error("Transaction timed out for xid {0}")]
    TimedOut(Xid),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TransactionError {
    /// Whether the client caused the error. Storage failures are broker
    /// faults.
    pub fn is_validation(&self) -> bool {
        !matches!(self, TransactionError::Storage(_))
    }

    /// Client-visible form of the error
    pub fn to_validation(&self) -> ValidationError {
        match self {
            TransactionError::Validation(e) => e.clone(),
            TransactionError::UnknownBranch(_) => ValidationError::not_found(self.to_string()),
            TransactionError::TimedOut(_) => ValidationError::precondition_failed(self.to_string()),
            TransactionError::Storage(_) => ValidationError::internal_error(self.to_string()),
        }
    }
}

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Applies the outcome of a branch to queues and storage.
pub trait TransactionalResource: Send + Sync {
    fn prepare(&self, xid: &Xid, work: &BranchWork) -> Result<(), StorageError>;

    fn commit(&self, xid: &Xid, work: &BranchWork, prepared: bool) -> Result<(), StorageError>;

    /// Undo staged work: acknowledged messages go back to their queues.
    fn rollback(&self, xid: &Xid, work: &BranchWork, prepared: bool) -> Result<(), StorageError>;

    /// Commit a prepared transaction only known from storage
    fn commit_recovered(&self, xid: &Xid) -> Result<(), StorageError>;

    fn rollback_recovered(&self, xid: &Xid) -> Result<(), StorageError>;
}
