//! # amqbroker Core Library
//!
//! amqbroker is an AMQP 0-9-1 compatible message broker written in Rust.
//! This crate holds the broker core: everything between the TCP socket and
//! the storage backend.
//!
//! ## Architecture Overview
//!
//! - [`protocol`] - frame codec, method registry and field tables
//! - [`broker`] - TCP server, connection and channel handlers, exchanges and queues
//! - [`queue`] - bounded in-memory queue buffers backed by the message store
//! - [`store`] - batched persistence pipeline with operation cancellation
//! - [`transaction`] - local (`tx`) and distributed XA (`dtx`) transactions
//! - [`flow`] - per-channel publisher flow control
//! - [`auth`] - SASL authentication
//! - [`metrics`] - lock-free counters and periodic reports
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use amqbroker::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default().with_address("0.0.0.0", 5672);
//!     let server = BrokerServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod broker;
pub mod config;
pub mod flow;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod topic_matcher;
pub mod transaction;

pub use auth::{AuthMechanism, Authenticator, CredentialStore};
pub use broker::{BrokerCore, BrokerServer};
pub use config::BrokerConfig;
pub use flow::{ChannelFlowManager, FrameSink};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use protocol::{AmqpCodec, DecodeError, Frame, Method};
pub use queue::{Message, MessageData, Metadata, QueueBuffer};
pub use store::{InMemoryAdapter, JournalAdapter, MessageStore, StorageAdapter, StorageError};
pub use transaction::{TransactionError, TransactionResult, Xid};

use thiserror::Error;

/// Errors caused by a client request that violates the protocol or the
/// broker's state.
///
/// They never bring the broker down: the offending channel is closed with
/// `reply_code` and the reason as reply text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reply_code: u16,
    pub reason: String,
}

impl ValidationError {
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const COMMAND_INVALID: u16 = 503;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const NOT_ALLOWED: u16 = 530;
    pub const NOT_IMPLEMENTED: u16 = 540;
    pub const INTERNAL_ERROR: u16 = 541;

    pub fn new(reply_code: u16, reason: impl Into<String>) -> Self {
        Self {
            reply_code,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, reason)
    }

    pub fn access_refused(reason: impl Into<String>) -> Self {
        Self::new(Self::ACCESS_REFUSED, reason)
    }

    pub fn resource_locked(reason: impl Into<String>) -> Self {
        Self::new(Self::RESOURCE_LOCKED, reason)
    }

    pub fn precondition_failed(reason: impl Into<String>) -> Self {
        Self::new(Self::PRECONDITION_FAILED, reason)
    }

    pub fn command_invalid(reason: impl Into<String>) -> Self {
        Self::new(Self::COMMAND_INVALID, reason)
    }

    pub fn channel_error(reason: impl Into<String>) -> Self {
        Self::new(Self::CHANNEL_ERROR, reason)
    }

    pub fn not_allowed(reason: impl Into<String>) -> Self {
        Self::new(Self::NOT_ALLOWED, reason)
    }

    pub fn not_implemented(reason: impl Into<String>) -> Self {
        Self::new(Self::NOT_IMPLEMENTED, reason)
    }

    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, reason)
    }

    /// Reply text for `channel.close`, limited to a short string
    pub fn reply_text(&self) -> String {
        let mut text = self.reason.clone();
        if text.len() > 255 {
            let mut end = 255;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        text
    }
}

/// Reason a non-blocking publish into the broker was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// The queue's indelible region is at its limit
    IndelibleRegionFull,
    /// Every persistence ring slot is taken
    RingBufferFull,
}

/// amqbroker error types
///
/// Client faults surface as [`BrokerError::Validation`] and stay confined to
/// a channel; the other variants are broker or transport faults.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl BrokerError {
    /// Client-visible form, if the error was caused by the client
    pub fn as_validation(&self) -> Option<ValidationError> {
        match self {
            BrokerError::Validation(e) => Some(e.clone()),
            BrokerError::Transaction(e) if e.is_validation() => Some(e.to_validation()),
            _ => None,
        }
    }
}

/// Result type alias for amqbroker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_codes() {
        let err = ValidationError::precondition_failed("queue in use");
        assert_eq!(err.reply_code, 406);
        assert_eq!(err.to_string(), "queue in use");

        let long = ValidationError::not_found("x".repeat(300));
        assert_eq!(long.reply_text().len(), 255);
    }

    #[test]
    fn test_transaction_errors_map_to_validation() {
        let xid = Xid::new(1, "g", "b");
        let err = BrokerError::from(TransactionError::UnknownBranch(xid));
        assert_eq!(err.as_validation().unwrap().reply_code, 404);

        let err = BrokerError::from(TransactionError::Storage(StorageError::Halted));
        assert!(err.as_validation().is_none());
    }
}
