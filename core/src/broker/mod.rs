//! # Broker Module
//!
//! This module ties the protocol, the queues and the message store together
//! into a running AMQP broker.
//!
//! ## Architecture
//!
//! - [`server`] - TCP server that accepts clients and runs one task per
//!   connection
//! - [`connection`] - connection negotiation (start, tune, open, close) and
//!   channel multiplexing
//! - [`channel`] - per-channel command handling: publishing, consuming,
//!   acknowledgements and transactions
//! - [`core`] - the shared broker state: exchanges, queues, the message store
//!   and the distributed transaction registry
//! - [`exchange`] - direct and topic exchanges and their bindings
//! - [`queue`] - queue handlers delivering messages to consumers
//!
//! ## Message Flow
//!
//! A published message is assembled by its channel from the method, header
//! and body frames, routed by [`BrokerCore`] through the target exchange,
//! handed to the message store when at least one durable queue holds it, and
//! finally enqueued on every matching [`QueueHandler`]. Each queue delivers to
//! its ready consumers round-robin.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use amqbroker::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default()
//!         .with_address("0.0.0.0", 5672)
//!         .with_data_dir("./data");
//!
//!     let server = BrokerServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod core;
pub mod exchange;
pub mod queue;
pub mod server;

pub use channel::AmqpChannel;
pub use connection::{AmqpConnection, ConnectionAction, ConnectionState};
pub use self::core::BrokerCore;
pub use exchange::{Exchange, ExchangeRegistry, ExchangeType};
pub use queue::{Consumer, QueueHandler};
pub use server::BrokerServer;
