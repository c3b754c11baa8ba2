//! # Broker Metrics
//!
//! Lock-free counters updated on the message path and read by the periodic
//! reporter and by admin getters.
//!
//! - **Throughput**: published, delivered, acknowledged and rejected messages
//! - **Persistence**: batches and operations written by the persistence
//!   pipeline, operations cancelled by the event matcher, batch retries
//! - **Broker**: active connections, channels and consumers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use amqbroker::metrics::MetricsRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let metrics = Arc::new(MetricsRegistry::new());
//!     Arc::clone(&metrics).start_reporting(Duration::from_secs(60));
//!
//!     metrics.throughput.record_published(1, 512);
//!     let snapshot = metrics.snapshot();
//!     println!("{}", snapshot.to_json().unwrap());
//! }
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

/// Ensure hot counters sit on their own cache line
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

#[derive(Debug)]
pub struct MetricsRegistry {
    pub throughput: Arc<ThroughputMetrics>,
    pub storage: Arc<StorageMetrics>,
    pub broker: Arc<BrokerMetrics>,
    started: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            throughput: Arc::new(ThroughputMetrics::default()),
            storage: Arc::new(StorageMetrics::default()),
            broker: Arc::new(BrokerMetrics::default()),
            started: Instant::now(),
        }
    }

    /// Log a report every `period` until the returned task is aborted.
    pub fn start_reporting(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.report();
            }
        })
    }

    pub fn report(&self) {
        let snapshot = self.snapshot();
        info!("=== Broker Metrics Report ===");
        info!(
            "Messages: published={}, delivered={}, acknowledged={}, rejected={}",
            snapshot.throughput.published,
            snapshot.throughput.delivered,
            snapshot.throughput.acknowledged,
            snapshot.throughput.rejected
        );
        info!(
            "Persistence: batches={}, operations={}, cancelled={}, retries={}, failed={}",
            snapshot.storage.persisted_batches,
            snapshot.storage.persisted_operations,
            snapshot.storage.cancelled_operations,
            snapshot.storage.batch_retries,
            snapshot.storage.failed_operations
        );
        info!(
            "Active connections: {}, channels: {}, consumers: {}",
            snapshot.broker.active_connections,
            snapshot.broker.active_channels,
            snapshot.broker.active_consumers
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.started.elapsed().as_secs(),
            throughput: ThroughputSnapshot {
                published: self.throughput.published(),
                delivered: self.throughput.delivered(),
                acknowledged: self.throughput.acknowledged(),
                rejected: self.throughput.rejected(),
                bytes_published: self.throughput.bytes_published.0.load(Ordering::Acquire),
            },
            storage: StorageSnapshot {
                persisted_batches: self.storage.persisted_batches.load(Ordering::Acquire),
                persisted_operations: self.storage.persisted_operations.load(Ordering::Acquire),
                cancelled_operations: self.storage.cancelled_operations(),
                batch_retries: self.storage.batch_retries.load(Ordering::Acquire),
                failed_operations: self.storage.failed_operations.load(Ordering::Acquire),
            },
            broker: BrokerSnapshot {
                active_connections: self.broker.active_connections(),
                active_channels: self.broker.active_channels.load(Ordering::Acquire),
                active_consumers: self.broker.active_consumers(),
            },
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ThroughputMetrics {
    published: CacheLineAligned<AtomicU64>,
    bytes_published: CacheLineAligned<AtomicU64>,
    delivered: CacheLineAligned<AtomicU64>,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
}

impl ThroughputMetrics {
    #[inline(always)]
    pub fn record_published(&self, count: u64, bytes: u64) {
        self.published.0.fetch_add(count, Ordering::Release);
        self.bytes_published.0.fetch_add(bytes, Ordering::Release);
    }

    #[inline(always)]
    pub fn record_delivered(&self) {
        self.delivered.0.fetch_add(1, Ordering::Release);
    }

    pub fn record_acknowledged(&self, count: u64) {
        self.acknowledged.fetch_add(count, Ordering::Release);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Release);
    }

    pub fn published(&self) -> u64 {
        self.published.0.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.0.load(Ordering::Acquire)
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Acquire)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Acquire)
    }
}

/// Counters fed by the persistence pipeline threads
#[derive(Debug, Default)]
pub struct StorageMetrics {
    persisted_batches: AtomicU64,
    persisted_operations: AtomicU64,
    cancelled_operations: AtomicU64,
    batch_retries: AtomicU64,
    failed_operations: AtomicU64,
}

impl StorageMetrics {
    pub fn record_batch(&self, operations: u64) {
        self.persisted_batches.fetch_add(1, Ordering::Release);
        self.persisted_operations
            .fetch_add(operations, Ordering::Release);
    }

    pub fn record_cancelled(&self, operations: u64) {
        self.cancelled_operations
            .fetch_add(operations, Ordering::Release);
    }

    pub fn record_retry(&self) {
        self.batch_retries.fetch_add(1, Ordering::Release);
    }

    pub fn record_failed(&self, operations: u64) {
        self.failed_operations.fetch_add(operations, Ordering::Release);
    }

    pub fn persisted_operations(&self) -> u64 {
        self.persisted_operations.load(Ordering::Acquire)
    }

    pub fn cancelled_operations(&self) -> u64 {
        self.cancelled_operations.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    active_connections: CacheLineAligned<AtomicUsize>,
    active_channels: AtomicUsize,
    active_consumers: AtomicUsize,
}

impl BrokerMetrics {
    pub fn connection_opened(&self) {
        self.active_connections.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn connection_closed(&self) {
        self.active_connections.0.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn channel_opened(&self) {
        self.active_channels.fetch_add(1, Ordering::AcqRel);
    }

    pub fn channel_closed(&self) {
        self.active_channels.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn consumer_added(&self) {
        self.active_consumers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn consumer_removed(&self) {
        self.active_consumers.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.0.load(Ordering::Acquire)
    }

    pub fn active_consumers(&self) -> usize {
        self.active_consumers.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub throughput: ThroughputSnapshot,
    pub storage: StorageSnapshot,
    pub broker: BrokerSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub bytes_published: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageSnapshot {
    pub persisted_batches: u64,
    pub persisted_operations: u64,
    pub cancelled_operations: u64,
    pub batch_retries: u64,
    pub failed_operations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub active_connections: usize,
    pub active_channels: usize,
    pub active_consumers: usize,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export metrics in the Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let mut line = |name: &str, value: String| {
            output.push_str(&format!("amqbroker_{} {}\n", name, value));
        };

        line("messages_published_total", self.throughput.published.to_string());
        line("messages_delivered_total", self.throughput.delivered.to_string());
        line("messages_acknowledged_total", self.throughput.acknowledged.to_string());
        line("messages_rejected_total", self.throughput.rejected.to_string());
        line("bytes_published_total", self.throughput.bytes_published.to_string());
        line("persisted_batches_total", self.storage.persisted_batches.to_string());
        line("persisted_operations_total", self.storage.persisted_operations.to_string());
        line("cancelled_operations_total", self.storage.cancelled_operations.to_string());
        line("batch_retries_total", self.storage.batch_retries.to_string());
        line("failed_operations_total", self.storage.failed_operations.to_string());
        line("connections_active", self.broker.active_connections.to_string());
        line("channels_active", self.broker.active_channels.to_string());
        line("consumers_active", self.broker.active_consumers.to_string());
        line("uptime_seconds", self.uptime_seconds.to_string());
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_flow_into_snapshot() {
        let metrics = MetricsRegistry::new();
        metrics.throughput.record_published(3, 300);
        metrics.throughput.record_delivered();
        metrics.throughput.record_acknowledged(1);
        metrics.storage.record_batch(4);
        metrics.storage.record_cancelled(2);
        metrics.broker.connection_opened();
        metrics.broker.consumer_added();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.throughput.published, 3);
        assert_eq!(snapshot.throughput.bytes_published, 300);
        assert_eq!(snapshot.storage.persisted_operations, 4);
        assert_eq!(snapshot.storage.cancelled_operations, 2);
        assert_eq!(snapshot.broker.active_connections, 1);
        assert_eq!(snapshot.broker.active_consumers, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = MetricsRegistry::new();
        metrics.throughput.record_published(2, 10);
        let text = metrics.snapshot().to_prometheus();
        assert!(text.contains("amqbroker_messages_published_total 2\n"));
        assert!(text.contains("amqbroker_connections_active 0\n"));

        let json = metrics.snapshot().to_json().unwrap();
        assert!(json.contains("\"published\": 2"));
    }
}
